//! Active device resolver
//!
//! Moves the per-direction active marker to whatever the OS reports as the
//! default. `ActiveChanged` is emitted only when the marker actually moves, so
//! redundant default-changed signals are free.
//!
//! When the default id is not in the directory yet (its Added is still
//! pending), a one-shot snapshot is built from the native layer instead of
//! reporting "nothing is active". The marker is set, the device is not
//! inserted; the pending reconcile still owns the Added.
//!
//! Each pass takes a ticket before querying the default. Overlapping passes
//! for one direction apply in ticket order: a pass older than the last one
//! applied changes nothing, so a slow stale query never overwrites a newer
//! default.

use tracing::{debug, warn};

use crate::audio::context::AudioContext;
use crate::audio::error::{AudioControlError, Result};
use crate::audio::types::*;

pub struct Resolver<'a> {
    ctx: &'a AudioContext,
}

impl<'a> Resolver<'a> {
    pub fn new(ctx: &'a AudioContext) -> Self {
        Self { ctx }
    }

    /// Re-resolve the active device for `direction`
    ///
    /// Reactive path: native failures are logged and the current marker is
    /// kept. Returns the marker after resolution.
    pub fn resolve(&self, direction: Direction) -> Option<String> {
        let ctx = self.ctx;
        let ticket = ctx.next_ticket();

        let default = match ctx.backend.get_default(direction) {
            Ok(default) => default,
            Err(e) => {
                warn!("[{}] Default {} query failed: {}", ctx.tag(), direction, e);
                return ctx.directory.active(direction);
            }
        };

        let Some(id) = default else {
            let cleared = ctx
                .directory
                .write(|txn| txn.claim_resolve(direction, ticket) && txn.set_active(direction, None));
            if cleared {
                debug!("[{}] No default {} device", ctx.tag(), direction);
            }
            return ctx.directory.active(direction);
        };

        // Fresh snapshot only when the directory cannot vouch for the id
        let vouched = ctx
            .directory
            .get(&id)
            .map(|device| device.supports(direction))
            .unwrap_or(false);
        let fresh = if vouched {
            None
        } else {
            match ctx.snapshot().build_by_id(&id) {
                Ok(device) => Some(device),
                Err(e) if e.is_not_found() => {
                    debug!("[{}] Default {} {} already gone", ctx.tag(), direction, id);
                    return ctx.directory.active(direction);
                }
                Err(e) => {
                    warn!("[{}] Snapshot of default {} {} failed: {}", ctx.tag(), direction, id, e);
                    return ctx.directory.active(direction);
                }
            }
        };

        let changed = ctx.directory.write(|txn| {
            if !txn.claim_resolve(direction, ticket) {
                debug!("[{}] Discarding superseded default {} query #{}", ctx.tag(), direction, ticket);
                return false;
            }
            let supports = match (&fresh, txn.get(&id)) {
                (Some(device), _) => device.supports(direction),
                (None, Some(device)) => device.supports(direction),
                (None, None) => false,
            };
            if !supports {
                debug!("[{}] Default {} {} has no {} streams", ctx.tag(), direction, id, direction);
                return false;
            }

            // Refresh a stale entry, never insert a missing one
            if let Some(device) = fresh.clone() {
                if txn.contains(&id) {
                    txn.upsert(device);
                }
            }

            if !txn.set_active(direction, Some(&id)) {
                return false;
            }

            let snapshot = match txn.get(&id) {
                Some(device) => device.clone(),
                None => {
                    let mut device = fresh.clone().unwrap_or_else(|| placeholder(&id, direction));
                    device.is_active = true;
                    device
                }
            };
            ctx.registry.enqueue(DeviceEvent::active_changed(snapshot));
            true
        });

        ctx.registry.flush();
        if changed {
            debug!("[{}] Active {} is now {}", ctx.tag(), direction, id);
        }
        ctx.directory.active(direction)
    }

    /// Snapshot of the current default device for `direction`
    ///
    /// Direct-call path: errors propagate, `NotFound` when the OS reports no
    /// default.
    pub fn active_device(&self, direction: Direction) -> Result<AudioDevice> {
        let ctx = self.ctx;
        let id = ctx
            .backend
            .get_default(direction)?
            .ok_or_else(|| AudioControlError::NotFound(format!("no default {} device", direction)))?;

        let mut device = match ctx.directory.get(&id) {
            Some(device) if device.supports(direction) => device,
            _ => ctx.snapshot().build_by_id(&id)?,
        };
        device.is_active = true;
        Ok(device)
    }
}

fn placeholder(id: &str, direction: Direction) -> AudioDevice {
    AudioDevice {
        id: id.to_string(),
        name: id.to_string(),
        supports_input: direction == Direction::Input,
        supports_output: direction == Direction::Output,
        is_active: true,
        is_connected: true,
    }
}
