//! Device list reconciler
//!
//! Recovers Added/Removed from a backend that can only say "the device list
//! changed". A fresh enumeration is diffed against the directory by stable id,
//! so a device that re-appears under a new platform handle is neither added nor
//! removed.
//!
//! ```text
//!   enumerate()  (no lock)
//!        │
//!        ▼
//!   directory.write ──► diff by id ──► registry.enqueue(Added/Removed)
//!        │
//!        ▼
//!   watch/unwatch liveness  (no lock)  ──►  registry.flush()
//! ```
//!
//! Every pass takes a ticket before enumerating. A pass whose ticket is older
//! than the last one applied is discarded, so two overlapping reconciles can
//! never roll the directory back to an older device set.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::audio::context::AudioContext;
use crate::audio::error::Result;
use crate::audio::snapshot::from_record;
use crate::audio::types::*;

/// What one reconcile pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Directions whose active device was among the removed
    pub orphaned: Vec<Direction>,
    /// Known devices this enumeration reported as no longer connected
    pub disconnected: Vec<String>,
    /// The pass was superseded by a newer enumeration and applied nothing
    pub stale: bool,
}

impl ReconcileOutcome {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

struct FreshEntry {
    handle: PlatformHandle,
    /// `None` when the name could not be read this pass
    device: Option<AudioDevice>,
}

pub struct Reconciler<'a> {
    ctx: &'a AudioContext,
}

impl<'a> Reconciler<'a> {
    pub fn new(ctx: &'a AudioContext) -> Self {
        Self { ctx }
    }

    /// Initial fill of an empty directory; emits no events
    pub fn populate(&self) -> Result<usize> {
        let ctx = self.ctx;
        let ticket = ctx.next_ticket();
        let records = ctx.backend.enumerate()?;

        let snapshot = ctx.snapshot();
        let defaults = snapshot.defaults();
        let devices: Vec<(AudioDevice, PlatformHandle)> = records
            .iter()
            .filter_map(|record| snapshot.build(record, &defaults).map(|d| (d, record.handle)))
            .collect();
        let handles: Vec<PlatformHandle> = devices.iter().map(|(_, handle)| *handle).collect();
        let count = devices.len();

        ctx.directory.write(|txn| {
            txn.replace_all(devices, defaults);
            txn.set_applied_ticket(ticket);
        });

        if ctx.config.track_liveness {
            for handle in handles {
                ctx.backend.watch_liveness(handle);
            }
        }

        info!("[{}] Directory populated with {} devices", ctx.tag(), count);
        Ok(count)
    }

    /// Re-enumerate and diff against the directory
    ///
    /// Fails only when the enumeration itself fails; the directory is left
    /// untouched in that case.
    pub fn reconcile(&self) -> Result<ReconcileOutcome> {
        let ctx = self.ctx;
        let ticket = ctx.next_ticket();
        let records = ctx.backend.enumerate()?;

        // Activity is recomputed from the directory markers on upsert
        let no_defaults = ActiveIds::default();
        let assume_connected = ctx.config.assume_connected_when_unknown;

        let mut fresh: BTreeMap<String, FreshEntry> = BTreeMap::new();
        for record in &records {
            if !record.has_input_streams && !record.has_output_streams {
                debug!("[{}] Ignoring {} ({}): no streams", ctx.tag(), record.id, record.handle);
                continue;
            }
            fresh.insert(
                record.id.clone(),
                FreshEntry {
                    handle: record.handle,
                    device: from_record(record, &no_defaults, assume_connected),
                },
            );
        }

        let mut watch = Vec::new();
        let mut unwatch = Vec::new();

        let outcome = ctx.directory.write(|txn| {
            if ticket < txn.applied_ticket() {
                return ReconcileOutcome {
                    stale: true,
                    ..ReconcileOutcome::default()
                };
            }
            txn.set_applied_ticket(ticket);

            let known = txn.ids();
            let mut outcome = ReconcileOutcome::default();

            let mut gone: Vec<String> = known
                .iter()
                .filter(|id| !fresh.contains_key(id.as_str()))
                .cloned()
                .collect();
            gone.sort();

            for id in gone {
                let was_active: Vec<Direction> = Direction::ALL
                    .into_iter()
                    .filter(|&d| txn.active(d) == Some(id.as_str()))
                    .collect();
                if let Some(handle) = txn.handle_of(&id) {
                    unwatch.push(handle);
                }
                if let Some(last_known) = txn.remove(&id) {
                    ctx.registry.enqueue(DeviceEvent::removed(last_known));
                    outcome.orphaned.extend(was_active);
                    outcome.removed.push(id);
                }
            }

            for (id, entry) in fresh {
                let is_known = known.contains(&id);
                match entry.device {
                    Some(device) => {
                        let was_connected = txn.get(&id).map(|d| d.is_connected);
                        let connected = device.is_connected;
                        txn.upsert(device);
                        // Same rule as a liveness signal: report the loss once
                        if was_connected == Some(true) && !connected {
                            if let Some(snapshot) = txn.get(&id).cloned() {
                                ctx.registry.enqueue(DeviceEvent::disconnected(snapshot));
                            }
                            outcome.disconnected.push(id.clone());
                        }
                    }
                    None if is_known => {
                        debug!("[{}] Name of {} unreadable, keeping last-known entry", ctx.tag(), id);
                    }
                    None => {
                        debug!("[{}] Skipping new device {}: name unreadable", ctx.tag(), id);
                        continue;
                    }
                }

                let previous = txn.set_handle(&id, entry.handle);
                if is_known {
                    if previous != Some(entry.handle) {
                        debug!(
                            "[{}] {} moved to handle {} (same device)",
                            ctx.tag(),
                            id,
                            entry.handle
                        );
                        unwatch.extend(previous);
                        watch.push(entry.handle);
                    }
                } else {
                    if let Some(device) = txn.get(&id).cloned() {
                        ctx.registry.enqueue(DeviceEvent::added(device));
                    }
                    watch.push(entry.handle);
                    outcome.added.push(id);
                }
            }

            outcome
        });

        if outcome.stale {
            debug!("[{}] Discarding superseded enumeration #{}", ctx.tag(), ticket);
            return Ok(outcome);
        }

        if ctx.config.track_liveness {
            for handle in unwatch {
                ctx.backend.unwatch_liveness(handle);
            }
            for handle in watch {
                ctx.backend.watch_liveness(handle);
            }
        }

        ctx.registry.flush();

        if !outcome.is_unchanged() {
            info!(
                "[{}] Device list changed: +{:?} -{:?}",
                ctx.tag(),
                outcome.added,
                outcome.removed
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::error::AudioControlError;
    use crate::audio::test_support::{capture, record, FakeBackend};
    use crate::config::AudioControlConfig;
    use std::sync::Arc;

    fn setup(devices: Vec<crate::audio::backend::EndpointRecord>) -> (Arc<FakeBackend>, AudioContext) {
        let backend = Arc::new(FakeBackend::coarse());
        backend.set_devices(devices);
        let ctx = AudioContext::new(backend.clone(), AudioControlConfig::default());
        (backend, ctx)
    }

    #[test]
    fn test_populate_emits_nothing_and_watches_devices() {
        let (backend, ctx) = setup(vec![record("a", 1, false, true), record("b", 2, true, false)]);
        backend.set_default_output(Some("a"));
        let (handler, rx) = capture();
        ctx.registry.set_handler(handler);

        assert_eq!(ctx.reconciler().populate().unwrap(), 2);
        assert!(rx.try_recv().is_err());
        assert!(ctx.directory.get("a").unwrap().is_active);
        assert!(backend.is_watching(1) && backend.is_watching(2));
    }

    #[test]
    fn test_unchanged_set_is_idempotent() {
        let (backend, ctx) = setup(vec![record("out1", 1, false, true)]);
        let (handler, rx) = capture();
        ctx.registry.set_handler(handler);
        ctx.reconciler().populate().unwrap();

        backend.add_device(record("out2", 2, false, true));
        let first = ctx.reconciler().reconcile().unwrap();
        assert_eq!(first.added, vec!["out2"]);
        assert_eq!(rx.try_iter().count(), 1);

        let second = ctx.reconciler().reconcile().unwrap();
        assert!(second.is_unchanged());
        assert_eq!(rx.try_iter().count(), 0);
        assert_eq!(backend.enumerate_calls(), 3);
    }

    #[test]
    fn test_diff_reports_removed_and_added() {
        let (backend, ctx) = setup(vec![record("A", 1, false, true), record("B", 2, false, true)]);
        let (handler, rx) = capture();
        ctx.registry.set_handler(handler);
        ctx.reconciler().populate().unwrap();

        backend.set_devices(vec![record("B", 2, false, true), record("C", 3, false, true)]);
        ctx.reconciler().reconcile().unwrap();

        let events: Vec<DeviceEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 2);
        let removed = events.iter().find(|e| e.kind == DeviceEventKind::Removed).unwrap();
        assert_eq!(removed.device_id, "A");
        // Last-known snapshot survives removal
        assert_eq!(removed.device.as_ref().unwrap().name, "Device A");
        let added = events.iter().find(|e| e.kind == DeviceEventKind::Added).unwrap();
        assert_eq!(added.device_id, "C");

        let ids: Vec<String> = ctx.directory.all().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["B", "C"]);
        assert!(!backend.is_watching(1));
        assert!(backend.is_watching(3));
    }

    #[test]
    fn test_handle_churn_is_not_a_change() {
        let (backend, ctx) = setup(vec![record("usb", 10, true, true)]);
        let (handler, rx) = capture();
        ctx.registry.set_handler(handler);
        ctx.reconciler().populate().unwrap();

        backend.set_devices(vec![record("usb", 11, true, true)]);
        let outcome = ctx.reconciler().reconcile().unwrap();

        assert!(outcome.is_unchanged());
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.directory.id_for_handle(PlatformHandle::new(11)).as_deref(), Some("usb"));
        assert!(backend.is_watching(11));
        assert!(!backend.is_watching(10));
    }

    #[test]
    fn test_unreadable_names_skip_new_and_keep_known() {
        let (backend, ctx) = setup(vec![record("known", 1, false, true)]);
        let (handler, rx) = capture();
        ctx.registry.set_handler(handler);
        ctx.reconciler().populate().unwrap();

        let mut known = record("known", 1, false, true);
        known.name = None;
        let mut fresh = record("fresh", 2, false, true);
        fresh.name = None;
        backend.set_devices(vec![known, fresh]);

        let outcome = ctx.reconciler().reconcile().unwrap();
        assert!(outcome.is_unchanged());
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.directory.get("known").unwrap().name, "Device known");
        assert!(ctx.directory.get("fresh").is_none());
    }

    #[test]
    fn test_dead_known_device_reports_disconnect_once() {
        let (backend, ctx) = setup(vec![record("out1", 1, false, true)]);
        let (handler, rx) = capture();
        ctx.registry.set_handler(handler);
        ctx.reconciler().populate().unwrap();

        backend.set_liveness("out1", Liveness::Dead);
        let outcome = ctx.reconciler().reconcile().unwrap();
        assert_eq!(outcome.disconnected, vec!["out1"]);
        assert!(outcome.is_unchanged());

        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, DeviceEventKind::Disconnected);
        assert!(!event.device.unwrap().is_connected);
        assert!(!ctx.directory.get("out1").unwrap().is_connected);

        // Still dead: nothing new; alive again: silent
        ctx.reconciler().reconcile().unwrap();
        backend.set_liveness("out1", Liveness::Alive);
        ctx.reconciler().reconcile().unwrap();
        assert!(rx.try_recv().is_err());
        assert!(ctx.directory.get("out1").unwrap().is_connected);
    }

    #[test]
    fn test_streamless_devices_never_enter() {
        let (backend, ctx) = setup(vec![]);
        ctx.reconciler().populate().unwrap();

        backend.set_devices(vec![record("aggregate", 5, false, false)]);
        let outcome = ctx.reconciler().reconcile().unwrap();
        assert!(outcome.added.is_empty());
        assert!(ctx.directory.is_empty());
    }

    #[test]
    fn test_removing_active_device_reports_orphaned_direction() {
        let (backend, ctx) = setup(vec![record("a", 1, false, true), record("b", 2, false, true)]);
        backend.set_default_output(Some("a"));
        ctx.reconciler().populate().unwrap();

        backend.remove_device("a");
        let outcome = ctx.reconciler().reconcile().unwrap();
        assert_eq!(outcome.orphaned, vec![Direction::Output]);
        assert_eq!(ctx.directory.active(Direction::Output), None);
    }

    #[test]
    fn test_superseded_pass_applies_nothing() {
        let (backend, ctx) = setup(vec![record("a", 1, false, true)]);
        ctx.reconciler().populate().unwrap();
        ctx.directory.write(|txn| txn.set_applied_ticket(1_000));

        backend.set_devices(vec![]);
        let outcome = ctx.reconciler().reconcile().unwrap();
        assert!(outcome.stale);
        assert!(ctx.directory.get("a").is_some());
    }

    #[test]
    fn test_enumeration_failure_leaves_directory_untouched() {
        let (backend, ctx) = setup(vec![record("a", 1, false, true)]);
        ctx.reconciler().populate().unwrap();

        backend.fail_enumeration(true);
        let err = ctx.reconciler().reconcile().unwrap_err();
        assert!(matches!(err, AudioControlError::Enumeration(_)));
        assert_eq!(ctx.directory.len(), 1);
    }
}
