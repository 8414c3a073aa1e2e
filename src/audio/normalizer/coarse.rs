//! Coarse-signal normalizer (CoreAudio-style)
//!
//! `ListChanged` carries no device identity, so it always becomes a full
//! reconcile. `DefaultChanged` does not say which direction moved, so both are
//! re-resolved. `LivenessChanged` names a platform handle that has to be
//! mapped back to a stable id before anything can be reported.

use tracing::{debug, warn};

use super::{apply_connectivity, EventNormalizer};
use crate::audio::backend::{CoarseSignal, RawNativeEvent, SignalModel};
use crate::audio::context::AudioContext;
use crate::audio::types::*;

#[derive(Debug, Clone, Copy, Default)]
pub struct CoarseNormalizer;

impl CoarseNormalizer {
    fn list_changed(&self, ctx: &AudioContext) {
        match ctx.reconciler().reconcile() {
            Ok(outcome) => {
                for direction in outcome.orphaned {
                    ctx.resolver().resolve(direction);
                }
            }
            Err(e) => warn!("[{}] Re-enumeration failed: {}", ctx.tag(), e),
        }
    }

    fn default_changed(&self, ctx: &AudioContext) {
        for direction in Direction::ALL {
            ctx.resolver().resolve(direction);
        }
    }

    fn liveness_changed(&self, ctx: &AudioContext, handle: Option<PlatformHandle>) {
        let Some(handle) = handle else {
            debug!("[{}] Liveness signal without a handle", ctx.tag());
            return;
        };

        let Some(id) = ctx.directory.id_for_handle(handle) else {
            debug!("[{}] Liveness signal for untracked handle {}", ctx.tag(), handle);
            return;
        };

        let connected = match ctx.backend.resolve_handle(handle) {
            Ok(record) if record.id != id => {
                debug!("[{}] Handle {} now belongs to {}", ctx.tag(), handle, record.id);
                false
            }
            Ok(record) => match record.liveness {
                Liveness::Alive => true,
                Liveness::Dead => false,
                Liveness::Unknown => {
                    let assumed = ctx.config.assume_connected_when_unknown;
                    warn!(
                        "[{}] Liveness of {} unreadable, assuming {}",
                        ctx.tag(),
                        id,
                        if assumed { "connected" } else { "disconnected" }
                    );
                    assumed
                }
            },
            // Handle no longer resolves: the device is gone
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                warn!("[{}] Liveness query for {} failed: {}", ctx.tag(), id, e);
                return;
            }
        };

        apply_connectivity(ctx, &id, connected);
    }
}

impl EventNormalizer for CoarseNormalizer {
    fn model(&self) -> SignalModel {
        SignalModel::Coarse
    }

    fn normalize(&self, ctx: &AudioContext, event: RawNativeEvent) {
        match event {
            RawNativeEvent::Coarse { signal, handle } => {
                debug!("[{}] {:?} ({:?})", ctx.tag(), signal, handle);
                match signal {
                    CoarseSignal::ListChanged => self.list_changed(ctx),
                    CoarseSignal::DefaultChanged => self.default_changed(ctx),
                    CoarseSignal::LivenessChanged => self.liveness_changed(ctx, handle),
                }
            }
            other => debug!("[{}] Coarse normalizer ignoring {:?}", ctx.tag(), other),
        }
    }
}
