//! Event normalizers
//!
//! One interface, two implementations: each turns the native payload shape of
//! its backend into reconciler/resolver calls. Neither keeps state or a lock of
//! its own, so overlapping native callbacks (or both variants at once) only
//! ever serialize on the directory lock.

mod coarse;
mod precise;

pub use coarse::CoarseNormalizer;
pub use precise::PreciseNormalizer;

use std::sync::Arc;

use tracing::{debug, warn};

use crate::audio::backend::{RawNativeEvent, SignalModel};
use crate::audio::context::AudioContext;
use crate::audio::types::{DeviceEvent, Direction};

pub trait EventNormalizer: Send + Sync {
    fn model(&self) -> SignalModel;

    /// Classify one native signal into directory mutations and events
    fn normalize(&self, ctx: &AudioContext, event: RawNativeEvent);

    /// Pick up anything that changed between the initial enumeration and
    /// native registration
    fn catch_up(&self, ctx: &AudioContext) {
        match ctx.reconciler().reconcile() {
            Ok(outcome) if !outcome.is_unchanged() => {
                debug!("[{}] Catch-up reconcile applied {:?}", ctx.tag(), outcome);
            }
            Ok(_) => {}
            Err(e) => warn!("[{}] Catch-up enumeration failed: {}", ctx.tag(), e),
        }
        for direction in Direction::ALL {
            ctx.resolver().resolve(direction);
        }
    }
}

/// Normalizer matching a backend's notification shape
pub fn for_model(model: SignalModel) -> Arc<dyn EventNormalizer> {
    match model {
        SignalModel::Coarse => Arc::new(CoarseNormalizer),
        SignalModel::Precise => Arc::new(PreciseNormalizer),
    }
}

/// Record a connectivity observation for a known device
///
/// Losing connectivity emits `Disconnected` once; regaining it is silent.
/// The device always stays in the directory.
pub(crate) fn apply_connectivity(ctx: &AudioContext, id: &str, connected: bool) -> bool {
    let emitted = ctx.directory.write(|txn| match txn.set_connected(id, connected) {
        Some((device, true)) if !connected => {
            ctx.registry.enqueue(DeviceEvent::disconnected(device));
            true
        }
        Some((_, true)) => {
            debug!("[{}] {} reconnected", ctx.tag(), id);
            false
        }
        Some((_, false)) => false,
        None => {
            debug!("[{}] Connectivity change for unknown device {}", ctx.tag(), id);
            false
        }
    });
    ctx.registry.flush();
    emitted
}
