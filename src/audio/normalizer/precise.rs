//! Precise-signal normalizer (MMDevice-style)
//!
//! Signals name the endpoint, so Added/Removed apply directly to the directory
//! without a re-enumeration. The endpoint's direction still has to be looked
//! up, since the notification itself does not carry it.
//!
//! That lookup runs outside the directory lock, so an add takes a ticket
//! first and is refused if a removal of the same id was applied after it.

use tracing::{debug, warn};

use super::{apply_connectivity, EventNormalizer};
use crate::audio::backend::{EndpointState, PreciseSignal, RawNativeEvent, SignalModel};
use crate::audio::context::AudioContext;
use crate::audio::types::*;

#[derive(Debug, Clone, Copy, Default)]
pub struct PreciseNormalizer;

impl PreciseNormalizer {
    fn added(&self, ctx: &AudioContext, id: &str) {
        let ticket = ctx.next_ticket();
        if ctx.directory.get(id).is_some() {
            debug!("[{}] Redundant add for {}", ctx.tag(), id);
            return;
        }

        let record = match ctx.backend.lookup(id) {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!("[{}] {} vanished before it could be added", ctx.tag(), id);
                return;
            }
            Err(e) => {
                warn!("[{}] Lookup of added device {} failed: {}", ctx.tag(), id, e);
                return;
            }
        };
        let Some(device) = ctx.snapshot().build(&record, &ActiveIds::default()) else {
            return;
        };

        let inserted = ctx.directory.write(|txn| {
            if txn.contains(id) {
                return false;
            }
            if txn.removed_since(id, ticket) {
                debug!("[{}] {} was removed while being added", ctx.tag(), id);
                return false;
            }
            txn.upsert(device);
            txn.set_handle(id, record.handle);
            if let Some(snapshot) = txn.get(id).cloned() {
                ctx.registry.enqueue(DeviceEvent::added(snapshot));
            }
            true
        });

        if inserted && ctx.config.track_liveness {
            ctx.backend.watch_liveness(record.handle);
        }
        ctx.registry.flush();
    }

    fn removed(&self, ctx: &AudioContext, id: &str) {
        let ticket = ctx.next_ticket();
        let removed = ctx.directory.write(|txn| {
            // Recorded even for unknown ids: an add may still be in flight
            txn.note_removed(id, ticket);
            let orphaned: Vec<Direction> = Direction::ALL
                .into_iter()
                .filter(|&d| txn.active(d) == Some(id))
                .collect();
            let handle = txn.handle_of(id);
            let last_known = txn.remove(id)?;
            ctx.registry.enqueue(DeviceEvent::removed(last_known));
            Some((orphaned, handle))
        });
        ctx.registry.flush();

        let Some((orphaned, handle)) = removed else {
            debug!("[{}] Removal of unknown device {}", ctx.tag(), id);
            return;
        };
        if let (true, Some(handle)) = (ctx.config.track_liveness, handle) {
            ctx.backend.unwatch_liveness(handle);
        }
        for direction in orphaned {
            ctx.resolver().resolve(direction);
        }
    }

    fn state_changed(&self, ctx: &AudioContext, id: &str, state: EndpointState) {
        let known = ctx.directory.get(id).is_some();
        match (state.is_active(), known) {
            (true, true) => {
                apply_connectivity(ctx, id, true);
            }
            (true, false) => self.added(ctx, id),
            (false, true) => {
                apply_connectivity(ctx, id, false);
            }
            (false, false) => {
                debug!("[{}] {} went {:?} before it was known", ctx.tag(), id, state);
            }
        }
    }
}

impl EventNormalizer for PreciseNormalizer {
    fn model(&self) -> SignalModel {
        SignalModel::Precise
    }

    fn normalize(&self, ctx: &AudioContext, event: RawNativeEvent) {
        match event {
            RawNativeEvent::Precise { id, signal } => {
                debug!("[{}] {:?} for {}", ctx.tag(), signal, id);
                match signal {
                    PreciseSignal::Added => self.added(ctx, &id),
                    PreciseSignal::Removed => self.removed(ctx, &id),
                    PreciseSignal::StateChanged(state) => self.state_changed(ctx, &id, state),
                    PreciseSignal::DefaultChanged(direction) => {
                        ctx.resolver().resolve(direction);
                    }
                }
            }
            other => debug!("[{}] Precise normalizer ignoring {:?}", ctx.tag(), other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::backend::CoarseSignal;
    use crate::audio::test_support::{capture, record, FakeBackend, HoldPoint};
    use crate::config::AudioControlConfig;
    use std::sync::Arc;
    use std::thread;

    fn setup() -> (Arc<FakeBackend>, AudioContext, crossbeam_channel::Receiver<DeviceEvent>) {
        let backend = Arc::new(FakeBackend::precise());
        backend.set_devices(vec![record("out1", 0, false, true), record("out2", 1, false, true)]);
        backend.set_default_output(Some("out1"));
        let ctx = AudioContext::new(backend.clone(), AudioControlConfig::default());
        ctx.reconciler().populate().unwrap();
        let (handler, rx) = capture();
        ctx.registry.set_handler(handler);
        (backend, ctx, rx)
    }

    fn precise(id: &str, signal: PreciseSignal) -> RawNativeEvent {
        RawNativeEvent::Precise {
            id: id.to_string(),
            signal,
        }
    }

    #[test]
    fn test_removed_applies_without_enumeration() {
        let (backend, ctx, rx) = setup();
        let calls = backend.enumerate_calls();

        PreciseNormalizer.normalize(&ctx, precise("out2", PreciseSignal::Removed));

        let events: Vec<DeviceEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DeviceEventKind::Removed);
        assert_eq!(events[0].device.as_ref().unwrap().name, "Device out2");
        assert!(ctx.directory.get("out2").is_none());
        assert_eq!(backend.enumerate_calls(), calls);
    }

    #[test]
    fn test_added_looks_up_direction() {
        let (backend, ctx, rx) = setup();
        backend.add_device(record("mic", 2, true, false));

        PreciseNormalizer.normalize(&ctx, precise("mic", PreciseSignal::Added));
        PreciseNormalizer.normalize(&ctx, precise("mic", PreciseSignal::Added));

        let events: Vec<DeviceEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        let device = events[0].device.as_ref().unwrap();
        assert!(device.supports_input && !device.supports_output);
        assert_eq!(ctx.directory.len(), 3);
    }

    #[test]
    fn test_added_for_vanished_device_is_silent() {
        let (_backend, ctx, rx) = setup();
        PreciseNormalizer.normalize(&ctx, precise("ghost", PreciseSignal::Added));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_removal_during_add_leaves_no_device() {
        let (backend, ctx, rx) = setup();
        let ctx = Arc::new(ctx);
        backend.add_device(record("usb", 5, false, true));

        // Add looks the endpoint up and stalls before inserting it
        let hold = backend.hold(HoldPoint::Lookup);
        let adding = {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || PreciseNormalizer.normalize(&ctx, precise("usb", PreciseSignal::Added)))
        };
        hold.wait_reached();

        backend.remove_device("usb");
        PreciseNormalizer.normalize(&ctx, precise("usb", PreciseSignal::Removed));
        hold.release();
        adding.join().unwrap();

        assert!(rx.try_recv().is_err());
        assert!(ctx.directory.get("usb").is_none());
        assert!(!backend.is_watching(5));
        let ids: Vec<String> = ctx.directory.all().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["out1", "out2"]);
    }

    #[test]
    fn test_add_after_removal_is_applied() {
        let (backend, ctx, rx) = setup();
        PreciseNormalizer.normalize(&ctx, precise("usb", PreciseSignal::Removed));

        // Plugged back in later: a newer add wins over the old removal
        backend.add_device(record("usb", 5, false, true));
        PreciseNormalizer.normalize(&ctx, precise("usb", PreciseSignal::Added));

        assert_eq!(rx.try_recv().unwrap().kind, DeviceEventKind::Added);
        assert!(ctx.directory.get("usb").is_some());
    }

    #[test]
    fn test_state_changes_map_to_disconnect_and_add() {
        let (backend, ctx, rx) = setup();

        PreciseNormalizer.normalize(
            &ctx,
            precise("out2", PreciseSignal::StateChanged(EndpointState::Unplugged)),
        );
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, DeviceEventKind::Disconnected);
        assert!(!ctx.directory.get("out2").unwrap().is_connected);

        // Plugged back in: known device, reconnect is silent
        PreciseNormalizer.normalize(&ctx, precise("out2", PreciseSignal::StateChanged(EndpointState::Active)));
        assert!(rx.try_recv().is_err());
        assert!(ctx.directory.get("out2").unwrap().is_connected);

        // Newly active endpoint becomes an Added
        backend.add_device(record("hdmi", 3, false, true));
        PreciseNormalizer.normalize(&ctx, precise("hdmi", PreciseSignal::StateChanged(EndpointState::Active)));
        assert_eq!(rx.try_recv().unwrap().kind, DeviceEventKind::Added);

        // Unknown endpoint going inactive is ignored
        PreciseNormalizer.normalize(&ctx, precise("other", PreciseSignal::StateChanged(EndpointState::Disabled)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_default_changed_resolves_named_direction_only() {
        let (backend, ctx, rx) = setup();
        backend.add_device(record("mic", 2, true, false));
        PreciseNormalizer.normalize(&ctx, precise("mic", PreciseSignal::Added));
        rx.try_iter().for_each(drop);

        backend.set_default_output(Some("out2"));
        backend.set_default_input(Some("mic"));
        PreciseNormalizer.normalize(&ctx, precise("out2", PreciseSignal::DefaultChanged(Direction::Output)));

        let events: Vec<DeviceEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].device_id, "out2");
        assert_eq!(ctx.directory.active(Direction::Input), None);
    }

    #[test]
    fn test_removing_default_reresolves() {
        let (backend, ctx, rx) = setup();
        backend.remove_device("out1");
        backend.set_default_output(Some("out2"));

        PreciseNormalizer.normalize(&ctx, precise("out1", PreciseSignal::Removed));

        let kinds: Vec<DeviceEventKind> = rx.try_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![DeviceEventKind::Removed, DeviceEventKind::ActiveChanged]);
        assert!(ctx.directory.get("out2").unwrap().is_active);
    }

    #[test]
    fn test_coarse_payload_is_ignored() {
        let (_backend, ctx, rx) = setup();
        PreciseNormalizer.normalize(
            &ctx,
            RawNativeEvent::Coarse {
                signal: CoarseSignal::ListChanged,
                handle: None,
            },
        );
        assert!(rx.try_recv().is_err());
    }
}
