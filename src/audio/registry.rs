//! Callback registry
//!
//! Holds the single user handler and delivers events to it in the order they
//! were produced. Producers enqueue while they still hold the directory write
//! lock (enqueueing runs no user code), then call [`CallbackRegistry::flush`]
//! after releasing it. Exactly one thread drains the outbox at a time; any
//! other thread only enqueues and returns, so native callback threads never
//! wait on a handler running elsewhere.
//!
//! The handler lock and the outbox lock are both distinct from the directory
//! lock, and neither is held while the handler runs.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::audio::types::{DeviceEvent, DeviceEventCallback};

#[derive(Default)]
struct Outbox {
    queue: VecDeque<DeviceEvent>,
    draining: bool,
}

#[derive(Default)]
pub struct CallbackRegistry {
    handler: Mutex<Option<DeviceEventCallback>>,
    outbox: Mutex<Outbox>,
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("has_handler", &self.has_handler())
            .field("pending", &self.outbox.lock().queue.len())
            .finish()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the handler; the last call wins
    pub fn set_handler(&self, handler: DeviceEventCallback) {
        *self.handler.lock() = Some(handler);
    }

    pub fn clear_handler(&self) {
        self.handler.lock().take();
    }

    pub fn has_handler(&self) -> bool {
        self.handler.lock().is_some()
    }

    /// Queue an event without delivering it
    pub fn enqueue(&self, event: DeviceEvent) {
        self.outbox.lock().queue.push_back(event);
    }

    /// Drop everything still queued
    pub fn discard_pending(&self) {
        let dropped = {
            let mut outbox = self.outbox.lock();
            let n = outbox.queue.len();
            outbox.queue.clear();
            n
        };
        if dropped > 0 {
            debug!("Discarded {} undelivered device events", dropped);
        }
    }

    /// Deliver queued events on this thread, unless another thread already is
    pub fn flush(&self) {
        {
            let mut outbox = self.outbox.lock();
            if outbox.draining || outbox.queue.is_empty() {
                return;
            }
            outbox.draining = true;
        }

        loop {
            let next = {
                let mut outbox = self.outbox.lock();
                match outbox.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        outbox.draining = false;
                        return;
                    }
                }
            };
            self.deliver(next);
        }
    }

    /// Deliver one event now (queued behind anything already pending)
    pub fn dispatch(&self, event: DeviceEvent) {
        self.enqueue(event);
        self.flush();
    }

    fn deliver(&self, event: DeviceEvent) {
        // Clone out so the handler lock is not held during the call
        let handler = self.handler.lock().clone();
        let Some(handler) = handler else {
            return;
        };

        let kind = event.kind;
        let device_id = event.device_id.clone();
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            error!(
                "Device event handler panicked on {:?} for {}; continuing",
                kind, device_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::types::{AudioDevice, DeviceEventKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn event(id: &str) -> DeviceEvent {
        DeviceEvent::added(AudioDevice {
            id: id.to_string(),
            name: id.to_string(),
            supports_input: false,
            supports_output: true,
            is_active: false,
            is_connected: true,
        })
    }

    #[test]
    fn test_dispatch_without_handler_is_noop() {
        let registry = CallbackRegistry::new();
        registry.dispatch(event("a"));
        assert!(!registry.has_handler());
    }

    #[test]
    fn test_last_handler_wins() {
        let registry = CallbackRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        registry.set_handler(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = Arc::clone(&second);
        registry.set_handler(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispatch(event("a"));
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_delivery() {
        let registry = CallbackRegistry::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        registry.set_handler(Arc::new(move |e| {
            counter.fetch_add(1, Ordering::SeqCst);
            if e.device_id == "boom" {
                panic!("handler failure");
            }
        }));

        registry.enqueue(event("boom"));
        registry.enqueue(event("after"));
        registry.flush();
        registry.dispatch(event("later"));

        assert_eq!(delivered.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_reentrant_dispatch_preserves_order() {
        let registry = Arc::new(CallbackRegistry::new());
        let (tx, rx) = crossbeam_channel::unbounded();

        let inner = Arc::clone(&registry);
        registry.set_handler(Arc::new(move |e: DeviceEvent| {
            if e.device_id == "first" {
                // Delivered after this handler returns, not nested inside it
                inner.dispatch(event("nested"));
            }
            tx.send(e.device_id).unwrap();
        }));

        registry.enqueue(event("first"));
        registry.enqueue(event("second"));
        registry.flush();

        let order: Vec<String> = rx.try_iter().collect();
        assert_eq!(order, vec!["first", "second", "nested"]);
    }

    #[test]
    fn test_concurrent_producers_deliver_everything_once() {
        let registry = Arc::new(CallbackRegistry::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        registry.set_handler(Arc::new(move |e: DeviceEvent| {
            assert_eq!(e.kind, DeviceEventKind::Added);
            tx.send(e.device_id).unwrap();
        }));

        let producers: Vec<_> = (0..4)
            .map(|t| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..100 {
                        registry.dispatch(event(&format!("{}-{}", t, i)));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        registry.flush();

        let mut per_thread: Vec<Vec<usize>> = vec![Vec::new(); 4];
        for id in rx.try_iter() {
            let (t, i) = id.split_once('-').unwrap();
            per_thread[t.parse::<usize>().unwrap()].push(i.parse().unwrap());
        }
        for seq in per_thread {
            assert_eq!(seq, (0..100).collect::<Vec<_>>(), "per-producer order must hold");
        }
    }
}
