//! Shared state for one monitoring session
//!
//! Bundles the collaborator, the directory and the callback registry so the
//! reconciler, resolver and normalizers all mutate the same directory through
//! its own lock. Nothing here adds a lock of its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::backend::NativeAudio;
use crate::audio::directory::DeviceDirectory;
use crate::audio::reconciler::Reconciler;
use crate::audio::registry::CallbackRegistry;
use crate::audio::resolver::Resolver;
use crate::audio::snapshot::SnapshotBuilder;
use crate::config::AudioControlConfig;

pub struct AudioContext {
    pub backend: Arc<dyn NativeAudio>,
    pub directory: DeviceDirectory,
    pub registry: CallbackRegistry,
    pub config: AudioControlConfig,
    /// Issued before each enumeration so stale passes can be recognised
    tickets: AtomicU64,
}

impl AudioContext {
    pub fn new(backend: Arc<dyn NativeAudio>, config: AudioControlConfig) -> Self {
        Self {
            backend,
            directory: DeviceDirectory::new(),
            registry: CallbackRegistry::new(),
            config,
            tickets: AtomicU64::new(0),
        }
    }

    /// Backend name, used as the log prefix
    pub fn tag(&self) -> &'static str {
        self.backend.name()
    }

    pub fn snapshot(&self) -> SnapshotBuilder<'_> {
        SnapshotBuilder::new(
            self.backend.as_ref(),
            self.config.assume_connected_when_unknown,
        )
    }

    pub fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(self)
    }

    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self)
    }

    pub(crate) fn next_ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::SeqCst) + 1
    }
}
