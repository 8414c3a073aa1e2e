//! Native audio collaborator abstraction
//!
//! This trait defines the interface every platform backend must satisfy.
//! Implementations are thin wrappers over the native enumeration, property
//! and notification calls; all reconciliation logic lives above them.
//!
//! # Two notification models
//!
//! - CoreAudio (macOS) reports coarse, context-free signals: "the device list
//!   changed", "a default changed", "this object's liveness changed".
//! - MMDevice (Windows) reports precise per-endpoint signals with the endpoint
//!   id and, for default changes, the data flow.
//!
//! Both are funnelled into [`RawNativeEvent`] and handed to the sink the
//! monitor registers; [`SignalModel`] tells the monitor which normalizer to use.
//!
//! # Important
//!
//! This file must NOT contain any platform-specific imports (coreaudio-sys, windows, etc.).
//! All platform-specific code goes in the implementation files.

use std::sync::Arc;

use tracing::warn;

use crate::audio::error::Result;
use crate::audio::types::*;
use crate::config::AudioControlConfig;

/// One endpoint as reported by a native enumeration pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRecord {
    pub handle: PlatformHandle,
    pub id: String,
    /// `None` when the name property could not be read
    pub name: Option<String>,
    pub has_input_streams: bool,
    pub has_output_streams: bool,
    pub liveness: Liveness,
}

/// Which notification shape a backend delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalModel {
    /// Context-free signals; device identity must be recovered by diffing
    Coarse,
    /// Per-endpoint signals carrying the stable id
    Precise,
}

/// Coarse (CoreAudio-style) signal tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoarseSignal {
    ListChanged,
    DefaultChanged,
    LivenessChanged,
}

/// MMDevice endpoint states (`DEVICE_STATE_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Active,
    Disabled,
    NotPresent,
    Unplugged,
    /// Value outside the documented `DEVICE_STATE_*` set
    Unknown(u32),
}

impl EndpointState {
    pub fn from_raw(state: u32) -> Self {
        match state {
            0x1 => Self::Active,
            0x2 => Self::Disabled,
            0x4 => Self::NotPresent,
            0x8 => Self::Unplugged,
            other => {
                warn!("Unrecognized endpoint state {:#x}, treating as inactive", other);
                Self::Unknown(other)
            }
        }
    }

    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

/// Precise (MMDevice-style) signal categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreciseSignal {
    Added,
    Removed,
    StateChanged(EndpointState),
    DefaultChanged(Direction),
}

/// Raw notification as delivered from a native callback thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawNativeEvent {
    Coarse {
        signal: CoarseSignal,
        handle: Option<PlatformHandle>,
    },
    Precise {
        id: String,
        signal: PreciseSignal,
    },
}

/// Entry point backends call from their native notification threads
pub type NativeSink = Arc<dyn Fn(RawNativeEvent) + Send + Sync>;

/// Native audio collaborator
///
/// Implementations must be callable from any thread. None of the methods may
/// block beyond a bounded synchronous native query.
pub trait NativeAudio: Send + Sync {
    /// Backend name (e.g., "CoreAudio", "MMDevice")
    fn name(&self) -> &'static str;

    /// Notification shape this backend delivers
    fn signal_model(&self) -> SignalModel;

    // === Queries ===

    /// Full enumeration of endpoints
    ///
    /// Fails with `Enumeration` if the platform call itself fails. Per-device
    /// property failures are reported through the record fields instead.
    fn enumerate(&self) -> Result<Vec<EndpointRecord>>;

    /// Re-query a single endpoint by stable id (`NotFound` if gone)
    fn lookup(&self, id: &str) -> Result<EndpointRecord>;

    /// Resolve a platform handle to its current record (`NotFound` if gone)
    fn resolve_handle(&self, handle: PlatformHandle) -> Result<EndpointRecord>;

    /// Stable id of the current default device for `direction`
    fn get_default(&self, direction: Direction) -> Result<Option<String>>;

    /// Make `id` the default device for `direction`
    fn set_default(&self, id: &str, direction: Direction) -> Result<()>;

    // === Notifications ===

    /// Start delivering native notifications to `sink`
    fn register(&self, sink: NativeSink) -> Result<()>;

    /// Stop delivering notifications
    ///
    /// Must return only once the native layer guarantees no new callbacks
    /// will start; callbacks already running may still complete.
    fn unregister(&self) -> Result<()>;

    /// Attribute later liveness changes to this specific device
    fn watch_liveness(&self, _handle: PlatformHandle) {}

    fn unwatch_liveness(&self, _handle: PlatformHandle) {}
}

/// Factory function to create the appropriate backend for the current platform
pub fn create_backend(config: &AudioControlConfig) -> Result<Arc<dyn NativeAudio>> {
    #[cfg(target_os = "macos")]
    {
        use crate::audio::coreaudio_backend::CoreAudioBackend;
        let _ = config;
        Ok(Arc::new(CoreAudioBackend::new()))
    }

    #[cfg(target_os = "windows")]
    {
        use crate::audio::wasapi_backend::MmDeviceBackend;
        Ok(Arc::new(MmDeviceBackend::new(config.default_role)?))
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let _ = config;
        Err(crate::audio::error::AudioControlError::NotSupported(
            "No native audio backend for this platform".to_string(),
        ))
    }
}
