//! Audio endpoint directory and change normalization
//!
//! This module keeps one consistent view of the host's audio endpoints and
//! turns two incompatible native notification models into one event stream.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              AudioControl                    │
//! │  list_devices(), set_active_output(),        │
//! │  on_device_change()                          │
//! └─────────────┬───────────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────────┐
//! │   Monitor ── EventNormalizer (coarse|precise)│
//! │      Reconciler / Resolver                   │
//! │      DeviceDirectory ── CallbackRegistry     │
//! └─────────────┬───────────────────────────────┘
//!               │ trait NativeAudio
//!        ┌──────┴───────────────┐
//!        ▼                      ▼
//! ┌──────────────┐    ┌──────────────┐
//! │ CoreAudio    │    │ MMDevice     │
//! │ Backend      │    │ Backend      │
//! │ (macOS)      │    │ (Windows)    │
//! └──────────────┘    └──────────────┘
//! ```

pub mod backend;
pub mod context;
pub mod directory;
pub mod error;
pub mod monitor;
pub mod normalizer;
pub mod reconciler;
pub mod registry;
pub mod resolver;
pub mod snapshot;
pub mod types;

#[cfg(target_os = "macos")]
pub mod coreaudio_backend;

#[cfg(target_os = "windows")]
pub mod wasapi_backend;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use backend::{create_backend, NativeAudio};
pub use error::{AudioControlError, Result};
pub use types::*;
