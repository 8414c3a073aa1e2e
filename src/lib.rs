//! Platform-neutral audio endpoint control
//!
//! Lists input/output devices, reads and switches the default device, and
//! reports device changes as one normalized event stream on both CoreAudio
//! (macOS) and MMDevice (Windows).
//!
//! ```no_run
//! let devices = audio_control::list_devices()?;
//! for device in &devices {
//!     println!("{} {}", device.id, device.name);
//! }
//!
//! let _subscription = audio_control::on_device_change(|event| {
//!     println!("{:?} {}", event.kind, event.device_id);
//! })?;
//! # Ok::<(), audio_control::AudioControlError>(())
//! ```

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

// === MODULES ===
pub mod audio;
pub mod config;
pub mod control;

pub use audio::backend::{create_backend, NativeAudio};
pub use audio::error::{AudioControlError, Result};
pub use audio::monitor::Subscription;
pub use audio::types::{AudioDevice, DeviceEvent, DeviceEventKind, Direction};
pub use config::{AudioControlConfig, EndpointRole};
pub use control::AudioControl;

// === PROCESS-WIDE INSTANCE ===

static AUDIO_CONTROL: Lazy<Mutex<Option<Arc<AudioControl>>>> = Lazy::new(|| Mutex::new(None));

/// Shared control over the native backend, created on first use
pub fn audio_control() -> Result<Arc<AudioControl>> {
    let mut slot = AUDIO_CONTROL.lock();
    if let Some(control) = slot.as_ref() {
        return Ok(Arc::clone(control));
    }
    let control = Arc::new(AudioControl::system()?);
    *slot = Some(Arc::clone(&control));
    Ok(control)
}

pub fn list_devices() -> Result<Vec<AudioDevice>> {
    audio_control()?.list_devices()
}

pub fn get_active_output() -> Result<AudioDevice> {
    audio_control()?.get_active_output()
}

pub fn get_active_input() -> Result<AudioDevice> {
    audio_control()?.get_active_input()
}

pub fn set_active_output(id: &str) -> Result<()> {
    audio_control()?.set_active_output(id)
}

pub fn set_active_input(id: &str) -> Result<()> {
    audio_control()?.set_active_input(id)
}

/// Subscribe to device changes; see [`AudioControl::on_device_change`]
pub fn on_device_change<F>(handler: F) -> Result<Subscription>
where
    F: Fn(DeviceEvent) + Send + Sync + 'static,
{
    audio_control()?.on_device_change(handler)
}
