//! CoreAudio HAL backend for macOS
//!
//! Uses coreaudio-sys for direct HAL access to:
//! - Enumerate audio devices and their stream directions
//! - Read and change the default input/output device
//! - Listen for device list, default device and liveness changes
//!
//! Device identity is the device UID (`kAudioDevicePropertyDeviceUID`); the
//! `AudioObjectID` is only used as a short-lived platform handle.
//!
//! This file is only compiled on macOS via #[cfg(target_os = "macos")]

use std::collections::HashSet;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};

use core_foundation::base::TCFType;
use core_foundation::string::{CFString, CFStringRef};
use coreaudio_sys::*;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::audio::backend::*;
use crate::audio::error::{AudioControlError, Result};
use crate::audio::types::*;

/// `kAudioHardwareBadObjectError` ('!obj')
const BAD_OBJECT: OSStatus = 0x216F_626A;

/// Sink the HAL listener forwards to; one registration per process
static LISTENER_SINK: Lazy<Mutex<Option<NativeSink>>> = Lazy::new(|| Mutex::new(None));

/// System-object properties the backend listens on
const SYSTEM_SELECTORS: [AudioObjectPropertySelector; 3] = [
    kAudioHardwarePropertyDevices,
    kAudioHardwarePropertyDefaultOutputDevice,
    kAudioHardwarePropertyDefaultInputDevice,
];

/// CoreAudio HAL backend
pub struct CoreAudioBackend {
    /// Devices with a registered liveness listener
    watched: Mutex<HashSet<AudioObjectID>>,
}

impl CoreAudioBackend {
    pub fn new() -> Self {
        debug!("[CoreAudio] Initializing backend...");
        Self {
            watched: Mutex::new(HashSet::new()),
        }
    }

    // === Private HAL Functions ===

    fn address(
        selector: AudioObjectPropertySelector,
        scope: AudioObjectPropertyScope,
    ) -> AudioObjectPropertyAddress {
        AudioObjectPropertyAddress {
            mSelector: selector,
            mScope: scope,
            mElement: kAudioObjectPropertyElementMain,
        }
    }

    /// Read a CFString property; `None` if the property cannot be read
    fn string_property(object: AudioObjectID, selector: AudioObjectPropertySelector) -> Option<String> {
        unsafe {
            let property_address = Self::address(selector, kAudioObjectPropertyScopeGlobal);
            let mut cf_value: CFStringRef = std::ptr::null();
            let mut size = std::mem::size_of::<CFStringRef>() as u32;

            let status = AudioObjectGetPropertyData(
                object,
                &property_address,
                0,
                std::ptr::null(),
                &mut size,
                &mut cf_value as *mut _ as *mut c_void,
            );

            if status != 0 || cf_value.is_null() {
                return None;
            }

            // The HAL hands out a retained string
            let cf_string: CFString = CFString::wrap_under_create_rule(cf_value);
            Some(cf_string.to_string())
        }
    }

    fn u32_property(object: AudioObjectID, selector: AudioObjectPropertySelector) -> std::result::Result<u32, OSStatus> {
        unsafe {
            let property_address = Self::address(selector, kAudioObjectPropertyScopeGlobal);
            let mut value: u32 = 0;
            let mut size = std::mem::size_of::<u32>() as u32;

            let status = AudioObjectGetPropertyData(
                object,
                &property_address,
                0,
                std::ptr::null(),
                &mut size,
                &mut value as *mut _ as *mut c_void,
            );

            if status != 0 {
                return Err(status);
            }
            Ok(value)
        }
    }

    /// Check if a device has streams in the given scope
    fn has_streams(object: AudioObjectID, scope: AudioObjectPropertyScope) -> bool {
        unsafe {
            let property_address = Self::address(kAudioDevicePropertyStreams, scope);
            let mut size: u32 = 0;
            let status = AudioObjectGetPropertyDataSize(
                object,
                &property_address,
                0,
                std::ptr::null(),
                &mut size,
            );
            status == 0 && size > 0
        }
    }

    /// Transport presence plus `DeviceIsAlive`
    fn liveness(object: AudioObjectID) -> Liveness {
        if Self::u32_property(object, kAudioDevicePropertyTransportType).is_err() {
            return Liveness::Unknown;
        }
        match Self::u32_property(object, kAudioDevicePropertyDeviceIsAlive) {
            Ok(0) => Liveness::Dead,
            Ok(_) => Liveness::Alive,
            Err(_) => Liveness::Unknown,
        }
    }

    /// All device objects known to the HAL
    fn device_objects() -> Result<Vec<AudioObjectID>> {
        unsafe {
            let property_address =
                Self::address(kAudioHardwarePropertyDevices, kAudioObjectPropertyScopeGlobal);

            // Get the size first
            let mut size: u32 = 0;
            let status = AudioObjectGetPropertyDataSize(
                kAudioObjectSystemObject,
                &property_address,
                0,
                std::ptr::null(),
                &mut size,
            );

            if status != 0 {
                return Err(AudioControlError::Enumeration(format!(
                    "Failed to get device list size: {}",
                    status
                )));
            }

            let device_count = size as usize / std::mem::size_of::<AudioObjectID>();
            let mut devices: Vec<AudioObjectID> = vec![0; device_count];

            let status = AudioObjectGetPropertyData(
                kAudioObjectSystemObject,
                &property_address,
                0,
                std::ptr::null(),
                &mut size,
                devices.as_mut_ptr() as *mut c_void,
            );

            if status != 0 {
                return Err(AudioControlError::Enumeration(format!(
                    "Failed to get device list: {}",
                    status
                )));
            }

            // The list may have shrunk between the two calls
            devices.truncate(size as usize / std::mem::size_of::<AudioObjectID>());
            Ok(devices)
        }
    }

    /// Build the record for one device; `None` when it has no readable UID
    fn record(object: AudioObjectID) -> Option<EndpointRecord> {
        let Some(uid) = Self::string_property(object, kAudioDevicePropertyDeviceUID) else {
            debug!("[CoreAudio] Device {} has no readable UID", object);
            return None;
        };

        Some(EndpointRecord {
            handle: PlatformHandle::new(object as u64),
            id: uid,
            name: Self::string_property(object, kAudioObjectPropertyName),
            has_input_streams: Self::has_streams(object, kAudioDevicePropertyScopeInput),
            has_output_streams: Self::has_streams(object, kAudioDevicePropertyScopeOutput),
            liveness: Self::liveness(object),
        })
    }

    fn default_selector(direction: Direction) -> AudioObjectPropertySelector {
        match direction {
            Direction::Input => kAudioHardwarePropertyDefaultInputDevice,
            Direction::Output => kAudioHardwarePropertyDefaultOutputDevice,
        }
    }

    fn default_object(direction: Direction) -> Result<Option<AudioObjectID>> {
        match Self::u32_property(kAudioObjectSystemObject, Self::default_selector(direction)) {
            Ok(object) if object == kAudioObjectUnknown => Ok(None),
            Ok(object) => Ok(Some(object)),
            Err(status) => Err(AudioControlError::platform(
                status,
                format!("Failed to get default {} device", direction),
            )),
        }
    }

    /// Register or remove the shared listener on one property
    fn set_listener(object: AudioObjectID, selector: AudioObjectPropertySelector, add: bool) -> OSStatus {
        unsafe {
            let property_address = Self::address(selector, kAudioObjectPropertyScopeGlobal);
            if add {
                AudioObjectAddPropertyListener(
                    object,
                    &property_address,
                    Some(on_property_changed),
                    std::ptr::null_mut(),
                )
            } else {
                AudioObjectRemovePropertyListener(
                    object,
                    &property_address,
                    Some(on_property_changed),
                    std::ptr::null_mut(),
                )
            }
        }
    }
}

impl Default for CoreAudioBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a HAL selector to the signal it represents
#[allow(non_upper_case_globals)]
fn coarse_signal(selector: AudioObjectPropertySelector) -> Option<CoarseSignal> {
    match selector {
        kAudioHardwarePropertyDevices => Some(CoarseSignal::ListChanged),
        kAudioHardwarePropertyDefaultOutputDevice | kAudioHardwarePropertyDefaultInputDevice => {
            Some(CoarseSignal::DefaultChanged)
        }
        kAudioDevicePropertyDeviceIsAlive => Some(CoarseSignal::LivenessChanged),
        _ => None,
    }
}

/// HAL property listener, runs on a CoreAudio notification thread
unsafe extern "C" fn on_property_changed(
    object: AudioObjectID,
    count: u32,
    addresses: *const AudioObjectPropertyAddress,
    _client_data: *mut c_void,
) -> OSStatus {
    if addresses.is_null() || count == 0 {
        return 0;
    }
    let Some(sink) = LISTENER_SINK.lock().clone() else {
        return 0;
    };

    let addresses = std::slice::from_raw_parts(addresses, count as usize);
    for address in addresses {
        let Some(signal) = coarse_signal(address.mSelector) else {
            continue;
        };
        let handle = (object != kAudioObjectSystemObject).then(|| PlatformHandle::new(object as u64));
        let event = RawNativeEvent::Coarse { signal, handle };
        // Never unwind into the HAL
        if catch_unwind(AssertUnwindSafe(|| sink(event))).is_err() {
            error!("[CoreAudio] Listener sink panicked on {:?}", signal);
        }
    }
    0
}

impl NativeAudio for CoreAudioBackend {
    fn name(&self) -> &'static str {
        "CoreAudio"
    }

    fn signal_model(&self) -> SignalModel {
        SignalModel::Coarse
    }

    fn enumerate(&self) -> Result<Vec<EndpointRecord>> {
        let records: Vec<EndpointRecord> = Self::device_objects()?
            .into_iter()
            .filter_map(Self::record)
            .collect();
        debug!("[CoreAudio] Enumerated {} devices", records.len());
        Ok(records)
    }

    fn lookup(&self, id: &str) -> Result<EndpointRecord> {
        Self::device_objects()?
            .into_iter()
            .filter_map(Self::record)
            .find(|record| record.id == id)
            .ok_or_else(|| AudioControlError::NotFound(id.to_string()))
    }

    fn resolve_handle(&self, handle: PlatformHandle) -> Result<EndpointRecord> {
        let object = AudioObjectID::try_from(handle.raw())
            .map_err(|_| AudioControlError::NotFound(handle.to_string()))?;
        Self::record(object).ok_or_else(|| AudioControlError::NotFound(handle.to_string()))
    }

    fn get_default(&self, direction: Direction) -> Result<Option<String>> {
        let Some(object) = Self::default_object(direction)? else {
            return Ok(None);
        };
        Self::string_property(object, kAudioDevicePropertyDeviceUID)
            .map(Some)
            .ok_or_else(|| AudioControlError::NotFound(format!("default {} device #{}", direction, object)))
    }

    fn set_default(&self, id: &str, direction: Direction) -> Result<()> {
        let scope = match direction {
            Direction::Input => kAudioDevicePropertyScopeInput,
            Direction::Output => kAudioDevicePropertyScopeOutput,
        };

        let mut found = false;
        let mut target = None;
        for object in Self::device_objects()? {
            if Self::string_property(object, kAudioDevicePropertyDeviceUID).as_deref() == Some(id) {
                found = true;
                if Self::has_streams(object, scope) {
                    target = Some(object);
                    break;
                }
            }
        }

        let Some(object) = target else {
            return Err(match (found, direction) {
                (false, _) => AudioControlError::NotFound(id.to_string()),
                (true, Direction::Output) => AudioControlError::NotOutputCapable(id.to_string()),
                (true, Direction::Input) => AudioControlError::NotInputCapable(id.to_string()),
            });
        };

        let status = unsafe {
            let property_address =
                Self::address(Self::default_selector(direction), kAudioObjectPropertyScopeGlobal);
            AudioObjectSetPropertyData(
                kAudioObjectSystemObject,
                &property_address,
                0,
                std::ptr::null(),
                std::mem::size_of::<AudioObjectID>() as u32,
                &object as *const _ as *const c_void,
            )
        };

        match status {
            0 => {
                info!("[CoreAudio] Default {} set to {} (ID: {})", direction, id, object);
                Ok(())
            }
            BAD_OBJECT => Err(AudioControlError::NotFound(id.to_string())),
            status => Err(AudioControlError::platform(
                status,
                format!("Failed to set default {} device", direction),
            )),
        }
    }

    fn register(&self, sink: NativeSink) -> Result<()> {
        *LISTENER_SINK.lock() = Some(sink);

        for (i, &selector) in SYSTEM_SELECTORS.iter().enumerate() {
            let status = Self::set_listener(kAudioObjectSystemObject, selector, true);
            if status != 0 {
                for &added in &SYSTEM_SELECTORS[..i] {
                    Self::set_listener(kAudioObjectSystemObject, added, false);
                }
                LISTENER_SINK.lock().take();
                return Err(AudioControlError::platform(
                    status,
                    "Failed to add HAL property listener",
                ));
            }
        }

        info!("[CoreAudio] Listening for device changes");
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        let mut first_error = None;
        for &selector in &SYSTEM_SELECTORS {
            let status = Self::set_listener(kAudioObjectSystemObject, selector, false);
            if status != 0 && first_error.is_none() {
                first_error = Some(status);
            }
        }

        let watched: Vec<AudioObjectID> = self.watched.lock().drain().collect();
        for object in watched {
            Self::set_listener(object, kAudioDevicePropertyDeviceIsAlive, false);
        }

        LISTENER_SINK.lock().take();
        info!("[CoreAudio] Stopped listening for device changes");

        match first_error {
            Some(status) => Err(AudioControlError::platform(
                status,
                "Failed to remove HAL property listener",
            )),
            None => Ok(()),
        }
    }

    fn watch_liveness(&self, handle: PlatformHandle) {
        let Ok(object) = AudioObjectID::try_from(handle.raw()) else {
            return;
        };
        if !self.watched.lock().insert(object) {
            return;
        }
        let status = Self::set_listener(object, kAudioDevicePropertyDeviceIsAlive, true);
        if status != 0 {
            warn!("[CoreAudio] Liveness listener for device {} failed: {}", object, status);
            self.watched.lock().remove(&object);
        }
    }

    fn unwatch_liveness(&self, handle: PlatformHandle) {
        let Ok(object) = AudioObjectID::try_from(handle.raw()) else {
            return;
        };
        if self.watched.lock().remove(&object) {
            // Fails harmlessly when the device object is already gone
            let status = Self::set_listener(object, kAudioDevicePropertyDeviceIsAlive, false);
            if status != 0 {
                debug!("[CoreAudio] Removing liveness listener for {} returned {}", object, status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_mapping() {
        assert_eq!(
            coarse_signal(kAudioHardwarePropertyDevices),
            Some(CoarseSignal::ListChanged)
        );
        assert_eq!(
            coarse_signal(kAudioHardwarePropertyDefaultInputDevice),
            Some(CoarseSignal::DefaultChanged)
        );
        assert_eq!(
            coarse_signal(kAudioDevicePropertyDeviceIsAlive),
            Some(CoarseSignal::LivenessChanged)
        );
        assert_eq!(coarse_signal(kAudioDevicePropertyNominalSampleRate), None);
    }

    #[test]
    fn test_stale_handle_is_not_found() {
        let backend = CoreAudioBackend::new();
        let err = backend
            .resolve_handle(PlatformHandle::new(u64::from(u32::MAX) + 1))
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
