//! MMDevice backend for Windows
//!
//! Uses the windows crate for:
//! - Endpoint enumeration (`IMMDeviceEnumerator::EnumAudioEndpoints`)
//! - Friendly names (`PKEY_Device_FriendlyName`)
//! - Default endpoint queries and changes (`IPolicyConfig`, undocumented)
//! - Per-endpoint notifications (`IMMNotificationClient`)
//!
//! The stable id is the MMDevice endpoint id string. Endpoints are
//! single-direction; the data flow comes from `IMMEndpoint::GetDataFlow`.
//!
//! This file is only compiled on Windows via #[cfg(target_os = "windows")]

use std::cell::Cell;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use windows::core::{implement, interface, ComInterface, IUnknown, IUnknown_Vtbl, GUID, HRESULT, PCWSTR, PWSTR};
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Foundation::RPC_E_CHANGED_MODE;
use windows::Win32::Media::Audio::{
    eAll, eCapture, eCommunications, eConsole, eMultimedia, eRender, EDataFlow, ERole, IMMDevice,
    IMMDeviceEnumerator, IMMEndpoint, IMMNotificationClient, IMMNotificationClient_Impl,
    MMDeviceEnumerator, DEVICE_STATE, DEVICE_STATE_ACTIVE, DEVICE_STATE_UNPLUGGED,
};
use windows::Win32::System::Com::StructuredStorage::PropVariantClear;
use windows::Win32::System::Com::{
    CoCreateInstance, CoInitializeEx, CoTaskMemFree, CLSCTX_ALL, COINIT_MULTITHREADED, STGM_READ,
};
use windows::Win32::System::Variant::VT_LPWSTR;
use windows::Win32::UI::Shell::PropertiesSystem::PROPERTYKEY;

use crate::audio::backend::*;
use crate::audio::error::{AudioControlError, Result};
use crate::audio::types::*;
use crate::config::EndpointRole;

/// `HRESULT_FROM_WIN32(ERROR_NOT_FOUND)`
const E_NOTFOUND: HRESULT = HRESULT(0x8007_0490_u32 as i32);

const CLSID_POLICY_CONFIG_CLIENT: GUID = GUID::from_u128(0x870af99c_171d_4f9e_af0d_e63df40c2bc9);

/// Undocumented policy interface used by the Windows sound control panel
#[interface("F8679F50-850A-41CF-9C72-430F290290C8")]
unsafe trait IPolicyConfig: IUnknown {
    fn GetMixFormat(&self, device: PCWSTR, format: *mut *mut c_void) -> HRESULT;
    fn GetDeviceFormat(&self, device: PCWSTR, default: i32, format: *mut *mut c_void) -> HRESULT;
    fn ResetDeviceFormat(&self, device: PCWSTR) -> HRESULT;
    fn SetDeviceFormat(&self, device: PCWSTR, endpoint: *mut c_void, mix: *mut c_void) -> HRESULT;
    fn GetProcessingPeriod(&self, device: PCWSTR, default: i32, period: *mut i64, min: *mut i64) -> HRESULT;
    fn SetProcessingPeriod(&self, device: PCWSTR, period: *mut i64) -> HRESULT;
    fn GetShareMode(&self, device: PCWSTR, mode: *mut c_void) -> HRESULT;
    fn SetShareMode(&self, device: PCWSTR, mode: *mut c_void) -> HRESULT;
    fn GetPropertyValue(&self, device: PCWSTR, key: *const PROPERTYKEY, value: *mut c_void) -> HRESULT;
    fn SetPropertyValue(&self, device: PCWSTR, key: *const PROPERTYKEY, value: *mut c_void) -> HRESULT;
    fn SetDefaultEndpoint(&self, device: PCWSTR, role: ERole) -> HRESULT;
    fn SetEndpointVisibility(&self, device: PCWSTR, visible: i32) -> HRESULT;
}

fn platform_error(context: &str, e: windows::core::Error) -> AudioControlError {
    AudioControlError::platform(e.code().0, format!("{}: {}", context, e.message()))
}

thread_local! {
    static COM_READY: Cell<bool> = Cell::new(false);
}

/// Join the MTA on the calling thread (once per thread)
fn ensure_com() -> Result<()> {
    if COM_READY.with(Cell::get) {
        return Ok(());
    }
    match unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) } {
        Ok(()) => {}
        // Already an STA thread; COM is usable as is
        Err(e) if e.code() == RPC_E_CHANGED_MODE => {}
        Err(e) => return Err(platform_error("CoInitializeEx", e)),
    }
    COM_READY.with(|ready| ready.set(true));
    Ok(())
}

fn enumerator() -> Result<IMMDeviceEnumerator> {
    ensure_com()?;
    unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
        .map_err(|e| platform_error("Failed to create device enumerator", e))
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn pcwstr_to_string(value: &PCWSTR) -> Option<String> {
    if value.is_null() {
        return None;
    }
    unsafe { value.to_string().ok() }
}

/// Take ownership of a COM-allocated string
fn take_pwstr(value: PWSTR) -> Option<String> {
    if value.is_null() {
        return None;
    }
    let text = unsafe { value.to_string().ok() };
    unsafe { CoTaskMemFree(Some(value.0 as *const c_void)) };
    text
}

fn flow_direction(flow: EDataFlow) -> Option<Direction> {
    if flow == eRender {
        Some(Direction::Output)
    } else if flow == eCapture {
        Some(Direction::Input)
    } else {
        None
    }
}

fn data_flow(direction: Direction) -> EDataFlow {
    match direction {
        Direction::Input => eCapture,
        Direction::Output => eRender,
    }
}

fn native_role(role: EndpointRole) -> ERole {
    match role {
        EndpointRole::Console => eConsole,
        EndpointRole::Multimedia => eMultimedia,
        EndpointRole::Communications => eCommunications,
    }
}

fn friendly_name(device: &IMMDevice) -> Option<String> {
    unsafe {
        let store = device.OpenPropertyStore(STGM_READ).ok()?;
        let mut value = store.GetValue(&PKEY_Device_FriendlyName).ok()?;
        let name = if value.Anonymous.Anonymous.vt == VT_LPWSTR {
            let text = value.Anonymous.Anonymous.Anonymous.pwszVal;
            if text.is_null() {
                None
            } else {
                text.to_string().ok()
            }
        } else {
            None
        };
        let _ = PropVariantClear(&mut value);
        name
    }
}

/// Build the record for one endpoint; `None` when its id is unreadable
fn record(device: &IMMDevice, slot: u64) -> Option<EndpointRecord> {
    let id = take_pwstr(unsafe { device.GetId() }.ok()?)?;

    let direction = device
        .cast::<IMMEndpoint>()
        .ok()
        .and_then(|endpoint| unsafe { endpoint.GetDataFlow() }.ok())
        .and_then(flow_direction);
    let Some(direction) = direction else {
        debug!("[MMDevice] Endpoint {} has no readable data flow", id);
        return None;
    };

    let liveness = match unsafe { device.GetState() } {
        Ok(state) => {
            if EndpointState::from_raw(state.0).is_active() {
                Liveness::Alive
            } else {
                Liveness::Dead
            }
        }
        Err(_) => Liveness::Unknown,
    };

    Some(EndpointRecord {
        handle: PlatformHandle::new(slot),
        name: friendly_name(device),
        has_input_streams: direction == Direction::Input,
        has_output_streams: direction == Direction::Output,
        liveness,
        id,
    })
}

// === Notification client ===

#[implement(IMMNotificationClient)]
struct NotificationClient {
    sink: NativeSink,
    /// Only default changes for this role are forwarded
    role: ERole,
}

impl NotificationClient {
    fn forward(&self, id: &PCWSTR, signal: PreciseSignal) -> windows::core::Result<()> {
        let id = pcwstr_to_string(id).unwrap_or_default();
        let event = RawNativeEvent::Precise { id, signal };
        // Never unwind into the audio service
        if catch_unwind(AssertUnwindSafe(|| (self.sink)(event))).is_err() {
            error!("[MMDevice] Notification sink panicked on {:?}", signal);
        }
        Ok(())
    }
}

#[allow(non_snake_case)]
impl IMMNotificationClient_Impl for NotificationClient {
    fn OnDeviceStateChanged(&self, pwstrdeviceid: &PCWSTR, dwnewstate: DEVICE_STATE) -> windows::core::Result<()> {
        self.forward(
            pwstrdeviceid,
            PreciseSignal::StateChanged(EndpointState::from_raw(dwnewstate.0)),
        )
    }

    fn OnDeviceAdded(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        self.forward(pwstrdeviceid, PreciseSignal::Added)
    }

    fn OnDeviceRemoved(&self, pwstrdeviceid: &PCWSTR) -> windows::core::Result<()> {
        self.forward(pwstrdeviceid, PreciseSignal::Removed)
    }

    fn OnDefaultDeviceChanged(
        &self,
        flow: EDataFlow,
        role: ERole,
        pwstrdefaultdeviceid: &PCWSTR,
    ) -> windows::core::Result<()> {
        if role != self.role {
            return Ok(());
        }
        let directions: &[Direction] = match flow_direction(flow) {
            Some(Direction::Input) => &[Direction::Input],
            Some(Direction::Output) => &[Direction::Output],
            None => &Direction::ALL,
        };
        for &direction in directions {
            self.forward(pwstrdefaultdeviceid, PreciseSignal::DefaultChanged(direction))?;
        }
        Ok(())
    }

    fn OnPropertyValueChanged(&self, _pwstrdeviceid: &PCWSTR, _key: &PROPERTYKEY) -> windows::core::Result<()> {
        Ok(())
    }
}

/// Registered enumerator/client pair, kept for unregistration
struct Registration {
    enumerator: IMMDeviceEnumerator,
    client: IMMNotificationClient,
}

// MMDevice objects live in the MTA and may be released from any thread
unsafe impl Send for Registration {}

// === Backend ===

/// MMDevice backend
pub struct MmDeviceBackend {
    role: ERole,
    registration: Mutex<Option<Registration>>,
}

impl MmDeviceBackend {
    pub fn new(role: EndpointRole) -> Result<Self> {
        debug!("[MMDevice] Initializing backend (role: {:?})...", role);
        // Fail early if the audio service is unreachable
        enumerator()?;
        Ok(Self {
            role: native_role(role),
            registration: Mutex::new(None),
        })
    }

    fn collect(&self) -> Result<Vec<EndpointRecord>> {
        let enumerator = enumerator()?;
        let collection = unsafe {
            enumerator.EnumAudioEndpoints(eAll, DEVICE_STATE_ACTIVE | DEVICE_STATE_UNPLUGGED)
        }
        .map_err(|e| AudioControlError::Enumeration(format!("EnumAudioEndpoints: {}", e.message())))?;

        let count = unsafe { collection.GetCount() }
            .map_err(|e| AudioControlError::Enumeration(format!("GetCount: {}", e.message())))?;

        let mut records = Vec::with_capacity(count as usize);
        for slot in 0..count {
            match unsafe { collection.Item(slot) } {
                Ok(device) => records.extend(record(&device, u64::from(slot))),
                Err(e) => debug!("[MMDevice] Endpoint slot {} unreadable: {}", slot, e.message()),
            }
        }
        Ok(records)
    }
}

impl NativeAudio for MmDeviceBackend {
    fn name(&self) -> &'static str {
        "MMDevice"
    }

    fn signal_model(&self) -> SignalModel {
        SignalModel::Precise
    }

    fn enumerate(&self) -> Result<Vec<EndpointRecord>> {
        let records = self.collect()?;
        debug!("[MMDevice] Enumerated {} endpoints", records.len());
        Ok(records)
    }

    fn lookup(&self, id: &str) -> Result<EndpointRecord> {
        let enumerator = enumerator()?;
        let id_wide = wide(id);
        let device = unsafe { enumerator.GetDevice(PCWSTR(id_wide.as_ptr())) }
            .map_err(|_| AudioControlError::NotFound(id.to_string()))?;
        let mut found = record(&device, 0).ok_or_else(|| AudioControlError::NotFound(id.to_string()))?;

        // Slot is only meaningful within an enumeration; report the current one
        if let Ok(records) = self.collect() {
            if let Some(current) = records.iter().find(|r| r.id == found.id) {
                found.handle = current.handle;
            }
        }
        Ok(found)
    }

    fn resolve_handle(&self, handle: PlatformHandle) -> Result<EndpointRecord> {
        self.collect()?
            .into_iter()
            .find(|record| record.handle == handle)
            .ok_or_else(|| AudioControlError::NotFound(handle.to_string()))
    }

    fn get_default(&self, direction: Direction) -> Result<Option<String>> {
        let enumerator = enumerator()?;
        match unsafe { enumerator.GetDefaultAudioEndpoint(data_flow(direction), self.role) } {
            Ok(device) => Ok(unsafe { device.GetId() }.ok().and_then(take_pwstr)),
            Err(e) if e.code() == E_NOTFOUND => Ok(None),
            Err(e) => Err(platform_error("GetDefaultAudioEndpoint", e)),
        }
    }

    fn set_default(&self, id: &str, direction: Direction) -> Result<()> {
        let endpoint = self.lookup(id)?;
        let capable = match direction {
            Direction::Input => endpoint.has_input_streams,
            Direction::Output => endpoint.has_output_streams,
        };
        if !capable {
            return Err(match direction {
                Direction::Input => AudioControlError::NotInputCapable(id.to_string()),
                Direction::Output => AudioControlError::NotOutputCapable(id.to_string()),
            });
        }

        ensure_com()?;
        let policy: IPolicyConfig = unsafe { CoCreateInstance(&CLSID_POLICY_CONFIG_CLIENT, None, CLSCTX_ALL) }
            .map_err(|e| platform_error("Failed to create policy config", e))?;

        let id_wide = wide(id);
        for role in [eConsole, eMultimedia, eCommunications] {
            let hr = unsafe { policy.SetDefaultEndpoint(PCWSTR(id_wide.as_ptr()), role) };
            if hr.is_err() {
                return Err(AudioControlError::platform(
                    hr.0,
                    format!("SetDefaultEndpoint failed for role {}", role.0),
                ));
            }
        }

        info!("[MMDevice] Default {} set to {}", direction, id);
        Ok(())
    }

    fn register(&self, sink: NativeSink) -> Result<()> {
        let mut registration = self.registration.lock();
        if registration.is_some() {
            warn!("[MMDevice] Replacing existing notification client");
        }

        let enumerator = enumerator()?;
        let client: IMMNotificationClient = NotificationClient {
            sink,
            role: self.role,
        }
        .into();
        unsafe { enumerator.RegisterEndpointNotificationCallback(&client) }
            .map_err(|e| platform_error("RegisterEndpointNotificationCallback", e))?;

        if let Some(previous) = registration.replace(Registration { enumerator, client }) {
            let _ = unsafe {
                previous
                    .enumerator
                    .UnregisterEndpointNotificationCallback(&previous.client)
            };
        }

        info!("[MMDevice] Listening for endpoint notifications");
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        let Some(registration) = self.registration.lock().take() else {
            return Ok(());
        };
        // Returns once no further callbacks will be started for this client
        unsafe {
            registration
                .enumerator
                .UnregisterEndpointNotificationCallback(&registration.client)
        }
        .map_err(|e| platform_error("UnregisterEndpointNotificationCallback", e))?;

        info!("[MMDevice] Stopped listening for endpoint notifications");
        Ok(())
    }
}
