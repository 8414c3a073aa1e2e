//! Scripted in-memory collaborator for unit tests

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::audio::backend::*;
use crate::audio::error::{AudioControlError, Result};
use crate::audio::types::*;

/// Output/input-capable record with a readable name and alive liveness
pub fn record(id: &str, handle: u64, input: bool, output: bool) -> EndpointRecord {
    EndpointRecord {
        handle: PlatformHandle::new(handle),
        id: id.to_string(),
        name: Some(format!("Device {}", id)),
        has_input_streams: input,
        has_output_streams: output,
        liveness: Liveness::Alive,
    }
}

/// Handler that forwards every event into a channel
pub fn capture() -> (DeviceEventCallback, Receiver<DeviceEvent>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let handler: DeviceEventCallback = Arc::new(move |event| {
        let _ = tx.send(event);
    });
    (handler, rx)
}

/// Native query a test can pause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldPoint {
    GetDefault,
    Lookup,
}

/// Parks the next matching query after it has read its answer
pub struct Hold {
    reached: Receiver<()>,
    release: Sender<()>,
}

impl Hold {
    /// Block until the held query has its answer and is parked
    pub fn wait_reached(&self) {
        self.reached
            .recv_timeout(Duration::from_secs(5))
            .expect("held query never ran");
    }

    pub fn release(self) {
        let _ = self.release.send(());
    }
}

struct Parked {
    reached: Sender<()>,
    release: Receiver<()>,
}

impl Parked {
    fn park(self) {
        let _ = self.reached.send(());
        let _ = self.release.recv_timeout(Duration::from_secs(5));
    }
}

#[derive(Default)]
struct FakeState {
    devices: Vec<EndpointRecord>,
    defaults: ActiveIds,
    enumerate_calls: usize,
    fail_enumerate: bool,
    set_default_error: Option<AudioControlError>,
    set_default_calls: Vec<(String, Direction)>,
    watched: HashSet<PlatformHandle>,
    sink: Option<NativeSink>,
    register_calls: usize,
    unregister_calls: usize,
    /// Devices that appear the moment `register` is called
    appear_on_register: Vec<EndpointRecord>,
    holds: Vec<(HoldPoint, Parked)>,
}

impl FakeState {
    fn take_hold(&mut self, point: HoldPoint) -> Option<Parked> {
        let index = self.holds.iter().position(|(p, _)| *p == point)?;
        Some(self.holds.remove(index).1)
    }
}

pub struct FakeBackend {
    model: SignalModel,
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn coarse() -> Self {
        Self::with_model(SignalModel::Coarse)
    }

    pub fn precise() -> Self {
        Self::with_model(SignalModel::Precise)
    }

    fn with_model(model: SignalModel) -> Self {
        Self {
            model,
            state: Mutex::new(FakeState::default()),
        }
    }

    // === Scripting ===

    pub fn set_devices(&self, devices: Vec<EndpointRecord>) {
        self.state.lock().devices = devices;
    }

    pub fn add_device(&self, device: EndpointRecord) {
        self.state.lock().devices.push(device);
    }

    pub fn remove_device(&self, id: &str) {
        self.state.lock().devices.retain(|d| d.id != id);
    }

    pub fn set_liveness(&self, id: &str, liveness: Liveness) {
        let mut state = self.state.lock();
        if let Some(device) = state.devices.iter_mut().find(|d| d.id == id) {
            device.liveness = liveness;
        }
    }

    pub fn set_default_output(&self, id: Option<&str>) {
        self.state.lock().defaults.output = id.map(str::to_string);
    }

    pub fn set_default_input(&self, id: Option<&str>) {
        self.state.lock().defaults.input = id.map(str::to_string);
    }

    /// Script a device that shows up between enumeration and registration
    pub fn add_on_register(&self, device: EndpointRecord) {
        self.state.lock().appear_on_register.push(device);
    }

    /// Pause the next `point` query once it has read the scripted state
    pub fn hold(&self, point: HoldPoint) -> Hold {
        let (reached_tx, reached_rx) = crossbeam_channel::bounded(1);
        let (release_tx, release_rx) = crossbeam_channel::bounded(1);
        self.state.lock().holds.push((
            point,
            Parked {
                reached: reached_tx,
                release: release_rx,
            },
        ));
        Hold {
            reached: reached_rx,
            release: release_tx,
        }
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.state.lock().fail_enumerate = fail;
    }

    pub fn fail_set_default(&self, error: AudioControlError) {
        self.state.lock().set_default_error = Some(error);
    }

    /// Deliver a native event to the registered sink, if any
    pub fn fire(&self, event: RawNativeEvent) {
        let sink = self.state.lock().sink.clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    // === Inspection ===

    pub fn enumerate_calls(&self) -> usize {
        self.state.lock().enumerate_calls
    }

    pub fn set_default_calls(&self) -> Vec<(String, Direction)> {
        self.state.lock().set_default_calls.clone()
    }

    pub fn is_watching(&self, handle: u64) -> bool {
        self.state.lock().watched.contains(&PlatformHandle::new(handle))
    }

    pub fn watched_count(&self) -> usize {
        self.state.lock().watched.len()
    }

    pub fn is_registered(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    pub fn register_calls(&self) -> usize {
        self.state.lock().register_calls
    }

    pub fn unregister_calls(&self) -> usize {
        self.state.lock().unregister_calls
    }
}

impl NativeAudio for FakeBackend {
    fn name(&self) -> &'static str {
        "Fake"
    }

    fn signal_model(&self) -> SignalModel {
        self.model
    }

    fn enumerate(&self) -> Result<Vec<EndpointRecord>> {
        let mut state = self.state.lock();
        state.enumerate_calls += 1;
        if state.fail_enumerate {
            return Err(AudioControlError::Enumeration("scripted failure".to_string()));
        }
        Ok(state.devices.clone())
    }

    fn lookup(&self, id: &str) -> Result<EndpointRecord> {
        let (answer, hold) = {
            let mut state = self.state.lock();
            let answer = state
                .devices
                .iter()
                .find(|d| d.id == id)
                .cloned()
                .ok_or_else(|| AudioControlError::NotFound(id.to_string()));
            (answer, state.take_hold(HoldPoint::Lookup))
        };
        if let Some(parked) = hold {
            parked.park();
        }
        answer
    }

    fn resolve_handle(&self, handle: PlatformHandle) -> Result<EndpointRecord> {
        self.state
            .lock()
            .devices
            .iter()
            .find(|d| d.handle == handle)
            .cloned()
            .ok_or_else(|| AudioControlError::NotFound(handle.to_string()))
    }

    fn get_default(&self, direction: Direction) -> Result<Option<String>> {
        let (answer, hold) = {
            let mut state = self.state.lock();
            let answer = state.defaults.get(direction).map(str::to_string);
            (answer, state.take_hold(HoldPoint::GetDefault))
        };
        if let Some(parked) = hold {
            parked.park();
        }
        Ok(answer)
    }

    fn set_default(&self, id: &str, direction: Direction) -> Result<()> {
        let mut state = self.state.lock();
        state.set_default_calls.push((id.to_string(), direction));
        match state.set_default_error.clone() {
            Some(err) => Err(err),
            None => {
                state.defaults.set(direction, Some(id.to_string()));
                Ok(())
            }
        }
    }

    fn register(&self, sink: NativeSink) -> Result<()> {
        let mut state = self.state.lock();
        state.register_calls += 1;
        state.sink = Some(sink);
        let appeared = std::mem::take(&mut state.appear_on_register);
        state.devices.extend(appeared);
        Ok(())
    }

    fn unregister(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.unregister_calls += 1;
        state.sink = None;
        Ok(())
    }

    fn watch_liveness(&self, handle: PlatformHandle) {
        self.state.lock().watched.insert(handle);
    }

    fn unwatch_liveness(&self, handle: PlatformHandle) {
        self.state.lock().watched.remove(&handle);
    }
}
