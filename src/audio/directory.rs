//! Device directory
//!
//! Single source of truth for the endpoints the OS last reported, keyed by
//! stable id. One reader/writer lock guards the whole state: readers take
//! shared access, and every multi-step mutation runs inside [`DeviceDirectory::write`]
//! so no reader ever sees a half-applied change.
//!
//! Activity is stored as one marker per direction ([`ActiveIds`]); each
//! device's `is_active` is recomputed from the markers on every write, so at
//! most one device per direction can be active.
//!
//! Tickets order work that queries the native layer outside the lock: the
//! newest applied enumeration, the newest applied default per direction, and
//! the newest removal per id. A writer holding an older ticket applies nothing.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::audio::types::*;

#[derive(Debug, Default)]
struct DirectoryState {
    devices: HashMap<String, AudioDevice>,
    /// Last platform handle seen per stable id
    handles: HashMap<String, PlatformHandle>,
    active: ActiveIds,
    /// Ticket of the newest enumeration applied
    applied_ticket: u64,
    /// Ticket of the newest default query applied, per direction
    resolved: DirectionTickets,
    /// Ticket of the newest removal seen per id (known or not)
    removals: HashMap<String, u64>,
}

#[derive(Debug, Default, Clone, Copy)]
struct DirectionTickets {
    input: u64,
    output: u64,
}

impl DirectionTickets {
    fn get(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Input => self.input,
            Direction::Output => self.output,
        }
    }

    fn slot(&mut self, direction: Direction) -> &mut u64 {
        match direction {
            Direction::Input => &mut self.input,
            Direction::Output => &mut self.output,
        }
    }
}

impl DirectoryState {
    fn refresh_activity(&mut self, id: &str) {
        let active = &self.active;
        if let Some(device) = self.devices.get_mut(id) {
            device.is_active = active.is_active(device);
        }
    }
}

/// Thread-safe directory of known devices
#[derive(Debug, Default)]
pub struct DeviceDirectory {
    state: RwLock<DirectoryState>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    // === Shared access ===

    pub fn get(&self, id: &str) -> Option<AudioDevice> {
        self.state.read().devices.get(id).cloned()
    }

    /// All devices, ordered by id
    pub fn all(&self) -> Vec<AudioDevice> {
        let mut devices: Vec<AudioDevice> = self.state.read().devices.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn ids(&self) -> HashSet<String> {
        self.state.read().devices.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().devices.is_empty()
    }

    pub fn active(&self, direction: Direction) -> Option<String> {
        self.state.read().active.get(direction).map(str::to_string)
    }

    pub fn id_for_handle(&self, handle: PlatformHandle) -> Option<String> {
        let state = self.state.read();
        state
            .handles
            .iter()
            .find(|(_, h)| **h == handle)
            .map(|(id, _)| id.clone())
    }

    pub fn handles(&self) -> Vec<PlatformHandle> {
        self.state.read().handles.values().copied().collect()
    }

    // === Exclusive access ===

    pub fn upsert(&self, device: AudioDevice) -> Option<AudioDevice> {
        self.write(|txn| txn.upsert(device))
    }

    pub fn remove(&self, id: &str) -> Option<AudioDevice> {
        self.write(|txn| txn.remove(id))
    }

    /// Atomically replace the whole directory
    pub fn replace_all(
        &self,
        devices: impl IntoIterator<Item = (AudioDevice, PlatformHandle)>,
        active: ActiveIds,
    ) {
        self.write(|txn| txn.replace_all(devices, active));
    }

    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = DirectoryState::default();
    }

    /// Run a multi-step mutation under the write lock
    ///
    /// The closure must not call into user code or block on native queries.
    pub fn write<R>(&self, f: impl FnOnce(&mut DirectoryTxn<'_>) -> R) -> R {
        let mut state = self.state.write();
        let mut txn = DirectoryTxn { state: &mut *state };
        f(&mut txn)
    }
}

/// Exclusive view of the directory for the duration of one mutation
pub struct DirectoryTxn<'a> {
    state: &'a mut DirectoryState,
}

impl DirectoryTxn<'_> {
    pub fn get(&self, id: &str) -> Option<&AudioDevice> {
        self.state.devices.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.devices.contains_key(id)
    }

    pub fn ids(&self) -> HashSet<String> {
        self.state.devices.keys().cloned().collect()
    }

    pub fn active(&self, direction: Direction) -> Option<&str> {
        self.state.active.get(direction)
    }

    pub fn handle_of(&self, id: &str) -> Option<PlatformHandle> {
        self.state.handles.get(id).copied()
    }

    pub fn applied_ticket(&self) -> u64 {
        self.state.applied_ticket
    }

    pub fn set_applied_ticket(&mut self, ticket: u64) {
        self.state.applied_ticket = ticket;
    }

    /// Claim the `direction` marker for a default query issued at `ticket`
    ///
    /// Returns false, and records nothing, when a newer query was already
    /// applied.
    pub fn claim_resolve(&mut self, direction: Direction, ticket: u64) -> bool {
        let slot = self.state.resolved.slot(direction);
        if ticket < *slot {
            return false;
        }
        *slot = ticket;
        true
    }

    pub fn resolve_ticket(&self, direction: Direction) -> u64 {
        self.state.resolved.get(direction)
    }

    /// Record that `id` was reported removed at `ticket`
    pub fn note_removed(&mut self, id: &str, ticket: u64) {
        let entry = self.state.removals.entry(id.to_string()).or_insert(0);
        *entry = (*entry).max(ticket);
    }

    /// Whether a removal of `id` newer than `ticket` has been seen
    ///
    /// An insert issued at `ticket` that passes this check retires older
    /// removal records for the id.
    pub fn removed_since(&mut self, id: &str, ticket: u64) -> bool {
        match self.state.removals.get(id) {
            Some(&removed) if removed > ticket => true,
            Some(_) => {
                self.state.removals.remove(id);
                false
            }
            None => false,
        }
    }

    /// Replace every device, handle and marker in one step
    pub fn replace_all(
        &mut self,
        devices: impl IntoIterator<Item = (AudioDevice, PlatformHandle)>,
        active: ActiveIds,
    ) {
        let state = &mut *self.state;
        state.devices.clear();
        state.handles.clear();
        state.active = active;
        for (device, handle) in devices {
            let id = device.id.clone();
            state.handles.insert(id.clone(), handle);
            state.devices.insert(id.clone(), device);
            state.refresh_activity(&id);
        }
    }

    /// Record the current handle for `id`, returning the previous one
    pub fn set_handle(&mut self, id: &str, handle: PlatformHandle) -> Option<PlatformHandle> {
        self.state.handles.insert(id.to_string(), handle)
    }

    /// Insert or refresh a device; `is_active` comes from the markers
    pub fn upsert(&mut self, device: AudioDevice) -> Option<AudioDevice> {
        let id = device.id.clone();
        let previous = self.state.devices.insert(id.clone(), device);
        self.state.refresh_activity(&id);
        previous
    }

    /// Drop a device, its handle, and any activity marker pointing at it
    pub fn remove(&mut self, id: &str) -> Option<AudioDevice> {
        let removed = self.state.devices.remove(id)?;
        self.state.handles.remove(id);
        for direction in Direction::ALL {
            if self.state.active.get(direction) == Some(id) {
                self.state.active.set(direction, None);
            }
        }
        Some(removed)
    }

    /// Move the `direction` marker to `id`
    ///
    /// Returns false when the marker already pointed there.
    pub fn set_active(&mut self, direction: Direction, id: Option<&str>) -> bool {
        if self.state.active.get(direction) == id {
            return false;
        }
        let previous = self.state.active.get(direction).map(str::to_string);
        self.state.active.set(direction, id.map(str::to_string));

        if let Some(previous) = previous {
            self.state.refresh_activity(&previous);
        }
        if let Some(id) = id {
            self.state.refresh_activity(id);
        }
        true
    }

    /// Update connectivity; returns the updated device and whether it changed
    pub fn set_connected(&mut self, id: &str, connected: bool) -> Option<(AudioDevice, bool)> {
        let device = self.state.devices.get_mut(id)?;
        let changed = device.is_connected != connected;
        device.is_connected = connected;
        Some((device.clone(), changed))
    }
}
