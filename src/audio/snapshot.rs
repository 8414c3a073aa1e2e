//! Device snapshot builder
//!
//! Turns native endpoint records into canonical [`AudioDevice`] values.
//! Stateless: every input comes from the collaborator or the caller.

use tracing::{debug, warn};

use crate::audio::backend::{EndpointRecord, NativeAudio};
use crate::audio::error::{AudioControlError, Result};
use crate::audio::types::*;

/// Build the canonical device from a record and the current defaults
///
/// Returns `None` for records that must not enter the directory: unreadable
/// name, or no streams in either direction.
pub fn from_record(
    record: &EndpointRecord,
    defaults: &ActiveIds,
    assume_connected_when_unknown: bool,
) -> Option<AudioDevice> {
    let Some(name) = record.name.clone() else {
        debug!("Skipping endpoint {} ({}): name unreadable", record.id, record.handle);
        return None;
    };

    if !record.has_input_streams && !record.has_output_streams {
        debug!("Skipping endpoint {} ({}): no streams", record.id, record.handle);
        return None;
    }

    let is_connected = match record.liveness {
        Liveness::Alive => true,
        Liveness::Dead => false,
        Liveness::Unknown => {
            warn!(
                "Liveness probe failed for {} ({}), reporting {}",
                record.id,
                name,
                if assume_connected_when_unknown { "connected" } else { "disconnected" }
            );
            assume_connected_when_unknown
        }
    };

    let mut device = AudioDevice {
        id: record.id.clone(),
        name,
        supports_input: record.has_input_streams,
        supports_output: record.has_output_streams,
        is_active: false,
        is_connected,
    };
    device.is_active = defaults.is_active(&device);
    Some(device)
}

/// Snapshot builder bound to a collaborator
pub struct SnapshotBuilder<'a> {
    backend: &'a dyn NativeAudio,
    assume_connected_when_unknown: bool,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(backend: &'a dyn NativeAudio, assume_connected_when_unknown: bool) -> Self {
        Self {
            backend,
            assume_connected_when_unknown,
        }
    }

    /// Current defaults for both directions
    ///
    /// A failing default query counts as "no default" for that direction.
    pub fn defaults(&self) -> ActiveIds {
        let mut ids = ActiveIds::default();
        for direction in Direction::ALL {
            match self.backend.get_default(direction) {
                Ok(id) => ids.set(direction, id),
                Err(e) => debug!("[{}] Default {} query failed: {}", self.backend.name(), direction, e),
            }
        }
        ids
    }

    pub fn build(&self, record: &EndpointRecord, defaults: &ActiveIds) -> Option<AudioDevice> {
        from_record(record, defaults, self.assume_connected_when_unknown)
    }

    /// Fresh snapshot by stable id
    pub fn build_by_id(&self, id: &str) -> Result<AudioDevice> {
        let record = self.backend.lookup(id)?;
        let defaults = self.defaults();
        self.build(&record, &defaults)
            .ok_or_else(|| AudioControlError::NotFound(id.to_string()))
    }

    /// Fresh snapshot by platform handle
    pub fn build_by_handle(&self, handle: PlatformHandle) -> Result<AudioDevice> {
        let record = self.backend.resolve_handle(handle)?;
        let defaults = self.defaults();
        self.build(&record, &defaults)
            .ok_or_else(|| AudioControlError::NotFound(handle.to_string()))
    }

    /// Full enumeration as canonical devices
    pub fn enumerate(&self) -> Result<Vec<AudioDevice>> {
        let records = self.backend.enumerate()?;
        let defaults = self.defaults();
        Ok(records
            .iter()
            .filter_map(|record| self.build(record, &defaults))
            .collect())
    }
}
