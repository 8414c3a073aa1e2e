//! Shared audio types used by all backends
//!
//! This module contains platform-agnostic types for audio endpoint management.
//! NO platform-specific imports allowed here.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Stream direction of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Input, Direction::Output];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Canonical view of an audio endpoint
///
/// `id` is the only stable identity (CoreAudio device UID, MMDevice endpoint
/// id). Two values with the same `id` describe the same device even when the
/// other fields differ between observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDevice {
    /// Stable identifier, survives reboots
    pub id: String,
    /// Human-readable device name
    pub name: String,
    pub supports_input: bool,
    pub supports_output: bool,
    /// Current default device for at least one direction it supports
    pub is_active: bool,
    pub is_connected: bool,
}

impl AudioDevice {
    /// Check if the device carries streams in the given direction
    pub fn supports(&self, direction: Direction) -> bool {
        match direction {
            Direction::Input => self.supports_input,
            Direction::Output => self.supports_output,
        }
    }

    /// Devices with neither input nor output streams are enumeration
    /// artifacts and never enter the directory.
    pub fn has_streams(&self) -> bool {
        self.supports_input || self.supports_output
    }
}

/// Opaque, non-stable backend handle (AudioObjectID on macOS, collection slot
/// on Windows). Only valid within a single native call sequence; never compared
/// across enumerations without resolving it to a stable id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformHandle(u64);

impl PlatformHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PlatformHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Result of the native liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveness {
    Alive,
    Dead,
    /// The probe itself failed (transport/alive property unreadable)
    Unknown,
}

/// Current default device per direction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveIds {
    pub input: Option<String>,
    pub output: Option<String>,
}

impl ActiveIds {
    pub fn get(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Input => self.input.as_deref(),
            Direction::Output => self.output.as_deref(),
        }
    }

    pub fn set(&mut self, direction: Direction, id: Option<String>) {
        match direction {
            Direction::Input => self.input = id,
            Direction::Output => self.output = id,
        }
    }

    /// Whether `device` is the default for any direction it supports
    pub fn is_active(&self, device: &AudioDevice) -> bool {
        Direction::ALL
            .iter()
            .any(|&d| device.supports(d) && self.get(d) == Some(device.id.as_str()))
    }
}

/// Device change event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceEventKind {
    /// A device appeared in the directory
    Added,
    /// A device left the directory
    Removed,
    /// The default device for a direction changed
    ActiveChanged,
    /// A known device lost liveness (it stays in the directory)
    Disconnected,
}

/// Normalized device change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device_id: String,
    /// Snapshot of the device, when it could still be resolved
    pub device: Option<AudioDevice>,
}

impl DeviceEvent {
    pub fn added(device: AudioDevice) -> Self {
        Self::with_device(DeviceEventKind::Added, device)
    }

    pub fn removed(device: AudioDevice) -> Self {
        Self::with_device(DeviceEventKind::Removed, device)
    }

    pub fn active_changed(device: AudioDevice) -> Self {
        Self::with_device(DeviceEventKind::ActiveChanged, device)
    }

    pub fn disconnected(device: AudioDevice) -> Self {
        Self::with_device(DeviceEventKind::Disconnected, device)
    }

    fn with_device(kind: DeviceEventKind, device: AudioDevice) -> Self {
        Self {
            kind,
            device_id: device.id.clone(),
            device: Some(device),
        }
    }
}

/// Callback type for device change events
pub type DeviceEventCallback = Arc<dyn Fn(DeviceEvent) + Send + Sync>;
