//! Audio control configuration
//!
//! Loaded from JSON; every field has a default so partial documents work.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::audio::error::{AudioControlError, Result};

/// MMDevice endpoint role whose default-device changes are tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    #[default]
    Console,
    Multimedia,
    Communications,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioControlConfig {
    /// Register per-device liveness listeners (coarse backends only)
    pub track_liveness: bool,
    /// Report a device as connected when its liveness probe fails
    ///
    /// Every fallback is logged at `warn`, so a failing probe stays visible
    /// even when the device is reported healthy.
    pub assume_connected_when_unknown: bool,
    /// Role filter for MMDevice default-change notifications
    pub default_role: EndpointRole,
    /// Reconcile once right after native registration to pick up changes
    /// that raced with the initial enumeration
    pub catch_up_on_start: bool,
}

impl Default for AudioControlConfig {
    fn default() -> Self {
        Self {
            track_liveness: true,
            assume_connected_when_unknown: true,
            default_role: EndpointRole::Console,
            catch_up_on_start: true,
        }
    }
}

impl AudioControlConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| AudioControlError::Config(e.to_string()))
    }

    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| AudioControlError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&content)
    }
}
