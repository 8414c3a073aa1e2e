//! Outward API
//!
//! [`AudioControl`] is what callers use: list devices, query and switch the
//! default device, and subscribe to normalized change events.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::{debug, info};

use crate::audio::backend::{create_backend, NativeAudio};
use crate::audio::context::AudioContext;
use crate::audio::error::{AudioControlError, Result};
use crate::audio::monitor::{Monitor, Subscription};
use crate::audio::types::*;
use crate::config::AudioControlConfig;

pub struct AudioControl {
    monitor: Arc<Monitor>,
}

impl AudioControl {
    /// Control bound to the native backend of this platform
    pub fn system() -> Result<Self> {
        Self::system_with_config(AudioControlConfig::default())
    }

    pub fn system_with_config(config: AudioControlConfig) -> Result<Self> {
        let backend = create_backend(&config)?;
        info!("Using {} audio backend", backend.name());
        Ok(Self::new(backend, config))
    }

    /// Control over an explicit collaborator
    pub fn new(backend: Arc<dyn NativeAudio>, config: AudioControlConfig) -> Self {
        let ctx = Arc::new(AudioContext::new(backend, config));
        Self {
            monitor: Arc::new(Monitor::new(ctx)),
        }
    }

    fn ctx(&self) -> &AudioContext {
        self.monitor.context()
    }

    pub fn backend_name(&self) -> &'static str {
        self.ctx().tag()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }

    /// Every known device, ordered by id
    ///
    /// Served from the directory while monitoring, otherwise from a fresh
    /// enumeration.
    pub fn list_devices(&self) -> Result<Vec<AudioDevice>> {
        if self.monitor.is_running() {
            return Ok(self.ctx().directory.all());
        }
        let mut devices = self.ctx().snapshot().enumerate()?;
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    pub fn get_active_output(&self) -> Result<AudioDevice> {
        self.ctx().resolver().active_device(Direction::Output)
    }

    pub fn get_active_input(&self) -> Result<AudioDevice> {
        self.ctx().resolver().active_device(Direction::Input)
    }

    /// Make `id` the default output device
    ///
    /// Nothing is mutated here; the native default-changed signal that follows
    /// drives the directory and the `ActiveChanged` event.
    pub fn set_active_output(&self, id: &str) -> Result<()> {
        self.set_active(id, Direction::Output)
    }

    pub fn set_active_input(&self, id: &str) -> Result<()> {
        self.set_active(id, Direction::Input)
    }

    fn set_active(&self, id: &str, direction: Direction) -> Result<()> {
        let ctx = self.ctx();
        let record = ctx.backend.lookup(id)?;

        let capable = match direction {
            Direction::Input => record.has_input_streams,
            Direction::Output => record.has_output_streams,
        };
        if !capable {
            return Err(match direction {
                Direction::Input => AudioControlError::NotInputCapable(id.to_string()),
                Direction::Output => AudioControlError::NotOutputCapable(id.to_string()),
            });
        }

        ctx.backend.set_default(id, direction)?;
        debug!("[{}] Requested {} as default {}", ctx.tag(), id, direction);
        Ok(())
    }

    /// Deliver device changes to `handler`
    ///
    /// The first subscription starts monitoring; later ones replace the
    /// handler. Events stop when the current subscription is dropped.
    pub fn on_device_change<F>(&self, handler: F) -> Result<Subscription>
    where
        F: Fn(DeviceEvent) + Send + Sync + 'static,
    {
        self.monitor.subscribe(Arc::new(handler))
    }

    /// Channel-based variant of [`on_device_change`](Self::on_device_change)
    pub fn on_device_change_channel(&self) -> Result<(Subscription, Receiver<DeviceEvent>)> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let subscription = self.on_device_change(move |event| {
            // Receiver gone: nothing left to deliver to
            let _ = tx.send(event);
        })?;
        Ok((subscription, rx))
    }
}
