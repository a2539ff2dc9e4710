//! Physical sensor descriptions.

use serde::Serialize;

use crate::service::RawDeviceAttributes;

/// One physical tracking sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub serial: String,
    #[serde(skip)]
    pub handle: u32,
    /// Field of view angles in radians.
    pub horizontal_fov: f32,
    pub vertical_fov: f32,
    /// Maximum tracking range in millimeters.
    pub range: f32,
    /// Stereo baseline in millimeters.
    pub baseline: f32,
    pub is_embedded: bool,
    pub is_streaming: bool,
}

impl Device {
    pub fn new(handle: u32, serial: String, attributes: RawDeviceAttributes) -> Self {
        Self {
            serial,
            handle,
            horizontal_fov: attributes.horizontal_fov,
            vertical_fov: attributes.vertical_fov,
            range: attributes.range,
            baseline: attributes.baseline,
            is_embedded: attributes.is_embedded,
            is_streaming: attributes.is_streaming,
        }
    }

    pub fn invalid() -> Self {
        Self {
            serial: String::new(),
            handle: 0,
            horizontal_fov: 0.0,
            vertical_fov: 0.0,
            range: 0.0,
            baseline: 0.0,
            is_embedded: false,
            is_streaming: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.serial.is_empty()
    }
}

/// Known devices, with streaming devices kept ahead of idle ones.
#[derive(Debug, Clone, Default)]
pub struct DeviceList {
    devices: Vec<Device>,
}

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces by serial, then restores the streaming-first
    /// ordering (stable within each group).
    pub fn add_or_update(&mut self, device: Device) {
        if let Some(existing) = self.devices.iter_mut().find(|d| d.serial == device.serial) {
            *existing = device;
        } else {
            self.devices.push(device);
        }
        self.devices.sort_by_key(|d| !d.is_streaming);
    }

    pub fn remove_by_handle(&mut self, handle: u32) -> Option<Device> {
        let index = self.devices.iter().position(|d| d.handle == handle)?;
        Some(self.devices.remove(index))
    }

    /// The streaming device when one exists, else the first known device,
    /// else the invalid sentinel.
    pub fn active_device(&self) -> Device {
        self.devices.first().cloned().unwrap_or_else(Device::invalid)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
