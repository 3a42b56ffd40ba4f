use vole_core::{BackendDevice, BackendKind, Result};
use vole_device::{DeviceConfig, DeviceContext, Queue};

use crate::config::Config;

/// Where a tensor lives and where its operations run.
///
/// `Device::Device` carries the execution queue that the tensor's launches are
/// issued on. Outputs of an operation inherit the queue of their first
/// operand.
#[derive(Debug, Clone)]
pub enum Device {
    Cpu,
    Device(Queue),
}

impl Device {
    pub fn kind(&self) -> BackendKind {
        match self {
            Device::Cpu => BackendKind::Cpu,
            Device::Device(_) => BackendKind::Device,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Device::Cpu => "cpu".to_string(),
            Device::Device(q) => q.name(),
        }
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Open a device and a fresh queue on it.
    pub fn open(config: &DeviceConfig) -> Result<Device> {
        let ctx = DeviceContext::open(config)?;
        Ok(Device::Device(ctx.queue()?))
    }

    /// The device when one can be opened, otherwise the CPU.
    pub fn best_available(config: &Config) -> Device {
        match Device::open(&config.device) {
            Ok(device) => device,
            Err(e) => {
                log::warn!("falling back to cpu: {e}");
                Device::Cpu
            }
        }
    }

    /// The queue, for device tensors.
    pub fn queue(&self) -> Option<&Queue> {
        match self {
            Device::Cpu => None,
            Device::Device(q) => Some(q),
        }
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Device::Cpu, Device::Cpu) => true,
            (Device::Device(a), Device::Device(b)) => a.same_queue(b),
            _ => false,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
