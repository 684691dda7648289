//! Port I/O bus: routes guest `IN`/`OUT` accesses to device models.

use crate::devices::{DeviceError, IoDirection, PortIoDevice};
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps each 16-bit port number to the device registered for it.
///
/// Registration covers an inclusive port range; dispatch is a plain lookup.
/// Accesses to unmapped ports fail with [`DeviceError::UnhandledPort`],
/// which the VCPU loop logs without faulting the guest.
#[derive(Default)]
pub struct IoBus {
    ports: HashMap<u16, Arc<dyn PortIoDevice>>,
}

impl IoBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `device` for every port in `start..=end`.
    ///
    /// A port that is already mapped is overwritten; the old mapping is
    /// reported once so a misconfigured port map is visible in the logs.
    pub fn register(&mut self, start: u16, end: u16, device: Arc<dyn PortIoDevice>) {
        for port in start..=end {
            if self.ports.insert(port, Arc::clone(&device)).is_some() {
                warn!("io bus: port {port:#06x} re-registered, previous device replaced");
            }
            if port == u16::MAX {
                break;
            }
        }
    }

    /// Route one access to the device owning `port`.
    pub fn handle_io(
        &self,
        port: u16,
        direction: IoDirection,
        size: u8,
        data: &mut [u8],
    ) -> Result<(), DeviceError> {
        let device = self
            .ports
            .get(&port)
            .ok_or(DeviceError::UnhandledPort { port })?;
        device.handle_io(port, direction, size, data)
    }
}
