//! Legacy-PC device models for the retrobox hypervisor.
//!
//! Every device implements [`PortIoDevice`] and is reached exclusively
//! through the [`bus::IoBus`].  Devices that need to signal interrupts hold
//! an [`InterruptLine`] capability (implemented by the PIC pair) rather than
//! a reference to the PIC itself, which keeps the device graph acyclic.

pub mod bus;
pub mod keyboard;
pub mod ne2000;
pub mod pic;
pub mod pit;
pub mod rtc;
pub mod serial;

use thiserror::Error;

/// Direction of a guest port I/O access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    /// Guest `IN` instruction: the device fills the data buffer.
    In,
    /// Guest `OUT` instruction: the device consumes the data buffer.
    Out,
}

/// Errors a device model can report for a single port access.
///
/// These never reach the guest as faults; the VCPU loop logs them and
/// continues.  Guest-visible failures are reported through device status
/// registers and IRQs instead.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("no device registered for port {port:#06x}")]
    UnhandledPort { port: u16 },

    #[error("unsupported {size}-byte access on port {port:#06x}")]
    UnsupportedWidth { port: u16, size: u8 },

    #[error("write to read-only port {port:#06x}")]
    ReadOnly { port: u16 },

    #[error("access to unimplemented register offset {offset:#04x}")]
    InvalidRegister { offset: u16 },
}

/// A device that handles guest port I/O.
///
/// `data` is a view into the VCPU's exit buffer: exactly `size` bytes long,
/// read by the device for [`IoDirection::Out`] and filled by the device for
/// [`IoDirection::In`].  Implementations guard their register state with an
/// internal mutex, so the handler takes `&self`.
pub trait PortIoDevice: Send + Sync {
    fn handle_io(
        &self,
        port: u16,
        direction: IoDirection,
        size: u8,
        data: &mut [u8],
    ) -> Result<(), DeviceError>;
}

/// Capability to assert or deassert a numbered interrupt line.
///
/// Lines 0–7 belong to the master PIC, 8–15 to the slave.  Out-of-range
/// lines are ignored.
pub trait InterruptLine: Send + Sync {
    /// Latch an interrupt request on `line`.
    fn raise_irq(&self, line: u8);

    /// Withdraw a previously latched request on `line`.
    fn lower_irq(&self, line: u8);
}

/// IRQ line of the programmable interval timer (counter 0).
pub const PIT_IRQ: u8 = 0;

/// IRQ line of the PS/2 keyboard controller.
pub const KEYBOARD_IRQ: u8 = 1;

/// IRQ line of the COM1 serial port.
pub const SERIAL_IRQ: u8 = 4;

/// IRQ line of the real-time clock (slave IR0).
pub const RTC_IRQ: u8 = 8;

/// IRQ line of the NE2000 Ethernet controller.
pub const NE2000_IRQ: u8 = 9;
