//! COM1 serial port (16550A) on ports `0x3F8..=0x3FF`.
//!
//! The register model comes from [`vm_superio::Serial`]; this module wires
//! it to the port I/O bus and replaces the usual eventfd trigger with one
//! that raises IRQ 4 on the userspace PIC.  Transmitted bytes go to the
//! embedder-supplied sink (typically stdout); sink errors are logged and
//! surfaced through line status only, never to the VCPU.

use crate::devices::{DeviceError, InterruptLine, IoDirection, PortIoDevice, SERIAL_IRQ};
use log::{trace, warn};
use std::io::Write;
use std::sync::{Arc, Mutex};
use vm_superio::serial::NoEvents;
use vm_superio::{Serial, Trigger};

/// First COM1 register port.
pub const COM1_PORT_BASE: u16 = 0x3f8;
/// Last COM1 register port (8 registers).
pub const COM1_PORT_END: u16 = 0x3ff;

/// Interrupt trigger that asserts the COM1 line on the PIC.
pub struct PicTrigger {
    line: Arc<dyn InterruptLine>,
}

impl PicTrigger {
    pub fn new(line: Arc<dyn InterruptLine>) -> Self {
        Self { line }
    }
}

impl Trigger for PicTrigger {
    type E = std::io::Error;

    fn trigger(&self) -> Result<(), Self::E> {
        self.line.raise_irq(SERIAL_IRQ);
        Ok(())
    }
}

type Uart = Serial<PicTrigger, NoEvents, Box<dyn Write + Send>>;

/// The COM1 UART as a bus device.
pub struct SerialDevice {
    uart: Mutex<Uart>,
}

impl SerialDevice {
    /// Create the UART with `out` as its transmit sink.
    pub fn new(line: Arc<dyn InterruptLine>, out: Box<dyn Write + Send>) -> Self {
        Self {
            uart: Mutex::new(Serial::new(PicTrigger::new(line), out)),
        }
    }
}

impl PortIoDevice for SerialDevice {
    fn handle_io(
        &self,
        port: u16,
        direction: IoDirection,
        size: u8,
        data: &mut [u8],
    ) -> Result<(), DeviceError> {
        if size != 1 {
            return Err(DeviceError::UnsupportedWidth { port, size });
        }
        let offset = (port - COM1_PORT_BASE) as u8;
        let mut uart = self.uart.lock().unwrap();
        match direction {
            IoDirection::In => {
                data[0] = uart.read(offset);
                trace!("serial: read {:#04x} from register {offset}", data[0]);
            }
            IoDirection::Out => {
                trace!("serial: write {:#04x} to register {offset}", data[0]);
                if let Err(e) = uart.write(offset, data[0]) {
                    warn!("serial: write to register {offset:#04x} failed: {e:?}");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::RecordingLine;

    /// Captures everything the UART transmits.
    #[derive(Clone, Default)]
    struct CaptureSink {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for CaptureSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buf.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    const THR: u16 = COM1_PORT_BASE;
    const IER: u16 = COM1_PORT_BASE + 1;
    const IIR: u16 = COM1_PORT_BASE + 2;
    const LCR: u16 = COM1_PORT_BASE + 3;
    const LSR: u16 = COM1_PORT_BASE + 5;
    const SCR: u16 = COM1_PORT_BASE + 7;

    fn new_serial() -> (SerialDevice, CaptureSink, Arc<RecordingLine>) {
        let line = Arc::new(RecordingLine::default());
        let sink = CaptureSink::default();
        let serial = SerialDevice::new(line.clone(), Box::new(sink.clone()));
        (serial, sink, line)
    }

    fn write(dev: &SerialDevice, port: u16, val: u8) {
        let mut data = [val];
        dev.handle_io(port, IoDirection::Out, 1, &mut data).unwrap();
    }

    fn read(dev: &SerialDevice, port: u16) -> u8 {
        let mut data = [0u8];
        dev.handle_io(port, IoDirection::In, 1, &mut data).unwrap();
        data[0]
    }

    #[test]
    fn transmit_reaches_sink() {
        let (dev, sink, _) = new_serial();
        write(&dev, THR, b'P');
        write(&dev, THR, b'C');
        assert_eq!(*sink.buf.lock().unwrap(), b"PC");
    }

    #[test]
    fn transmitter_reports_empty_after_write() {
        let (dev, _, _) = new_serial();
        write(&dev, THR, b'x');
        let lsr = read(&dev, LSR);
        assert_eq!(lsr & 0x20, 0x20, "THRE set");
        assert_eq!(lsr & 0x40, 0x40, "TEMT set");
    }

    #[test]
    fn scratch_register_roundtrip() {
        let (dev, _, _) = new_serial();
        for val in [0x00u8, 0x42, 0xff] {
            write(&dev, SCR, val);
            assert_eq!(read(&dev, SCR), val);
        }
    }

    #[test]
    fn dlab_selects_divisor_latch() {
        let (dev, sink, _) = new_serial();
        write(&dev, LCR, 0x80); // DLAB on
        write(&dev, THR, 0x23); // divisor low, not a transmit
        assert_eq!(read(&dev, THR), 0x23);
        assert!(sink.buf.lock().unwrap().is_empty());

        write(&dev, LCR, 0x03); // DLAB off, 8N1
        write(&dev, THR, b'A');
        assert_eq!(*sink.buf.lock().unwrap(), b"A");
    }

    #[test]
    fn thr_empty_interrupt_raises_com1_line() {
        let (dev, _, line) = new_serial();
        write(&dev, IER, 0x02); // enable THR-empty interrupt
        write(&dev, THR, b'z');
        assert!(line.raised_lines().contains(&SERIAL_IRQ));
    }

    #[test]
    fn iir_idles_at_no_interrupt_pending() {
        let (dev, _, _) = new_serial();
        assert_eq!(read(&dev, IIR) & 0x01, 0x01);
    }

    #[test]
    fn word_access_is_rejected() {
        let (dev, _, _) = new_serial();
        let mut data = [0u8; 4];
        let err = dev
            .handle_io(THR, IoDirection::Out, 4, &mut data)
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedWidth { .. }));
    }
}
