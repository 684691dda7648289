//! 8254 programmable interval timer.
//!
//! The guest can program counters, latch them, and read them back; active
//! down-counting is not modelled.  [`Pit::tick`] is the hook through which
//! the VCPU loop periodically turns an armed counter 0 into IRQ 0 edges.

use crate::devices::{DeviceError, InterruptLine, IoDirection, PortIoDevice, PIT_IRQ};
use log::debug;
use std::sync::{Arc, Mutex};

/// Counter 0 data port.
pub const PIT_PORT_COUNTER0: u16 = 0x40;
/// Counter 1 data port (legacy DRAM refresh).
pub const PIT_PORT_COUNTER1: u16 = 0x41;
/// Counter 2 data port (PC speaker).
pub const PIT_PORT_COUNTER2: u16 = 0x42;
/// Mode/command register.
pub const PIT_PORT_COMMAND: u16 = 0x43;
/// System control port B; only the gate-A20 style status read is modelled.
pub const PIT_PORT_SYSTEM_B: u16 = 0x61;

/// Read/write mode from the control word (bits 5–4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RwMode {
    /// Latch command; not a data-transfer mode.
    Latch,
    Lsb,
    Msb,
    LsbThenMsb,
}

impl RwMode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => RwMode::Latch,
            1 => RwMode::Lsb,
            2 => RwMode::Msb,
            _ => RwMode::LsbThenMsb,
        }
    }
}

/// Byte phase for LSB-then-MSB transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Lo,
    Hi,
}

#[derive(Debug)]
struct Counter {
    value: u16,
    latch: u16,
    reload: u16,
    mode: u8,
    rw_mode: RwMode,
    bcd: bool,
    /// True while a latched value is waiting to be read out.
    latched: bool,
    read_phase: Phase,
    write_phase: Phase,
    /// Set once the guest has loaded a count.
    armed: bool,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: 0,
            latch: 0,
            reload: 0,
            // BIOS power-on convention: mode 3, LSB-then-MSB, binary.
            mode: 3,
            rw_mode: RwMode::LsbThenMsb,
            bcd: false,
            latched: false,
            read_phase: Phase::Lo,
            write_phase: Phase::Lo,
            armed: false,
        }
    }

    fn write(&mut self, val: u8) {
        match self.rw_mode {
            RwMode::Latch => {
                debug!("pit: data write while in latch mode, ignored");
            }
            RwMode::Lsb => {
                self.reload = u16::from(val);
                self.value = self.reload;
                self.armed = true;
            }
            RwMode::Msb => {
                self.reload = u16::from(val) << 8;
                self.value = self.reload;
                self.armed = true;
            }
            RwMode::LsbThenMsb => match self.write_phase {
                Phase::Lo => {
                    self.reload = (self.reload & 0xff00) | u16::from(val);
                    self.write_phase = Phase::Hi;
                }
                Phase::Hi => {
                    self.reload = (self.reload & 0x00ff) | (u16::from(val) << 8);
                    self.value = self.reload;
                    self.write_phase = Phase::Lo;
                    self.armed = true;
                }
            },
        }
    }

    fn read(&mut self) -> u8 {
        if self.latched {
            return match self.read_phase {
                Phase::Lo => {
                    self.read_phase = Phase::Hi;
                    self.latch as u8
                }
                Phase::Hi => {
                    self.read_phase = Phase::Lo;
                    self.latched = false;
                    (self.latch >> 8) as u8
                }
            };
        }
        match self.rw_mode {
            RwMode::Lsb => self.value as u8,
            RwMode::Msb => (self.value >> 8) as u8,
            _ => match self.read_phase {
                Phase::Lo => {
                    self.read_phase = Phase::Hi;
                    self.value as u8
                }
                Phase::Hi => {
                    self.read_phase = Phase::Lo;
                    (self.value >> 8) as u8
                }
            },
        }
    }
}

struct PitState {
    counters: [Counter; 3],
}

/// The three-channel interval timer behind ports `0x40..=0x43` and the
/// system B port at `0x61`.
pub struct Pit {
    state: Mutex<PitState>,
    line: Arc<dyn InterruptLine>,
}

impl Pit {
    pub fn new(line: Arc<dyn InterruptLine>) -> Self {
        Self {
            state: Mutex::new(PitState {
                counters: [Counter::new(), Counter::new(), Counter::new()],
            }),
            line,
        }
    }

    /// Periodic tick from the VCPU loop.
    ///
    /// Raises IRQ 0 whenever counter 0 has been loaded with a count and is
    /// in a repeating mode.  Masked requests die in the PIC, so calling
    /// this before the guest programs an interrupt handler is harmless.
    pub fn tick(&self) {
        let state = self.state.lock().unwrap();
        let ch0 = &state.counters[0];
        if ch0.armed && matches!(ch0.mode, 2 | 3) {
            self.line.raise_irq(PIT_IRQ);
        }
    }

    fn write_command(&self, state: &mut PitState, val: u8) {
        let select = (val >> 6) & 0x3;
        if select == 3 {
            // Read-back: accepted, counters are not status-latched.
            debug!("pit: read-back command {val:#04x} accepted without effect");
            return;
        }
        let counter = &mut state.counters[select as usize];
        let rw_bits = (val >> 4) & 0x3;
        if rw_bits == 0 {
            // Latch command: snapshot the live count, leave the transfer
            // mode untouched so reads revert to it afterwards.
            counter.latch = counter.value;
            counter.latched = true;
            counter.read_phase = Phase::Lo;
            return;
        }
        counter.rw_mode = RwMode::from_bits(rw_bits);
        counter.mode = (val >> 1) & 0x7;
        counter.bcd = val & 0x1 != 0;
        counter.read_phase = Phase::Lo;
        counter.write_phase = Phase::Lo;
        debug!(
            "pit: counter {select} configured mode={} bcd={}",
            counter.mode, counter.bcd
        );
    }
}

impl PortIoDevice for Pit {
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
        let mut state = self.state.lock().unwrap();
        match port {
            PIT_PORT_COUNTER0 | PIT_PORT_COUNTER1 | PIT_PORT_COUNTER2 => {
                let idx = (port - PIT_PORT_COUNTER0) as usize;
                match direction {
                    IoDirection::Out => state.counters[idx].write(data[0]),
                    IoDirection::In => data[0] = state.counters[idx].read(),
                }
            }
            PIT_PORT_COMMAND => match direction {
                IoDirection::Out => self.write_command(&mut state, data[0]),
                // The mode register is write-only.
                IoDirection::In => return Err(DeviceError::ReadOnly { port }),
            },
            PIT_PORT_SYSTEM_B => match direction {
                IoDirection::Out => debug!("pit: port 0x61 write {:#04x}", data[0]),
                // Gate A20 reads back high; timer outputs are not modelled.
                IoDirection::In => data[0] = 0x20,
            },
            _ => return Err(DeviceError::UnhandledPort { port }),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::RecordingLine;

    fn new_pit() -> (Pit, Arc<RecordingLine>) {
        let line = Arc::new(RecordingLine::default());
        (Pit::new(line.clone()), line)
    }

    fn write(pit: &Pit, port: u16, val: u8) {
        let mut data = [val];
        pit.handle_io(port, IoDirection::Out, 1, &mut data).unwrap();
    }

    fn read(pit: &Pit, port: u16) -> u8 {
        let mut data = [0u8];
        pit.handle_io(port, IoDirection::In, 1, &mut data).unwrap();
        data[0]
    }

    #[test]
    fn lsb_then_msb_load_and_readback() {
        let (pit, _) = new_pit();
        // Counter 0, LSB/MSB, mode 2, binary.
        write(&pit, PIT_PORT_COMMAND, 0b0011_0100);
        write(&pit, PIT_PORT_COUNTER0, 0x34);
        write(&pit, PIT_PORT_COUNTER0, 0x12);

        assert_eq!(read(&pit, PIT_PORT_COUNTER0), 0x34);
        assert_eq!(read(&pit, PIT_PORT_COUNTER0), 0x12);
    }

    #[test]
    fn lsb_only_mode_zero_extends() {
        let (pit, _) = new_pit();
        write(&pit, PIT_PORT_COMMAND, 0b0001_0100); // counter 0, LSB only
        write(&pit, PIT_PORT_COUNTER0, 0x7f);
        assert_eq!(read(&pit, PIT_PORT_COUNTER0), 0x7f);
    }

    #[test]
    fn msb_only_mode_shifts() {
        let (pit, _) = new_pit();
        write(&pit, PIT_PORT_COMMAND, 0b0110_0100); // counter 1, MSB only
        write(&pit, PIT_PORT_COUNTER1, 0xab);
        assert_eq!(read(&pit, PIT_PORT_COUNTER1), 0xab);
    }

    #[test]
    fn latch_survives_intervening_writes() {
        let (pit, _) = new_pit();
        write(&pit, PIT_PORT_COMMAND, 0b0011_0110); // counter 0, lo/hi, mode 3
        write(&pit, PIT_PORT_COUNTER0, 0xcd);
        write(&pit, PIT_PORT_COUNTER0, 0xab);

        // Latch counter 0, then overwrite the live count before reading.
        write(&pit, PIT_PORT_COMMAND, 0b0000_0000);
        write(&pit, PIT_PORT_COUNTER0, 0x11);
        write(&pit, PIT_PORT_COUNTER0, 0x22);

        assert_eq!(read(&pit, PIT_PORT_COUNTER0), 0xcd, "latched LSB");
        assert_eq!(read(&pit, PIT_PORT_COUNTER0), 0xab, "latched MSB");
        // Latch consumed: reads revert to the live value.
        assert_eq!(read(&pit, PIT_PORT_COUNTER0), 0x11);
        assert_eq!(read(&pit, PIT_PORT_COUNTER0), 0x22);
    }

    #[test]
    fn readback_command_is_accepted() {
        let (pit, _) = new_pit();
        write(&pit, PIT_PORT_COMMAND, 0b1100_0010);
        // Nothing latched, counters still readable.
        let _ = read(&pit, PIT_PORT_COUNTER0);
    }

    #[test]
    fn command_port_is_write_only() {
        let (pit, _) = new_pit();
        let mut data = [0u8];
        let err = pit
            .handle_io(PIT_PORT_COMMAND, IoDirection::In, 1, &mut data)
            .unwrap_err();
        assert!(matches!(err, DeviceError::ReadOnly { .. }));
    }

    #[test]
    fn system_port_b_reads_gate_a20_high() {
        let (pit, _) = new_pit();
        assert_eq!(read(&pit, PIT_PORT_SYSTEM_B), 0x20);
        write(&pit, PIT_PORT_SYSTEM_B, 0x03);
        assert_eq!(read(&pit, PIT_PORT_SYSTEM_B), 0x20);
    }

    #[test]
    fn tick_idle_counter_raises_nothing() {
        let (pit, line) = new_pit();
        pit.tick();
        assert!(line.raised_lines().is_empty());
    }

    #[test]
    fn tick_armed_rate_generator_raises_irq0() {
        let (pit, line) = new_pit();
        write(&pit, PIT_PORT_COMMAND, 0b0011_0100); // counter 0, mode 2
        write(&pit, PIT_PORT_COUNTER0, 0x9c);
        write(&pit, PIT_PORT_COUNTER0, 0x2e);
        pit.tick();
        assert_eq!(line.raised_lines(), vec![PIT_IRQ]);
    }

    #[test]
    fn tick_one_shot_mode_stays_quiet() {
        let (pit, line) = new_pit();
        write(&pit, PIT_PORT_COMMAND, 0b0011_0000); // counter 0, mode 0
        write(&pit, PIT_PORT_COUNTER0, 0x10);
        write(&pit, PIT_PORT_COUNTER0, 0x00);
        pit.tick();
        assert!(line.raised_lines().is_empty());
    }

    #[test]
    fn word_access_is_rejected() {
        let (pit, _) = new_pit();
        let mut data = [0u8; 2];
        let err = pit
            .handle_io(PIT_PORT_COUNTER0, IoDirection::Out, 2, &mut data)
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedWidth { .. }));
    }
}
