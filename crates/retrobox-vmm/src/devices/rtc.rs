//! MC146818-style real-time clock and CMOS RAM on ports `0x70`/`0x71`.
//!
//! Date and time reads are backed by the host wall clock, converted to BCD
//! or binary and to 12- or 24-hour form according to status register B.
//! Writes to the date/time registers land in the CMOS array but never touch
//! host time.

use crate::devices::{DeviceError, InterruptLine, IoDirection, PortIoDevice, RTC_IRQ};
use chrono::{Datelike, Local, Timelike};
use std::sync::{Arc, Mutex};

/// Index/address register port.
pub const RTC_PORT_INDEX: u16 = 0x70;
/// Data register port.
pub const RTC_PORT_DATA: u16 = 0x71;

const REG_SECONDS: u8 = 0x00;
const REG_MINUTES: u8 = 0x02;
const REG_HOURS: u8 = 0x04;
const REG_DAY_OF_WEEK: u8 = 0x06;
const REG_DAY_OF_MONTH: u8 = 0x07;
const REG_MONTH: u8 = 0x08;
const REG_YEAR: u8 = 0x09;
const REG_A: u8 = 0x0a;
const REG_B: u8 = 0x0b;
const REG_C: u8 = 0x0c;
const REG_D: u8 = 0x0d;

/// Register A: update-in-progress (read-only, always reads 0 here).
const REG_A_UIP: u8 = 0x80;
/// Register B: periodic interrupt enable.
const REG_B_PIE: u8 = 0x40;
/// Register B: data mode, 1 = binary, 0 = BCD.
const REG_B_DM: u8 = 0x04;
/// Register B: hour mode, 1 = 24-hour, 0 = 12-hour.
const REG_B_2412: u8 = 0x02;
/// Register C: interrupt request flag.
const REG_C_IRQF: u8 = 0x80;
/// Register C: periodic interrupt flag.
const REG_C_PF: u8 = 0x40;
/// Register D: valid RAM and time.
const REG_D_VRT: u8 = 0x80;

struct RtcState {
    /// 128 bytes of CMOS RAM; the first 14 are the clock registers.
    registers: [u8; 128],
    index: u8,
}

impl RtcState {
    fn bcd_mode(&self) -> bool {
        self.registers[REG_B as usize] & REG_B_DM == 0
    }

    fn hour24_mode(&self) -> bool {
        self.registers[REG_B as usize] & REG_B_2412 != 0
    }

    /// Encode a clock value per the data-mode bit of register B.
    fn encode(&self, val: u32) -> u8 {
        if self.bcd_mode() {
            (((val / 10) << 4) | (val % 10)) as u8
        } else {
            val as u8
        }
    }

    fn read_register(&mut self) -> u8 {
        let now = Local::now();
        match self.index {
            REG_SECONDS => self.encode(now.second()),
            REG_MINUTES => self.encode(now.minute()),
            REG_HOURS => {
                let hour = now.hour();
                if self.hour24_mode() {
                    self.encode(hour)
                } else {
                    let pm = hour >= 12;
                    let mut h = hour % 12;
                    if h == 0 {
                        h = 12;
                    }
                    self.encode(h) | if pm { 0x80 } else { 0 }
                }
            }
            // RTC convention counts Sunday as day 1.
            REG_DAY_OF_WEEK => self.encode(now.weekday().num_days_from_sunday() + 1),
            REG_DAY_OF_MONTH => self.encode(now.day()),
            REG_MONTH => self.encode(now.month()),
            REG_YEAR => self.encode(now.year() as u32 % 100),
            REG_A => self.registers[REG_A as usize] & !REG_A_UIP,
            REG_C => {
                // Interrupt flags clear on read.
                let val = self.registers[REG_C as usize];
                self.registers[REG_C as usize] = 0;
                val
            }
            REG_D => self.registers[REG_D as usize] | REG_D_VRT,
            idx => self.registers[idx as usize],
        }
    }

    fn write_register(&mut self, val: u8) {
        match self.index {
            REG_A => self.registers[REG_A as usize] = val & !REG_A_UIP,
            // C and D are read-only status registers.
            REG_C | REG_D => {}
            idx => self.registers[idx as usize] = val,
        }
    }
}

/// The RTC/CMOS pair as a bus device.
pub struct Rtc {
    state: Mutex<RtcState>,
    line: Arc<dyn InterruptLine>,
}

impl Rtc {
    pub fn new(line: Arc<dyn InterruptLine>) -> Self {
        let mut registers = [0u8; 128];
        registers[REG_A as usize] = 0x26; // 32.768 kHz divider, 1.024 kHz rate
        registers[REG_B as usize] = REG_B_2412; // 24-hour BCD
        registers[REG_D as usize] = REG_D_VRT;
        Self {
            state: Mutex::new(RtcState { registers, index: 0 }),
            line,
        }
    }

    /// Periodic-interrupt hook: latches the flags in register C and raises
    /// IRQ 8 when the guest has enabled periodic interrupts.
    pub fn tick(&self) {
        let mut state = self.state.lock().unwrap();
        if state.registers[REG_B as usize] & REG_B_PIE != 0 {
            state.registers[REG_C as usize] |= REG_C_PF | REG_C_IRQF;
            self.line.raise_irq(RTC_IRQ);
        }
    }
}

impl PortIoDevice for Rtc {
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
            RTC_PORT_INDEX => match direction {
                // Bit 7 is the NMI-disable latch, not part of the index.
                IoDirection::Out => state.index = data[0] & 0x7f,
                IoDirection::In => data[0] = state.index,
            },
            RTC_PORT_DATA => match direction {
                IoDirection::Out => state.write_register(data[0]),
                IoDirection::In => data[0] = state.read_register(),
            },
            _ => return Err(DeviceError::UnhandledPort { port }),
        }
        Ok(())
    }
}
