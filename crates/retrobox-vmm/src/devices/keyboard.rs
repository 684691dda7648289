//! PS/2 keyboard controller stub on ports `0x60`/`0x64`.
//!
//! Guests poll the status port and drain the data port; there is no scan
//! code translation and no command interface.  The buffer is preloaded with
//! a single byte so polling guests have something to read.

use crate::devices::{DeviceError, IoDirection, PortIoDevice};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Data register port.
pub const KEYBOARD_PORT_DATA: u16 = 0x60;
/// Status register port.
pub const KEYBOARD_PORT_STATUS: u16 = 0x64;

/// Status bit 0: output buffer full.
const STATUS_OBF: u8 = 0x01;

/// The keyboard controller stub.
pub struct Keyboard {
    buffer: Mutex<VecDeque<u8>>,
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

impl Keyboard {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(VecDeque::from([b'V'])),
        }
    }
}

impl PortIoDevice for Keyboard {
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
        if direction == IoDirection::Out {
            // Controller commands (LEDs, scan rates) are not modelled.
            return Err(DeviceError::ReadOnly { port });
        }
        let mut buffer = self.buffer.lock().unwrap();
        match port {
            KEYBOARD_PORT_STATUS => {
                data[0] = if buffer.is_empty() { 0 } else { STATUS_OBF };
            }
            KEYBOARD_PORT_DATA => {
                data[0] = buffer.pop_front().unwrap_or(0);
            }
            _ => return Err(DeviceError::UnhandledPort { port }),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(kbd: &Keyboard, port: u16) -> u8 {
        let mut data = [0u8];
        kbd.handle_io(port, IoDirection::In, 1, &mut data).unwrap();
        data[0]
    }

    #[test]
    fn status_tracks_buffer_then_data_drains_it() {
        let kbd = Keyboard::new();
        assert_eq!(read(&kbd, KEYBOARD_PORT_STATUS), STATUS_OBF);
        assert_eq!(read(&kbd, KEYBOARD_PORT_DATA), b'V');
        assert_eq!(read(&kbd, KEYBOARD_PORT_STATUS), 0);
        assert_eq!(read(&kbd, KEYBOARD_PORT_DATA), 0);
    }

    #[test]
    fn writes_are_rejected() {
        let kbd = Keyboard::new();
        let mut data = [0xffu8];
        let err = kbd
            .handle_io(KEYBOARD_PORT_DATA, IoDirection::Out, 1, &mut data)
            .unwrap_err();
        assert!(matches!(err, DeviceError::ReadOnly { port: 0x60 }));
    }

    #[test]
    fn word_access_is_rejected() {
        let kbd = Keyboard::new();
        let mut data = [0u8; 2];
        let err = kbd
            .handle_io(KEYBOARD_PORT_STATUS, IoDirection::In, 2, &mut data)
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedWidth { .. }));
    }
}
