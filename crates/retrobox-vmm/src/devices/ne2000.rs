//! NE2000 (DP8390) Ethernet controller at base port `0x300`.
//!
//! The guest sees the classic paged register file, the ASIC data port for
//! remote DMA and PROM reads, and the reset pseudo-register.  Received
//! frames land in the on-card RAM ring between PSTART and PSTOP, written by
//! a background ingress thread that polls the host network interface while
//! the NIC is started.  All guest-visible failures are reported through the
//! ISR and the interrupt line, never as bus errors.

use crate::devices::{DeviceError, InterruptLine, IoDirection, PortIoDevice, NE2000_IRQ};
use crate::net::HostNetInterface;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// First port of the NE2000 window.
pub const NE2000_PORT_BASE: u16 = 0x300;
/// Last port of the NE2000 window (32 ports).
pub const NE2000_PORT_END: u16 = NE2000_PORT_BASE + 0x1f;

/// On-card packet RAM size.
pub const NE2000_RAM_SIZE: usize = 64 * 1024;

/// Longest accepted Ethernet frame (without CRC).
const MAX_FRAME_LEN: usize = 1514;
/// Shortest transmittable frame.
const MIN_FRAME_LEN: usize = 60;
/// Receive-ring page size.
const PAGE_SIZE: usize = 256;

// DP8390 register offsets, page 0.
const REG_CR: u16 = 0x00;
const REG_PSTART: u16 = 0x01;
const REG_PSTOP: u16 = 0x02;
const REG_BNRY: u16 = 0x03;
const REG_TPSR: u16 = 0x04;
const REG_TBCR0: u16 = 0x05;
const REG_TBCR1: u16 = 0x06;
const REG_ISR: u16 = 0x07;
const REG_RSAR0: u16 = 0x08;
const REG_RSAR1: u16 = 0x09;
const REG_RBCR0: u16 = 0x0a;
const REG_RBCR1: u16 = 0x0b;
const REG_RCR: u16 = 0x0c;
const REG_TCR: u16 = 0x0d;
const REG_DCR: u16 = 0x0e;
const REG_IMR: u16 = 0x0f;

// Page 1.
const REG_PAR0: u16 = 0x01;
const REG_PAR5: u16 = 0x06;
const REG_CURR: u16 = 0x07;
const REG_MAR0: u16 = 0x08;
const REG_MAR7: u16 = 0x0f;

// ASIC window.
const ASIC_DATA: u16 = 0x10;
const ASIC_RESET: u16 = 0x1f;

// Command register bits.
const CR_STOP: u8 = 0x01;
const CR_START: u8 = 0x02;
const CR_TXP: u8 = 0x04;
const CR_RD0: u8 = 0x08;
const CR_RD1: u8 = 0x10;
const CR_RD2: u8 = 0x20;
const CR_RD_MASK: u8 = CR_RD0 | CR_RD1 | CR_RD2;

// Interrupt status register bits.
const ISR_PRX: u8 = 0x01;
const ISR_PTX: u8 = 0x02;
const ISR_RXE: u8 = 0x04;
const ISR_TXE: u8 = 0x08;
const ISR_OVW: u8 = 0x10;
const ISR_RDC: u8 = 0x40;
const ISR_RST: u8 = 0x80;

// Data configuration register bits.
const DCR_WTS: u8 = 0x01;
const DCR_BMS: u8 = 0x08;
const DCR_FT1: u8 = 0x40;

/// Receive-status byte stored in each ring header: packet received intact.
const RSR_PRX: u8 = 0x01;

struct Ne2000State {
    mac: [u8; 6],
    ram: Vec<u8>,

    cr: u8,
    isr: u8,
    imr: u8,
    dcr: u8,
    tcr: u8,
    rcr: u8,
    tpsr: u8,
    tbcr0: u8,
    tbcr1: u8,
    rsar0: u8,
    rsar1: u8,
    rbcr0: u8,
    rbcr1: u8,
    pstart: u8,
    pstop: u8,
    bnry: u8,
    curr: u8,
    mar: [u8; 8],

    /// Bytes moved through the ASIC data port since the DMA was armed.
    dma_progress: usize,
    /// Register page selected by CR bits 6..7.
    page: u8,
}

impl Ne2000State {
    fn power_on(mac: [u8; 6]) -> Self {
        let mut state = Self {
            mac,
            ram: vec![0; NE2000_RAM_SIZE],
            cr: CR_STOP,
            isr: ISR_RST,
            imr: 0,
            dcr: DCR_FT1 | DCR_BMS | DCR_WTS,
            tcr: 0,
            rcr: 0,
            tpsr: 0x40,
            tbcr0: 0,
            tbcr1: 0,
            rsar0: 0,
            rsar1: 0,
            rbcr0: 0,
            rbcr1: 0,
            pstart: 0x46,
            pstop: 0x80,
            bnry: 0x46,
            curr: 0x46,
            mar: [0; 8],
            dma_progress: 0,
            page: 0,
        };
        state.write_prom();
        state
    }

    /// Station PROM image: MAC in bytes 0..6, each byte doubled into the
    /// pair region as the word-mode read convenience.
    fn write_prom(&mut self) {
        let mac = self.mac;
        for (i, b) in mac.iter().enumerate() {
            self.ram[i * 2] = *b;
            self.ram[i * 2 + 1] = *b;
        }
        self.ram[..6].copy_from_slice(&mac);
    }

    /// Set an ISR bit and raise the NIC line if the mask allows it.
    fn flag_isr(&mut self, bit: u8, line: &dyn InterruptLine) {
        self.isr |= bit;
        if self.imr & bit != 0 {
            line.raise_irq(NE2000_IRQ);
        }
    }

    /// Reflect `(ISR & IMR)` onto the interrupt line.
    fn sync_irq(&self, line: &dyn InterruptLine) {
        if self.isr & self.imr != 0 {
            line.raise_irq(NE2000_IRQ);
        } else {
            line.lower_irq(NE2000_IRQ);
        }
    }

    fn started(&self) -> bool {
        self.cr & CR_STOP == 0 && self.cr & CR_START != 0
    }

    /// Hardware reset, as triggered through the ASIC reset register.
    fn reset(&mut self, line: &dyn InterruptLine) {
        self.cr = CR_STOP;
        self.isr = ISR_RST;
        self.imr = 0;
        self.dcr = DCR_WTS | DCR_BMS;
        self.tcr = 0;
        self.rcr = 0;
        self.tpsr = 0x40;
        self.tbcr0 = 0;
        self.tbcr1 = 0;
        self.rsar0 = 0;
        self.rsar1 = 0;
        self.rbcr0 = 0;
        self.rbcr1 = 0;
        self.pstart = 0x46;
        self.pstop = 0x80;
        self.bnry = self.pstart;
        self.curr = self.pstart;
        self.mar = [0; 8];
        self.dma_progress = 0;
        self.page = 0;
        self.write_prom();
        for b in &mut self.ram[6..16] {
            *b = 0xff;
        }
        self.sync_irq(line);
    }

    /// Guest write to the command register.
    fn write_cr(&mut self, val: u8, line: &dyn InterruptLine, netif: &dyn HostNetInterface) {
        self.cr = val;
        self.page = (val >> 6) & 0x3;

        if val & CR_STOP != 0 {
            self.isr |= ISR_RST;
            self.cr = (val & !(CR_START | CR_TXP)) | CR_STOP;
            if self.imr & ISR_RST != 0 {
                line.raise_irq(NE2000_IRQ);
            }
            // Stopping aborts any armed remote DMA.
            self.dma_progress = 0;
            return;
        }

        if val & CR_START != 0 {
            self.isr &= !ISR_RST;
            self.cr = (val & !(CR_STOP | CR_TXP)) | CR_START;
            if self.isr & self.imr == 0 {
                line.lower_irq(NE2000_IRQ);
            }
        }

        if val & CR_TXP != 0 {
            if self.cr & CR_START == 0 {
                debug!("ne2000: TXP while stopped, ignored");
                self.cr &= !CR_TXP;
            } else {
                self.transmit(line, netif);
            }
        }

        if val & CR_RD_MASK != 0 {
            self.dma_progress = 0;
            if val & CR_RD_MASK == CR_RD2 {
                // Complete/abort: disarm the pseudo-channel.
                self.cr &= !CR_RD_MASK;
            }
        }
    }

    /// Copy the programmed frame out of RAM and hand it to the host.
    ///
    /// TXP self-clears on every path; failures are reported as
    /// transmit-error through the ISR.
    fn transmit(&mut self, line: &dyn InterruptLine, netif: &dyn HostNetInterface) {
        let count = usize::from(self.tbcr0) | (usize::from(self.tbcr1) << 8);
        let start = usize::from(self.tpsr) * PAGE_SIZE;

        if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&count) {
            debug!("ne2000: transmit length {count} out of range");
            self.flag_isr(ISR_TXE, line);
            self.cr &= !CR_TXP;
            return;
        }
        if start + count > self.ram.len() {
            debug!("ne2000: transmit window {start:#x}+{count} exceeds RAM");
            self.flag_isr(ISR_TXE, line);
            self.cr &= !CR_TXP;
            return;
        }

        match netif.write_packet(&self.ram[start..start + count]) {
            Ok(()) => self.flag_isr(ISR_PTX, line),
            Err(e) => {
                warn!("ne2000: host interface rejected frame: {e}");
                self.flag_isr(ISR_TXE, line);
            }
        }
        self.cr &= !CR_TXP;
    }

    /// One access to the ASIC data port: a byte (or word, in word transfer
    /// mode) of the armed remote-DMA transfer.
    fn dma_access(&mut self, direction: IoDirection, data: &mut [u8], line: &dyn InterruptLine) {
        let count = usize::from(self.rbcr0) | (usize::from(self.rbcr1) << 8);
        let base = usize::from(self.rsar0) | (usize::from(self.rsar1) << 8);

        match direction {
            IoDirection::Out => {
                for &byte in data.iter() {
                    if self.dma_progress >= count {
                        break;
                    }
                    let addr = base + self.dma_progress;
                    if addr >= self.ram.len() {
                        warn!("ne2000: remote DMA write past RAM at {addr:#x}");
                        self.flag_isr(ISR_TXE, line);
                        break;
                    }
                    self.ram[addr] = byte;
                    self.dma_progress += 1;
                }
            }
            IoDirection::In => {
                for byte in data.iter_mut() {
                    if self.dma_progress >= count {
                        *byte = 0xff;
                        break;
                    }
                    let addr = base + self.dma_progress;
                    if addr >= self.ram.len() {
                        warn!("ne2000: remote DMA read past RAM at {addr:#x}");
                        *byte = 0xff;
                        self.flag_isr(ISR_RXE, line);
                        break;
                    }
                    *byte = self.ram[addr];
                    self.dma_progress += 1;
                }
            }
        }

        if self.dma_progress >= count {
            self.flag_isr(ISR_RDC, line);
            self.dma_progress = 0;
        }
    }

    /// Place one received frame into the ring buffer.
    fn deliver_frame(&mut self, frame: &[u8], line: &dyn InterruptLine) {
        let len = frame.len();
        if len > MAX_FRAME_LEN {
            debug!("ne2000: dropping oversized {len}-byte frame");
            self.flag_isr(ISR_RXE, line);
            return;
        }

        // Length on the wire includes the 4-byte ring header.
        let total = len + 4;
        let pages_needed = total.div_ceil(PAGE_SIZE);

        if self.curr < self.pstart || self.curr >= self.pstop {
            debug!(
                "ne2000: CURR {:#04x} outside ring [{:#04x}, {:#04x}), clamping",
                self.curr, self.pstart, self.pstop
            );
            self.curr = self.pstart;
        }

        let mut next = usize::from(self.curr) + pages_needed;
        if next >= usize::from(self.pstop) {
            next = usize::from(self.pstart) + (next - usize::from(self.pstop));
        }
        let next = next as u8;

        if next == self.bnry {
            debug!("ne2000: ring full, dropping {len}-byte frame");
            self.flag_isr(ISR_OVW, line);
            return;
        }

        let head = usize::from(self.curr) * PAGE_SIZE;
        self.ram[head] = RSR_PRX;
        self.ram[head + 1] = next;
        self.ram[head + 2] = (total & 0xff) as u8;
        self.ram[head + 3] = (total >> 8) as u8;

        // Copy page by page, wrapping at PSTOP back to PSTART.
        let ring_end = usize::from(self.pstop) * PAGE_SIZE;
        let ring_start = usize::from(self.pstart) * PAGE_SIZE;
        let mut offset = head + 4;
        let mut copied = 0;
        while copied < len {
            if offset >= ring_end {
                offset = ring_start;
            }
            let page_end = (offset / PAGE_SIZE + 1) * PAGE_SIZE;
            let chunk = (len - copied).min(page_end - offset);
            self.ram[offset..offset + chunk].copy_from_slice(&frame[copied..copied + chunk]);
            offset += chunk;
            copied += chunk;
        }

        self.curr = next;
        self.flag_isr(ISR_PRX, line);
    }

    fn page0_io(&mut self, offset: u16, direction: IoDirection, data: &mut [u8]) {
        let out = direction == IoDirection::Out;
        let val = data[0];
        match offset {
            REG_PSTART => rw(out, val, &mut self.pstart, &mut data[0]),
            REG_PSTOP => rw(out, val, &mut self.pstop, &mut data[0]),
            REG_BNRY => {
                if out {
                    // The read cursor must stay inside the ring.
                    if val >= self.pstart && val < self.pstop {
                        self.bnry = val;
                    }
                } else {
                    data[0] = self.bnry;
                }
            }
            REG_TPSR => rw(out, val, &mut self.tpsr, &mut data[0]),
            REG_TBCR0 => rw(out, val, &mut self.tbcr0, &mut data[0]),
            REG_TBCR1 => rw(out, val, &mut self.tbcr1, &mut data[0]),
            REG_RSAR0 => rw(out, val, &mut self.rsar0, &mut data[0]),
            REG_RSAR1 => rw(out, val, &mut self.rsar1, &mut data[0]),
            REG_RBCR0 => rw(out, val, &mut self.rbcr0, &mut data[0]),
            REG_RBCR1 => rw(out, val, &mut self.rbcr1, &mut data[0]),
            REG_RCR => rw(out, val, &mut self.rcr, &mut data[0]),
            REG_TCR => rw(out, val, &mut self.tcr, &mut data[0]),
            REG_DCR => rw(out, val, &mut self.dcr, &mut data[0]),
            _ => {
                if !out {
                    data[0] = 0xff;
                }
            }
        }
    }

    fn page1_io(&mut self, offset: u16, direction: IoDirection, data: &mut [u8]) {
        let out = direction == IoDirection::Out;
        match offset {
            REG_PAR0..=REG_PAR5 => {
                let idx = usize::from(offset - REG_PAR0);
                if out {
                    self.mac[idx] = data[0];
                } else {
                    data[0] = self.mac[idx];
                }
            }
            REG_CURR => {
                // The write pointer belongs to the controller.
                if !out {
                    data[0] = self.curr;
                }
            }
            REG_MAR0..=REG_MAR7 => {
                let idx = usize::from(offset - REG_MAR0);
                if out {
                    self.mar[idx] = data[0];
                } else {
                    data[0] = self.mar[idx];
                }
            }
            _ => {
                if !out {
                    data[0] = 0xff;
                }
            }
        }
    }
}

/// Read/write helper for plain byte registers.
fn rw(out: bool, val: u8, reg: &mut u8, data: &mut u8) {
    if out {
        *reg = val;
    } else {
        *data = *reg;
    }
}

struct IngressTask {
    handle: thread::JoinHandle<()>,
    done: Receiver<()>,
}

/// The NE2000 controller as a bus device.
///
/// Construction spawns the ingress thread; [`Ne2000::shutdown`] (also run
/// on drop) stops it within a bounded timeout.
pub struct Ne2000 {
    state: Arc<Mutex<Ne2000State>>,
    line: Arc<dyn InterruptLine>,
    netif: Arc<dyn HostNetInterface>,
    stop: Arc<AtomicBool>,
    ingress: Mutex<Option<IngressTask>>,
}

impl Ne2000 {
    pub fn new(
        mac: [u8; 6],
        netif: Arc<dyn HostNetInterface>,
        line: Arc<dyn InterruptLine>,
    ) -> Self {
        let state = Arc::new(Mutex::new(Ne2000State::power_on(mac)));
        let stop = Arc::new(AtomicBool::new(false));

        let (done_tx, done_rx) = mpsc::channel();
        let handle = {
            let state = Arc::clone(&state);
            let line = Arc::clone(&line);
            let netif = Arc::clone(&netif);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("ne2000-ingress".into())
                .spawn(move || {
                    ingress_loop(&state, &*line, &*netif, &stop);
                    // Receiver observes the disconnect when this sender
                    // drops on return.
                    drop(done_tx);
                })
                .expect("failed to spawn ne2000 ingress thread")
        };

        Self {
            state,
            line,
            netif,
            stop,
            ingress: Mutex::new(Some(IngressTask {
                handle,
                done: done_rx,
            })),
        }
    }

    /// Deliver one frame as if it had arrived from the host interface.
    ///
    /// This is the same path the ingress thread uses; it is public so
    /// embedders and tests can push frames deterministically.
    pub fn deliver_frame(&self, frame: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .deliver_frame(frame, &*self.line);
    }

    /// Stop the ingress thread, waiting up to two seconds for it to exit.
    ///
    /// Idempotent.  On timeout the thread is abandoned with a warning and
    /// resources are released anyway.
    pub fn shutdown(&self) {
        let Some(task) = self.ingress.lock().unwrap().take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        match task.done.recv_timeout(Duration::from_secs(2)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = task.handle.join();
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("ne2000: ingress thread did not stop within 2s, detaching");
            }
        }
    }
}

impl Drop for Ne2000 {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn ingress_loop(
    state: &Mutex<Ne2000State>,
    line: &dyn InterruptLine,
    netif: &dyn HostNetInterface,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Acquire) {
        let accepting = state.lock().unwrap().started();
        if !accepting {
            thread::sleep(Duration::from_millis(100));
            continue;
        }

        match netif.read_packet() {
            Ok(Some(frame)) if !frame.is_empty() => {
                debug!("ne2000: ingress frame, {} bytes", frame.len());
                state.lock().unwrap().deliver_frame(&frame, line);
            }
            Ok(_) => thread::sleep(Duration::from_millis(5)),
            Err(e) => {
                // Host-side trouble never stops ingress; back off and retry.
                debug!("ne2000: host interface read failed: {e}");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

impl PortIoDevice for Ne2000 {
    fn handle_io(
        &self,
        port: u16,
        direction: IoDirection,
        size: u8,
        data: &mut [u8],
    ) -> Result<(), DeviceError> {
        let offset = port - NE2000_PORT_BASE;
        let mut state = self.state.lock().unwrap();

        // Registers are bytes; the data port additionally accepts words
        // when the DCR selects word transfers.
        let word_ok = size == 2 && offset == ASIC_DATA && state.dcr & DCR_WTS != 0;
        if size != 1 && !word_ok {
            return Err(DeviceError::UnsupportedWidth { port, size });
        }

        match offset {
            ASIC_DATA => {
                state.dma_access(direction, data, &*self.line);
                return Ok(());
            }
            ASIC_RESET => {
                state.reset(&*self.line);
                if direction == IoDirection::In {
                    data[0] = 0xff;
                }
                return Ok(());
            }
            _ => {}
        }

        if offset == REG_CR {
            match direction {
                IoDirection::Out => state.write_cr(data[0], &*self.line, &*self.netif),
                IoDirection::In => data[0] = state.cr,
            }
            return Ok(());
        }

        match (state.page, offset, direction) {
            (0, REG_ISR, IoDirection::Out) => {
                // Write-one-to-clear acknowledge.
                state.isr &= !data[0];
                if state.isr & state.imr == 0 {
                    self.line.lower_irq(NE2000_IRQ);
                }
            }
            (0, REG_ISR, IoDirection::In) => data[0] = state.isr,
            (0, REG_IMR, IoDirection::Out) => {
                state.imr = data[0];
                state.sync_irq(&*self.line);
            }
            (0, REG_IMR, IoDirection::In) => data[0] = state.imr,
            (0, ..) => state.page0_io(offset, direction, data),
            (1, ..) => state.page1_io(offset, direction, data),
            _ => {
                // Page 2 diagnostics are not modelled.
                if direction == IoDirection::In {
                    data[0] = 0xff;
                }
            }
        }
        Ok(())
    }
}
