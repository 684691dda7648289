//! VCPU creation and the execution loop.
//!
//! Each VCPU owns a KVM vCPU handle and runs [`Vcpu::run`] on its own
//! thread: check the stop flag, let VCPU 0 feed pending PIC vectors into
//! the guest, enter `KVM_RUN`, and dispatch the resulting exit to the I/O
//! bus.  Device failures are logged and the guest keeps running; only
//! shutdown-class exits end the loop with an error.

use crate::devices::bus::IoBus;
use crate::devices::pic::PicDevice;
use crate::devices::pit::Pit;
use crate::devices::IoDirection;
use crate::kvm;
use crate::memory::{code32_segment, data32_segment, BOOT_GDT_LIMIT, BOOT_GDT_OFFSET, PAGE_DIR_OFFSET};
use kvm_bindings::kvm_regs;
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Protection-enable bit of CR0.
const X86_CR0_PE: u64 = 0x1;

/// Reserved bit 1 of RFLAGS, always set.
const RFLAGS_RESERVED: u64 = 0x2;

/// Cadence of the periodic device tick on VCPU 0.
const TICK_INTERVAL: Duration = Duration::from_millis(10);

/// Polling step while the guest is halted.
const HALT_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// How many halt polls before the VCPU concludes the guest is done.
const HALT_POLL_ROUNDS: u32 = 50;

/// Errors from VCPU setup and execution.
#[derive(Error, Debug)]
pub enum VcpuError {
    #[error("failed to create vCPU: {0}")]
    Create(#[source] kvm_ioctls::Error),

    #[error("failed to get vCPU special registers: {0}")]
    GetSregs(#[source] kvm_ioctls::Error),

    #[error("failed to set vCPU special registers: {0}")]
    SetSregs(#[source] kvm_ioctls::Error),

    #[error("failed to set vCPU registers: {0}")]
    SetRegisters(#[source] kvm_ioctls::Error),

    #[error("KVM_RUN failed: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("guest initiated shutdown (triple fault)")]
    Shutdown,

    #[error("hardware VM-entry failure, reason {reason:#x}")]
    FailEntry { reason: u64 },

    #[error("unhandled vCPU exit: {reason}")]
    UnhandledExit { reason: String },
}

/// One virtual CPU.
pub struct Vcpu {
    id: usize,
    fd: VcpuFd,
    bus: Arc<IoBus>,
    pic: Arc<PicDevice>,
    pit: Arc<Pit>,
    running: Arc<AtomicBool>,
    debug: bool,
    last_tick: Instant,
}

impl Vcpu {
    /// Create a VCPU and put it into flat 32-bit protected mode.
    ///
    /// Instruction pointer 0, flags `0x2`, flat code and data segments,
    /// the GDT pointer aimed at the boot GDT, `CR3` at the boot page
    /// directory, and `CR0.PE` set.
    pub fn new(
        vm: &VmFd,
        id: usize,
        bus: Arc<IoBus>,
        pic: Arc<PicDevice>,
        pit: Arc<Pit>,
        running: Arc<AtomicBool>,
        debug: bool,
    ) -> Result<Self, VcpuError> {
        let fd = vm.create_vcpu(id as u64).map_err(VcpuError::Create)?;
        let vcpu = Self {
            id,
            fd,
            bus,
            pic,
            pit,
            running,
            debug,
            last_tick: Instant::now(),
        };
        vcpu.init_sregs()?;
        vcpu.init_regs()?;
        debug!("vcpu{id}: created and initialized");
        Ok(vcpu)
    }

    fn init_sregs(&self) -> Result<(), VcpuError> {
        let mut sregs = self.fd.get_sregs().map_err(VcpuError::GetSregs)?;

        sregs.cs = code32_segment();
        let data = data32_segment();
        sregs.ds = data;
        sregs.es = data;
        sregs.fs = data;
        sregs.gs = data;
        sregs.ss = data;

        sregs.gdt.base = BOOT_GDT_OFFSET;
        sregs.gdt.limit = BOOT_GDT_LIMIT;

        // Protected mode on; paging stays off until the guest flips it,
        // with CR3 already pointing at the identity page directory.
        sregs.cr0 |= X86_CR0_PE;
        sregs.cr3 = PAGE_DIR_OFFSET;

        self.fd.set_sregs(&sregs).map_err(VcpuError::SetSregs)
    }

    fn init_regs(&self) -> Result<(), VcpuError> {
        let regs = kvm_regs {
            rip: 0,
            rflags: RFLAGS_RESERVED,
            ..Default::default()
        };
        self.fd.set_regs(&regs).map_err(VcpuError::SetRegisters)
    }

    /// Run until the guest halts, the VM is stopped, or a fatal exit.
    pub fn run(&mut self) -> Result<(), VcpuError> {
        info!("vcpu{}: entering run loop", self.id);
        loop {
            if !self.running.load(Ordering::Acquire) {
                info!("vcpu{}: stop requested", self.id);
                return Ok(());
            }

            // VCPU 0 is the interrupt sink: it drives the periodic device
            // tick and feeds PIC vectors into the guest.
            if self.id == 0 {
                if self.last_tick.elapsed() >= TICK_INTERVAL {
                    self.pit.tick();
                    self.last_tick = Instant::now();
                }
                self.service_interrupts();
            }

            match self.fd.run() {
                Ok(VcpuExit::IoIn(port, data)) => {
                    if self.debug {
                        debug!("vcpu{}: IN port {port:#06x} ({} bytes)", self.id, data.len());
                    }
                    Self::handle_pio_in(&self.bus, self.id, port, data);
                }
                Ok(VcpuExit::IoOut(port, data)) => {
                    if self.debug {
                        debug!("vcpu{}: OUT port {port:#06x} ({} bytes)", self.id, data.len());
                    }
                    Self::handle_pio_out(&self.bus, self.id, port, data);
                }
                Ok(VcpuExit::MmioRead(addr, data)) => {
                    // No MMIO devices are mapped; reads float high.
                    warn!("vcpu{}: unhandled MMIO read at {addr:#x}", self.id);
                    data.fill(0xff);
                }
                Ok(VcpuExit::MmioWrite(addr, data)) => {
                    warn!(
                        "vcpu{}: unhandled MMIO write at {addr:#x} ({} bytes)",
                        self.id,
                        data.len()
                    );
                }
                Ok(VcpuExit::Hlt) => {
                    debug!("vcpu{}: guest halted", self.id);
                    if !self.wait_for_wakeup() {
                        info!("vcpu{}: halted with no pending interrupts, done", self.id);
                        return Ok(());
                    }
                }
                Ok(VcpuExit::IrqWindowOpen) => {}
                Ok(VcpuExit::Intr) => {}
                Ok(VcpuExit::Shutdown) => {
                    warn!("vcpu{}: guest shutdown", self.id);
                    return Err(VcpuError::Shutdown);
                }
                Ok(VcpuExit::FailEntry(reason, cpu)) => {
                    warn!(
                        "vcpu{}: VM entry failed on cpu {cpu}, hardware reason {reason:#x}",
                        self.id
                    );
                    return Err(VcpuError::FailEntry { reason });
                }
                Ok(exit) => {
                    return Err(VcpuError::UnhandledExit {
                        reason: format!("{exit:?}"),
                    });
                }
                // The run ioctl being interrupted by a signal is routine.
                Err(e) if e.errno() == libc::EINTR => {}
                Err(e) => return Err(VcpuError::Run(e)),
            }
        }
    }

    /// Inject the next pending PIC vector, if any.
    fn service_interrupts(&self) {
        if !self.pic.has_pending() {
            return;
        }
        if let Some(vector) = self.pic.acquire_vector() {
            if let Err(e) = kvm::inject_interrupt(&self.fd, vector) {
                warn!(
                    "vcpu{}: failed to inject vector {vector:#04x}: {e}",
                    self.id
                );
            }
        }
    }

    /// After a halt, poll briefly for a reason to resume.
    ///
    /// Returns true when an interrupt became pending (or is already being
    /// serviced) and the loop should re-enter the guest; false when the
    /// wait ran out and the halt is treated as the guest's final state.
    fn wait_for_wakeup(&self) -> bool {
        for _ in 0..HALT_POLL_ROUNDS {
            if !self.running.load(Ordering::Acquire) {
                return false;
            }
            if self.id == 0 && self.pic.has_pending() {
                return true;
            }
            thread::sleep(HALT_POLL_INTERVAL);
        }
        false
    }

    /// Width of one bus transaction for an exit buffer of `len` bytes.
    ///
    /// Ordinary port I/O arrives as 1, 2, or 4 bytes.  String I/O arrives
    /// as `width * count` bytes with the width not reported separately;
    /// those are replayed as byte accesses.
    fn pio_width(len: usize) -> usize {
        match len {
            1 | 2 | 4 => len,
            _ => 1,
        }
    }

    fn handle_pio_in(bus: &IoBus, id: usize, port: u16, data: &mut [u8]) {
        let width = Self::pio_width(data.len());
        for chunk in data.chunks_mut(width) {
            if let Err(e) = bus.handle_io(port, IoDirection::In, width as u8, chunk) {
                debug!("vcpu{id}: IN {port:#06x} failed: {e}");
                chunk.fill(0xff);
            }
        }
    }

    fn handle_pio_out(bus: &IoBus, id: usize, port: u16, data: &[u8]) {
        let width = Self::pio_width(data.len());
        let mut buf = [0u8; 4];
        for chunk in data.chunks(width) {
            buf[..width].copy_from_slice(chunk);
            if let Err(e) = bus.handle_io(port, IoDirection::Out, width as u8, &mut buf[..width]) {
                debug!("vcpu{id}: OUT {port:#06x} failed: {e}");
            }
        }
    }
}
