//! VM container: guest memory, the device set, the I/O bus, and the VCPUs.
//!
//! [`Vm`] is the main entry point.  It creates a KVM virtual machine with a
//! userspace interrupt controller and the legacy ISA device set, loads a
//! flat boot image at guest physical 0, and runs one thread per VCPU.
//!
//! # Example
//!
//! ```no_run
//! use retrobox_vmm::vm::{Vm, VmConfig};
//!
//! let config = VmConfig::default();
//! let mut vm = Vm::new(config).unwrap();
//! vm.load_image(&std::fs::read("boot.bin").unwrap()).unwrap();
//! vm.run().unwrap();
//! ```

use crate::devices::bus::IoBus;
use crate::devices::keyboard::{Keyboard, KEYBOARD_PORT_DATA, KEYBOARD_PORT_STATUS};
use crate::devices::ne2000::{Ne2000, NE2000_PORT_BASE, NE2000_PORT_END};
use crate::devices::pic::{PicDevice, PIC_MASTER_CMD, PIC_MASTER_DATA, PIC_SLAVE_CMD, PIC_SLAVE_DATA};
use crate::devices::pit::{Pit, PIT_PORT_COMMAND, PIT_PORT_COUNTER0, PIT_PORT_SYSTEM_B};
use crate::devices::rtc::{Rtc, RTC_PORT_DATA, RTC_PORT_INDEX};
use crate::devices::serial::{SerialDevice, COM1_PORT_BASE, COM1_PORT_END};
use crate::devices::InterruptLine;
use crate::memory::{GuestRam, MemoryError};
use crate::net::{HostNetInterface, NetError, TapDevice};
use crate::vcpu::{Vcpu, VcpuError};
use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::{Kvm, VmFd};
use log::{error, info, warn};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use thiserror::Error;

/// MAC address assigned to the NE2000 when the embedder does not care.
pub const DEFAULT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// Name of the TAP interface [`Vm::new`] attaches the NIC to.
pub const DEFAULT_TAP_NAME: &str = "tap0";

/// Configuration for creating a [`Vm`].
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Guest memory size in bytes (default: 128 MiB).
    pub memory_size: usize,
    /// Number of VCPUs (default: 1).  VCPU 0 is the interrupt sink.
    pub vcpu_count: usize,
    /// Log per-exit dispatch detail.
    pub debug: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: 128 * 1024 * 1024,
            vcpu_count: 1,
            debug: false,
        }
    }
}

/// Errors from VM construction and execution.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("failed to open /dev/kvm: {0}")]
    KvmCreate(#[source] kvm_ioctls::Error),

    #[error("failed to create VM: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    #[error("failed to register guest memory with KVM: {0}")]
    SetUserMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("guest memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("vCPU error: {0}")]
    Vcpu(#[from] VcpuError),

    #[error("host network error: {0}")]
    Net(#[from] NetError),
}

/// A serial sink that stores everything written to it.
///
/// Clones share the same buffer, so one copy can go to the UART while the
/// embedder keeps another to inspect guest output.
#[derive(Clone, Default)]
pub struct CapturingWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the captured output, clearing the internal buffer.
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock().unwrap())
    }

    /// The captured output as a string (lossy UTF-8).
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }
}

impl Write for CapturingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A KVM virtual machine with the legacy ISA-style device set.
pub struct Vm {
    // The fds stay open for the lifetime of the VM even though nothing
    // reads them after construction.
    #[allow(dead_code)]
    kvm: Kvm,
    #[allow(dead_code)]
    vm: VmFd,

    ram: GuestRam,
    pic: Arc<PicDevice>,
    nic: Arc<Ne2000>,
    netif: Arc<dyn HostNetInterface>,

    vcpus: Vec<Vcpu>,
    running: Arc<AtomicBool>,
    closed: bool,
}

impl std::fmt::Debug for Vm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vm").finish_non_exhaustive()
    }
}

impl Vm {
    /// Create a VM wired to the default TAP interface with serial output
    /// on stdout.
    pub fn new(config: VmConfig) -> Result<Self, VmError> {
        let tap = TapDevice::open(DEFAULT_TAP_NAME)?;
        Self::with_backends(config, Arc::new(tap), Box::new(io::stdout()))
    }

    /// Create a VM with caller-supplied host network and serial backends.
    pub fn with_backends(
        config: VmConfig,
        netif: Arc<dyn HostNetInterface>,
        serial_out: Box<dyn Write + Send>,
    ) -> Result<Self, VmError> {
        let vcpu_count = config.vcpu_count.max(1);

        let kvm = Kvm::new().map_err(VmError::KvmCreate)?;
        let vm = kvm.create_vm().map_err(VmError::VmCreate)?;

        let ram = GuestRam::new(config.memory_size)?;
        let region = kvm_userspace_memory_region {
            slot: 0,
            guest_phys_addr: 0,
            memory_size: ram.size() as u64,
            userspace_addr: ram.host_address(),
            flags: 0,
        };
        unsafe {
            vm.set_user_memory_region(region)
                .map_err(VmError::SetUserMemoryRegion)?;
        }

        // Boot structures go in before any VCPU runs.
        ram.setup_gdt()?;
        ram.setup_page_directory()?;

        // Devices.  Everything that interrupts holds the PIC's raise/lower
        // capability; only the VCPUs get the vector-query side.
        let pic = Arc::new(PicDevice::new());
        let line: Arc<dyn InterruptLine> = pic.clone();
        let pit = Arc::new(Pit::new(line.clone()));
        let serial = Arc::new(SerialDevice::new(line.clone(), serial_out));
        let rtc = Arc::new(Rtc::new(line.clone()));
        let keyboard = Arc::new(Keyboard::new());
        let nic = Arc::new(Ne2000::new(DEFAULT_MAC, netif.clone(), line));

        let mut bus = IoBus::new();
        bus.register(PIC_MASTER_CMD, PIC_MASTER_DATA, pic.clone());
        bus.register(PIC_SLAVE_CMD, PIC_SLAVE_DATA, pic.clone());
        bus.register(PIT_PORT_COUNTER0, PIT_PORT_COMMAND, pit.clone());
        bus.register(PIT_PORT_SYSTEM_B, PIT_PORT_SYSTEM_B, pit.clone());
        bus.register(KEYBOARD_PORT_DATA, KEYBOARD_PORT_DATA, keyboard.clone());
        bus.register(KEYBOARD_PORT_STATUS, KEYBOARD_PORT_STATUS, keyboard);
        bus.register(RTC_PORT_INDEX, RTC_PORT_DATA, rtc);
        bus.register(NE2000_PORT_BASE, NE2000_PORT_END, nic.clone());
        bus.register(COM1_PORT_BASE, COM1_PORT_END, serial);
        let bus = Arc::new(bus);

        let running = Arc::new(AtomicBool::new(true));
        let mut vcpus = Vec::with_capacity(vcpu_count);
        for id in 0..vcpu_count {
            vcpus.push(Vcpu::new(
                &vm,
                id,
                Arc::clone(&bus),
                Arc::clone(&pic),
                Arc::clone(&pit),
                Arc::clone(&running),
                config.debug,
            )?);
        }

        info!(
            "VM created: {} MiB memory, {} vcpu(s)",
            ram.size() / (1024 * 1024),
            vcpu_count,
        );

        Ok(Self {
            kvm,
            vm,
            ram,
            pic,
            nic,
            netif,
            vcpus,
            running,
            closed: false,
        })
    }

    /// Load a flat boot image at guest physical 0.
    pub fn load_image(&self, image: &[u8]) -> Result<(), VmError> {
        self.ram.load_image(image)?;
        Ok(())
    }

    /// Run all VCPUs to completion.
    ///
    /// Spawns one thread per VCPU, joins them all, and returns the first
    /// fatal VCPU error (a guest that simply halts is a normal exit).
    pub fn run(&mut self) -> Result<(), VmError> {
        let mut handles = Vec::with_capacity(self.vcpus.len());
        for (id, mut vcpu) in self.vcpus.drain(..).enumerate() {
            let handle = thread::Builder::new()
                .name(format!("vcpu{id}"))
                .spawn(move || vcpu.run())
                .expect("failed to spawn vcpu thread");
            handles.push(handle);
        }

        let mut first_err: Option<VcpuError> = None;
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(())) => info!("vcpu{id}: exited normally"),
                Ok(Err(e)) => {
                    error!("vcpu{id}: exited with error: {e}");
                    first_err.get_or_insert(e);
                }
                Err(_) => error!("vcpu{id}: thread panicked"),
            }
        }
        self.running.store(false, Ordering::Release);

        match first_err {
            Some(e) => Err(VmError::Vcpu(e)),
            None => Ok(()),
        }
    }

    /// Signal all VCPU loops to stop at their next loop head.
    pub fn stop(&self) {
        info!("vm: stop requested");
        self.running.store(false, Ordering::Release);
    }

    /// Stop everything and release host resources.
    ///
    /// Idempotent, and safe to call on a VM whose construction failed part
    /// way (device teardown is handled by drop in that case).
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        self.stop();
        self.vcpus.clear();
        self.nic.shutdown();
        if let Err(e) = self.netif.close() {
            warn!("vm: failed to close host network interface: {e}");
        }
        info!("vm: closed");
    }

    /// The guest memory backing this VM.
    pub fn memory(&self) -> &GuestRam {
        &self.ram
    }

    /// The interrupt controller, for embedders that need to assert lines
    /// from outside the device set.
    pub fn pic(&self) -> &Arc<PicDevice> {
        &self.pic
    }

    /// The NE2000 controller, for direct frame injection.
    pub fn nic(&self) -> &Arc<Ne2000> {
        &self.nic
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.close();
    }
}
