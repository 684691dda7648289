//! retrobox VMM: a KVM-backed virtual machine monitor for a legacy
//! ISA-style PC.
//!
//! The VMM owns guest physical memory, the VCPUs, and a small set of
//! classic PC device models.  Interrupt routing is fully in userspace: an
//! 8259A PIC pair decides what is pending and the VCPU loop injects the
//! vectors with `KVM_INTERRUPT`.
//!
//! # Architecture
//!
//! - [`vm`]: VM creation, boot image loading, and execution
//! - [`vcpu`]: the per-VCPU run loop and exit dispatch
//! - [`memory`]: guest RAM, boot GDT, and identity page directory
//! - [`kvm`]: raw KVM ioctls not covered by `kvm-ioctls`
//! - [`devices`]: PIC, PIT, UART, RTC, keyboard, NE2000, and the I/O bus
//! - [`net`]: the host-side TAP backend behind the NE2000

pub mod devices;
pub mod kvm;
pub mod memory;
pub mod net;
pub mod vcpu;
pub mod vm;
