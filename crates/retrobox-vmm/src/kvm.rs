//! Direct KVM ioctls not covered by `kvm-ioctls`.
//!
//! The PIC pair lives in userspace and no in-kernel irqchip is created, so
//! interrupt delivery goes through the raw `KVM_INTERRUPT` vCPU ioctl.

use kvm_bindings::{kvm_interrupt, KVMIO};
use kvm_ioctls::VcpuFd;
use std::io;
use vmm_sys_util::ioctl::ioctl_with_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

// KVM_INTERRUPT = _IOW(KVMIO, 0x86, struct kvm_interrupt)
ioctl_iow_nr!(KVM_INTERRUPT, KVMIO, 0x86, kvm_interrupt);

/// Queue `vector` for injection into the guest on the next VM entry.
///
/// KVM refuses the request (for example with `EEXIST`) while a previous
/// interrupt is still pending or the guest is not interruptible; callers
/// treat that as transient.
pub fn inject_interrupt(vcpu: &VcpuFd, vector: u8) -> io::Result<()> {
    let interrupt = kvm_interrupt {
        irq: u32::from(vector),
    };
    let ret = unsafe { ioctl_with_ref(vcpu, KVM_INTERRUPT(), &interrupt) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_ioctl_number_matches_kvm_abi() {
        // _IOW(0xAE, 0x86, 4-byte struct)
        assert_eq!(KVM_INTERRUPT(), 0x4004_ae86);
    }
}
