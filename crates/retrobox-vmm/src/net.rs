//! Host-side network plumbing for the NE2000 model.
//!
//! The NIC talks to the outside world through [`HostNetInterface`], a
//! byte-packet read/write/close contract.  The production implementation is
//! a Linux TAP device opened non-blocking; tests substitute an in-memory
//! queue.

use log::info;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Mutex;
use thiserror::Error;
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

// TUNSETIFF = _IOW('T', 202, int)
const TUNTAP: ::std::os::raw::c_uint = 84;
ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, ::std::os::raw::c_int);

const IFNAMSIZ: usize = 16;

/// Minimal `struct ifreq` for the TUNSETIFF call: interface name plus the
/// flags member of the request union, padded to the kernel's 40-byte size.
#[repr(C)]
struct IfReq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

/// Errors from the host network backend.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("invalid interface name {name:?}")]
    InvalidName { name: String },

    #[error("failed to open /dev/net/tun: {0}")]
    Open(#[source] io::Error),

    #[error("TUNSETIFF failed for {name}: {source}")]
    Configure {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("read from {name} failed: {source}")]
    Read {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("write to {name} failed: {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("network interface is closed")]
    Closed,
}

/// Byte-packet access to the host network.
///
/// `read_packet` is non-blocking: `Ok(None)` means no frame is currently
/// available.  All methods take `&self`; implementations synchronise
/// internally because the NIC's ingress task and the port I/O path share
/// one instance.
pub trait HostNetInterface: Send + Sync {
    fn read_packet(&self) -> Result<Option<Vec<u8>>, NetError>;
    fn write_packet(&self, packet: &[u8]) -> Result<(), NetError>;
    fn close(&self) -> Result<(), NetError>;
}

/// A Linux TAP device carrying raw Ethernet frames.
#[derive(Debug)]
pub struct TapDevice {
    file: Mutex<Option<File>>,
    name: String,
}

impl TapDevice {
    /// Open `/dev/net/tun` and bind it to the named TAP interface.
    ///
    /// The interface must already exist (or the caller must have permission
    /// to create it); bringing the link up and addressing it is left to the
    /// host administrator.
    pub fn open(name: &str) -> Result<Self, NetError> {
        if name.is_empty() || name.len() >= IFNAMSIZ {
            return Err(NetError::InvalidName {
                name: name.to_string(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open("/dev/net/tun")
            .map_err(NetError::Open)?;

        let mut ifr = IfReq {
            ifr_name: [0u8; IFNAMSIZ],
            ifr_flags: (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short,
            _pad: [0u8; 22],
        };
        ifr.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

        let ret = unsafe { ioctl_with_mut_ref(&file, TUNSETIFF(), &mut ifr) };
        if ret < 0 {
            return Err(NetError::Configure {
                name: name.to_string(),
                source: io::Error::last_os_error(),
            });
        }

        info!("tap device {name} opened");
        Ok(Self {
            file: Mutex::new(Some(file)),
            name: name.to_string(),
        })
    }
}

impl HostNetInterface for TapDevice {
    fn read_packet(&self) -> Result<Option<Vec<u8>>, NetError> {
        let guard = self.file.lock().unwrap();
        let mut file: &File = guard.as_ref().ok_or(NetError::Closed)?;

        // Largest Ethernet frame plus headroom.
        let mut buf = vec![0u8; 2048];
        match file.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(NetError::Read {
                name: self.name.clone(),
                source: e,
            }),
        }
    }

    fn write_packet(&self, packet: &[u8]) -> Result<(), NetError> {
        let guard = self.file.lock().unwrap();
        let mut file: &File = guard.as_ref().ok_or(NetError::Closed)?;
        file.write_all(packet).map_err(|e| NetError::Write {
            name: self.name.clone(),
            source: e,
        })
    }

    fn close(&self) -> Result<(), NetError> {
        // Dropping the File closes the fd; repeated calls are no-ops.
        if self.file.lock().unwrap().take().is_some() {
            info!("tap device {} closed", self.name);
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_interface_name() {
        let err = TapDevice::open("a-name-that-is-way-too-long").unwrap_err();
        assert!(matches!(err, NetError::InvalidName { .. }));
    }

    #[test]
    fn rejects_empty_interface_name() {
        assert!(matches!(
            TapDevice::open(""),
            Err(NetError::InvalidName { .. })
        ));
    }

    #[test]
    fn ifreq_matches_kernel_layout() {
        assert_eq!(std::mem::size_of::<IfReq>(), 40);
    }
}
