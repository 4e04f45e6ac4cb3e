// iface.rs - PPP kernel interface programming
//
// The concentrator touches the kernel through five calls: local address,
// destination address, flags read, flags write, and the per-protocol NP mode
// on the PPP unit descriptor. The trait keeps that surface narrow; the
// address-option handler sequences the calls, this module only issues them.

use std::io;
use std::net::Ipv4Addr;

#[cfg(test)]
use mockall::automock;

/// IPv4 protocol number on a PPP link
pub const PPP_IP: i32 = 0x21;

/// Per-protocol policy on a PPP kernel unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpMode {
    /// Forward datagrams of this protocol family
    Pass = 0,
    Drop = 1,
    Error = 2,
    Queue = 3,
}

/// A kernel PPP unit: interface index (names the `pppN` device) and the
/// unit file descriptor the NP-mode ioctl goes to.
#[derive(Debug, Clone, Copy)]
pub struct PppUnit {
    pub index: u32,
    pub fd: i32,
}

impl PppUnit {
    pub fn name(&self) -> String {
        format!("ppp{}", self.index)
    }
}

/// The five programming operations, in the order the handler issues them
#[cfg_attr(test, automock)]
pub trait IfaceBackend: Send + Sync {
    fn set_local_addr(&self, unit: &PppUnit, addr: Ipv4Addr) -> io::Result<()>;
    fn set_dest_addr(&self, unit: &PppUnit, addr: Ipv4Addr) -> io::Result<()>;
    fn flags(&self, unit: &PppUnit) -> io::Result<i32>;
    fn set_flags(&self, unit: &PppUnit, flags: i32) -> io::Result<()>;
    fn set_np_mode(&self, unit: &PppUnit, protocol: i32, mode: NpMode) -> io::Result<()>;
}

/// Interface UP flag (mirrors IFF_UP)
pub const IFF_UP: i32 = libc::IFF_UP;

/// Point-to-point link flag (mirrors IFF_POINTOPOINT)
pub const IFF_POINTOPOINT: i32 = libc::IFF_POINTOPOINT;

#[cfg(target_os = "linux")]
pub use kernel::KernelIface;

#[cfg(target_os = "linux")]
mod kernel {
    use super::*;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    // _IOW('t', 75, struct npioctl), linux/if_ppp.h
    const PPPIOCSNPMODE: libc::c_ulong = 0x4008_744b;

    #[repr(C)]
    struct NpIoctl {
        protocol: libc::c_int,
        mode: libc::c_int,
    }

    /// ioctl-backed implementation. One AF_INET datagram socket carries all
    /// SIOC calls for the process; NP mode goes to the unit descriptor.
    pub struct KernelIface {
        sock: OwnedFd,
    }

    impl KernelIface {
        pub fn new() -> io::Result<Self> {
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self {
                sock: unsafe { OwnedFd::from_raw_fd(fd) },
            })
        }

        fn ifreq(unit: &PppUnit) -> libc::ifreq {
            let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
            let name = unit.name();
            for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
                *dst = *src as libc::c_char;
            }
            ifr
        }

        fn ioctl(&self, request: libc::c_ulong, ifr: &mut libc::ifreq) -> io::Result<()> {
            let rc = unsafe { libc::ioctl(self.sock.as_raw_fd(), request as _, ifr) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    fn sockaddr(addr: Ipv4Addr) -> libc::sockaddr {
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: 0,
            sin_addr: libc::in_addr {
                s_addr: u32::from(addr).to_be(),
            },
            sin_zero: [0; 8],
        };
        // sockaddr_in and sockaddr are layout-compatible 16-byte structs.
        unsafe { std::mem::transmute(sin) }
    }

    impl IfaceBackend for KernelIface {
        fn set_local_addr(&self, unit: &PppUnit, addr: Ipv4Addr) -> io::Result<()> {
            let mut ifr = Self::ifreq(unit);
            ifr.ifr_ifru.ifru_addr = sockaddr(addr);
            self.ioctl(libc::SIOCSIFADDR, &mut ifr)
        }

        fn set_dest_addr(&self, unit: &PppUnit, addr: Ipv4Addr) -> io::Result<()> {
            let mut ifr = Self::ifreq(unit);
            ifr.ifr_ifru.ifru_dstaddr = sockaddr(addr);
            self.ioctl(libc::SIOCSIFDSTADDR, &mut ifr)
        }

        fn flags(&self, unit: &PppUnit) -> io::Result<i32> {
            let mut ifr = Self::ifreq(unit);
            self.ioctl(libc::SIOCGIFFLAGS, &mut ifr)?;
            Ok(unsafe { ifr.ifr_ifru.ifru_flags } as i32)
        }

        fn set_flags(&self, unit: &PppUnit, flags: i32) -> io::Result<()> {
            let mut ifr = Self::ifreq(unit);
            ifr.ifr_ifru.ifru_flags = flags as libc::c_short;
            self.ioctl(libc::SIOCSIFFLAGS, &mut ifr)
        }

        fn set_np_mode(&self, unit: &PppUnit, protocol: i32, mode: NpMode) -> io::Result<()> {
            let np = NpIoctl {
                protocol,
                mode: mode as libc::c_int,
            };
            let rc = unsafe { libc::ioctl(unit.fd, PPPIOCSNPMODE as _, &np) };
            if rc < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

}
