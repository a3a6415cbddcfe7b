#![cfg(target_os = "linux")]

use crate::config::TapConfig;
use crate::error::{Result, TapError};
use crate::mac::MacAddr;
use crate::tap_impl::{DeviceInfo, TapImpl};
use libc::{IFF_NO_PI, IFF_TAP};
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use nix::sys::stat::Mode;
use nix::{ioctl_readwrite_bad, ioctl_write_ptr, ioctl_write_ptr_bad};
use std::ffi::CStr;
use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, OwnedFd};
use std::sync::{Mutex, PoisonError, RwLock};

const TUN_PATH: &str = "/dev/net/tun";

ioctl_write_ptr!(tun_set_iff, b'T', 202, libc::c_int);
ioctl_readwrite_bad!(get_if_hwaddr, libc::SIOCGIFHWADDR, Ifreq);
ioctl_readwrite_bad!(get_if_mtu, libc::SIOCGIFMTU, Ifreq);
ioctl_write_ptr_bad!(set_if_mtu, libc::SIOCSIFMTU, Ifreq);
ioctl_readwrite_bad!(get_if_flags, libc::SIOCGIFFLAGS, Ifreq);
ioctl_write_ptr_bad!(set_if_flags, libc::SIOCSIFFLAGS, Ifreq);

#[repr(C)]
#[derive(Clone, Copy)]
pub union Ifru {
    pub ifru_flags: libc::c_short,
    pub ifru_ivalue: libc::c_int,
    pub ifru_addr: libc::sockaddr,
    // The kernel copies the full union, which is sized by struct ifmap.
    _pad: [u8; 24],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct Ifreq {
    pub ifr_name: [libc::c_char; libc::IFNAMSIZ],
    pub ifr_ifru: Ifru,
}

impl Ifreq {
    /// Zeroed request for `name`, truncated to fit with its NUL terminator.
    fn for_name(name: &str) -> Self {
        let mut ifr: Ifreq = unsafe { mem::zeroed() };
        for (dst, b) in ifr
            .ifr_name
            .iter_mut()
            .zip(name.bytes().take(libc::IFNAMSIZ - 1))
        {
            *dst = b as libc::c_char;
        }
        ifr
    }

    fn name(&self) -> String {
        // for_name and the kernel both leave the last byte NUL.
        unsafe { CStr::from_ptr(self.ifr_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Character-device backend: one `/dev/net/tun` descriptor bound to a TAP
/// interface.
///
/// A blocked read waits on both the tap descriptor and a wake pipe. Closing
/// drops the pipe's write end, which wakes the reader, and then releases the
/// descriptor once no read or write is using it.
pub struct LinuxTap {
    fd: RwLock<Option<OwnedFd>>,
    wake_rx: OwnedFd,
    wake_tx: Mutex<Option<OwnedFd>>,
}

impl LinuxTap {
    pub fn open(config: &TapConfig) -> Result<(Self, DeviceInfo)> {
        let raw = open(TUN_PATH, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty()).map_err(|e| {
            TapError::Open {
                path: TUN_PATH.to_string(),
                source: e.into(),
            }
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // An empty name lets the kernel pick one (tap0, tap1, ...).
        let mut ifr = Ifreq::for_name(config.name.as_deref().unwrap_or(""));
        ifr.ifr_ifru.ifru_flags = (IFF_TAP | IFF_NO_PI) as libc::c_short;

        unsafe { tun_set_iff(fd.as_raw_fd(), &ifr as *const Ifreq as *const libc::c_int) }
            .map_err(|e| TapError::Open {
                path: TUN_PATH.to_string(),
                source: io::Error::new(
                    io::Error::from(e).kind(),
                    format!("failed to set device to TAP mode: {}", e),
                ),
            })?;

        let name = ifr.name();
        let info = describe(&name, config).map_err(|source| TapError::InterfaceLookup {
            name: name.clone(),
            source,
        })?;

        let (wake_rx, wake_tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;

        log::info!("tap: created {} ({}, mtu {})", info.name, info.mac, info.mtu);

        let tap = LinuxTap {
            fd: RwLock::new(Some(fd)),
            wake_rx,
            wake_tx: Mutex::new(Some(wake_tx)),
        };
        Ok((tap, info))
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "tap device closed")
    }
}

fn describe(name: &str, config: &TapConfig) -> io::Result<DeviceInfo> {
    let sock = ControlSocket::new()?;

    if config.apply_mtu {
        sock.set_mtu(name, config.mtu)?;
    }
    if config.bring_up {
        sock.up(name)?;
    }

    Ok(DeviceInfo {
        name: name.to_string(),
        mac: sock.hardware_address(name)?,
        mtu: sock.mtu(name)?,
    })
}

impl TapImpl for LinuxTap {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = self.fd.read().unwrap_or_else(PoisonError::into_inner);
        let fd = guard.as_ref().ok_or_else(Self::closed)?;

        loop {
            let mut fds = [
                PollFd::new(fd.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            if fds[1].revents().is_some_and(|r| !r.is_empty()) {
                return Err(Self::closed());
            }
            if fds[0].revents().is_some_and(|r| !r.is_empty()) {
                break;
            }
        }

        nix::unistd::read(fd.as_raw_fd(), buf).map_err(io::Error::from)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let guard = self.fd.read().unwrap_or_else(PoisonError::into_inner);
        let fd = guard.as_ref().ok_or_else(Self::closed)?;
        nix::unistd::write(fd, buf).map_err(io::Error::from)
    }

    fn close(&self) -> io::Result<()> {
        // Wake a blocked reader first, otherwise it holds the read lock
        // forever and the descriptor can never be released.
        drop(
            self.wake_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );

        let fd = self.fd.write().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(fd) = fd {
            nix::unistd::close(fd.into_raw_fd())?;
        }
        Ok(())
    }
}

/// Datagram socket used for interface ioctls.
struct ControlSocket(OwnedFd);

impl ControlSocket {
    fn new() -> io::Result<Self> {
        let fd = socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        Ok(Self(fd))
    }

    fn hardware_address(&self, name: &str) -> io::Result<MacAddr> {
        let mut ifr = Ifreq::for_name(name);
        unsafe { get_if_hwaddr(self.0.as_raw_fd(), &mut ifr) }?;

        let data = unsafe { ifr.ifr_ifru.ifru_addr.sa_data };
        let mut mac = [0u8; 6];
        for (dst, src) in mac.iter_mut().zip(data.iter()) {
            *dst = *src as u8;
        }
        Ok(MacAddr::new(mac))
    }

    fn mtu(&self, name: &str) -> io::Result<u32> {
        let mut ifr = Ifreq::for_name(name);
        unsafe { get_if_mtu(self.0.as_raw_fd(), &mut ifr) }?;
        let mtu = unsafe { ifr.ifr_ifru.ifru_ivalue };
        u32::try_from(mtu).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative MTU"))
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> io::Result<()> {
        let mut ifr = Ifreq::for_name(name);
        ifr.ifr_ifru.ifru_ivalue = libc::c_int::try_from(mtu)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "MTU out of range"))?;
        unsafe { set_if_mtu(self.0.as_raw_fd(), &ifr) }?;
        Ok(())
    }

    fn up(&self, name: &str) -> io::Result<()> {
        let mut ifr = Ifreq::for_name(name);
        unsafe { get_if_flags(self.0.as_raw_fd(), &mut ifr) }?;

        let flags = unsafe { ifr.ifr_ifru.ifru_flags } as libc::c_int;
        ifr.ifr_ifru.ifru_flags = (flags | libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;

        unsafe { set_if_flags(self.0.as_raw_fd(), &ifr) }?;
        Ok(())
    }
}
