use super::overlapped::Overlapped;
use crate::driver::{DriverDevice, TAP_IOCTL_GET_MAC, TAP_IOCTL_SET_MEDIA_STATUS};
use crate::error::{Result, TapError};
use crate::mac::MacAddr;
use crate::tap_impl::{ReadErrorPolicy, TapImpl};
use std::ffi::c_void;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, TryLockError};
use std::thread;
use std::time::Duration;
use windows::core::HSTRING;
use windows::Win32::Foundation::{CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, ReadFile, WriteFile, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_OVERLAPPED,
    FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::IO::{CancelIoEx, DeviceIoControl};

#[derive(Clone, Copy)]
struct Handle(HANDLE);

// Kernel handles may be used from any thread.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

/// An open TAP-Windows driver handle.
///
/// Reads, writes and control requests each own an OVERLAPPED block, so the
/// receive and transmit pumps never wait on each other.
pub(crate) struct WindowsTap {
    handle: Handle,
    closed: AtomicBool,
    // Held shared by every in-flight operation; close takes it exclusively
    // before releasing the handle.
    io: RwLock<()>,
    read_ov: Mutex<Overlapped>,
    write_ov: Mutex<Overlapped>,
    ctl_ov: Mutex<Overlapped>,
}

impl WindowsTap {
    pub(crate) fn open(path: &str) -> Result<Self> {
        let open_err = |source: io::Error| TapError::Open {
            path: path.to_string(),
            source,
        };

        let read_ov = Overlapped::new()?;
        let write_ov = Overlapped::new()?;
        let ctl_ov = Overlapped::new()?;

        let handle = unsafe {
            CreateFileW(
                &HSTRING::from(path),
                GENERIC_READ.0 | GENERIC_WRITE.0,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                None,
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED,
                HANDLE::default(),
            )
        }
        .map_err(|e| open_err(e.into()))?;

        log::debug!("tap: opened driver handle {}", path);

        Ok(Self {
            handle: Handle(handle),
            closed: AtomicBool::new(false),
            io: RwLock::new(()),
            read_ov: Mutex::new(read_ov),
            write_ov: Mutex::new(write_ov),
            ctl_ov: Mutex::new(ctl_ov),
        })
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "tap driver handle closed")
    }

    fn ioctl(&self, code: u32, input: &[u8], output: &mut [u8]) -> io::Result<u32> {
        let _gate = self.io.read().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_error());
        }

        let handle = self.handle.0;
        let mut ov = self.ctl_ov.lock().unwrap_or_else(PoisonError::into_inner);
        ov.run(handle, |ov| unsafe {
            DeviceIoControl(
                handle,
                code,
                Some(input.as_ptr() as *const c_void),
                input.len() as u32,
                Some(output.as_mut_ptr() as *mut c_void),
                output.len() as u32,
                None,
                Some(ov),
            )
        })
    }
}

impl TapImpl for WindowsTap {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let _gate = self.io.read().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_error());
        }

        let handle = self.handle.0;
        let mut ov = self.read_ov.lock().unwrap_or_else(PoisonError::into_inner);
        let n = ov.run(handle, |ov| unsafe { ReadFile(handle, Some(buf), None, Some(ov)) })?;
        Ok(n as usize)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let _gate = self.io.read().unwrap_or_else(PoisonError::into_inner);
        if self.closed.load(Ordering::Acquire) {
            return Err(Self::closed_error());
        }

        let handle = self.handle.0;
        let mut ov = self.write_ov.lock().unwrap_or_else(PoisonError::into_inner);
        let n = ov.run(handle, |ov| unsafe { WriteFile(handle, Some(buf), None, Some(ov)) })?;
        Ok(n as usize)
    }

    fn set_link_state(&self, connected: bool) -> io::Result<()> {
        let status: [u8; 4] = u32::from(connected).to_le_bytes();
        let mut out = status;
        self.ioctl(TAP_IOCTL_SET_MEDIA_STATUS, &status, &mut out)
            .map(|_| ())
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("DeviceIoControl ioctl SetMediaStatus failed: {}", e),
                )
            })
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // An operation may pass the closed check just before the swap and
        // submit after the first cancel, so keep cancelling until every
        // in-flight operation has let go of the gate.
        let _gate = loop {
            let _ = unsafe { CancelIoEx(self.handle.0, None) };
            match self.io.try_write() {
                Ok(gate) => break gate,
                Err(TryLockError::Poisoned(poisoned)) => break poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => thread::sleep(Duration::from_millis(1)),
            }
        };

        unsafe { CloseHandle(self.handle.0) }?;
        Ok(())
    }

    fn read_error_policy(&self) -> ReadErrorPolicy {
        // A failed read on a driver handle means the adapter was disabled
        // or removed.
        ReadErrorPolicy::Terminate
    }
}

impl DriverDevice for WindowsTap {
    fn hardware_address(&self) -> io::Result<MacAddr> {
        let mut mac = [0u8; 6];
        let input = mac;
        self.ioctl(TAP_IOCTL_GET_MAC, &input, &mut mac).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("DeviceIoControl ioctl GetMacAddress failed: {}", e),
            )
        })?;
        Ok(MacAddr::new(mac))
    }
}

impl Drop for WindowsTap {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("tap: closing driver handle: {}", e);
        }
    }
}
