use std::io;
use std::mem;
use std::sync::OnceLock;
use windows::core::{s, w};
use windows::Win32::Foundation::{CloseHandle, BOOL, ERROR_IO_PENDING, HANDLE};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Threading::CreateEventW;
use windows::Win32::System::IO::OVERLAPPED;

type GetOverlappedResultFn =
    unsafe extern "system" fn(HANDLE, *const OVERLAPPED, *mut u32, BOOL) -> BOOL;

static GET_OVERLAPPED_RESULT: OnceLock<Option<GetOverlappedResultFn>> = OnceLock::new();

/// `GetOverlappedResult`, resolved from kernel32 on first use.
fn get_overlapped_result() -> io::Result<GetOverlappedResultFn> {
    let resolved = GET_OVERLAPPED_RESULT.get_or_init(|| unsafe {
        let kernel32 = GetModuleHandleW(w!("kernel32.dll")).ok()?;
        let proc = GetProcAddress(kernel32, s!("GetOverlappedResult"))?;
        Some(mem::transmute::<unsafe extern "system" fn() -> isize, GetOverlappedResultFn>(proc))
    });

    resolved.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "GetOverlappedResult not found in kernel32.dll",
        )
    })
}

/// An OVERLAPPED block with its own manual-reset completion event.
///
/// One instance serves one operation at a time; callers keep it behind a
/// mutex and must not move it while an operation is pending.
pub(super) struct Overlapped {
    inner: OVERLAPPED,
}

// The event handle is owned by this value and only used under its mutex.
unsafe impl Send for Overlapped {}

impl Overlapped {
    pub(super) fn new() -> io::Result<Self> {
        let event = unsafe { CreateEventW(None, true, false, None) }?;
        Ok(Self {
            inner: OVERLAPPED {
                hEvent: event,
                ..Default::default()
            },
        })
    }

    /// Issues an operation through `submit` and blocks on its completion
    /// event until the driver finishes it. Returns the transferred byte
    /// count.
    pub(super) fn run<F>(&mut self, handle: HANDLE, submit: F) -> io::Result<u32>
    where
        F: FnOnce(*mut OVERLAPPED) -> windows::core::Result<()>,
    {
        let event = self.inner.hEvent;
        self.inner = OVERLAPPED {
            hEvent: event,
            ..Default::default()
        };

        if let Err(e) = submit(&mut self.inner) {
            if e.code() != ERROR_IO_PENDING.to_hresult() {
                return Err(e.into());
            }
        }

        let wait = get_overlapped_result()?;
        let mut transferred = 0u32;
        let done = unsafe { wait(handle, &self.inner, &mut transferred, BOOL::from(true)) };
        if done.as_bool() {
            Ok(transferred)
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl Drop for Overlapped {
    fn drop(&mut self) {
        if !self.inner.hEvent.is_invalid() {
            let _ = unsafe { CloseHandle(self.inner.hEvent) };
        }
    }
}
