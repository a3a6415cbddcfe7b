use crate::mac::MacAddr;
use std::io;

/// Largest frame a single read can return.
pub const MAX_FRAME_SIZE: usize = 1800;

/// What the receive pump does after a failed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadErrorPolicy {
    /// Log the failure and read again.
    Retry,
    /// Log the failure and stop the receive pump.
    Terminate,
}

/// Frame I/O against one open virtual adapter.
///
/// `read` and `write` are called concurrently from two different threads,
/// one per direction, and both block until the OS completes the operation.
pub trait TapImpl: Send + Sync {
    /// Reads exactly one frame into `buf`.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes exactly one frame.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Marks the link connected or disconnected. Backends whose link state
    /// follows the descriptor lifetime leave this as a no-op.
    fn set_link_state(&self, _connected: bool) -> io::Result<()> {
        Ok(())
    }

    /// Releases the OS resource. Must be idempotent, and a read blocked in
    /// another thread must return an error once this has been called.
    fn close(&self) -> io::Result<()>;

    fn read_error_policy(&self) -> ReadErrorPolicy {
        ReadErrorPolicy::Retry
    }
}

/// Identity of an open adapter, read back from the OS once at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub mac: MacAddr,
    pub mtu: u32,
}
