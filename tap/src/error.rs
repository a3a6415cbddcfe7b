//! Error types for adapter construction and the frame queues.

use crate::mac::MacAddr;
use std::io;
use thiserror::Error;

/// Errors returned by the adapter.
///
/// Everything except [`TapError::Closed`] is a construction-time failure;
/// by the time one is returned every resource acquired so far has already
/// been released.
#[derive(Debug, Error)]
pub enum TapError {
    /// No installed adapter carries the expected driver component id.
    #[error("adapter: device not found")]
    AdapterNotFound,

    /// The adapter configuration tree could not be read.
    #[error("adapter: configuration read failed: {0}")]
    Registry(String),

    /// The device could not be opened or bound.
    #[error("adapter: failed to open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    /// The driver refused to report its hardware address.
    #[error("adapter: hardware address query failed: {0}")]
    HardwareAddress(#[source] io::Error),

    /// No OS-visible interface carries the adapter's hardware address.
    #[error("adapter: name of interface with address {0} not found")]
    InterfaceNameNotFound(MacAddr),

    /// Looking up metadata for a named interface failed.
    #[error("adapter: failed to find interface {name}: {source}")]
    InterfaceLookup {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Invalid configuration.
    #[error("adapter: configuration error: {0}")]
    Config(String),

    /// The adapter has been closed; no further frames are accepted.
    #[error("adapter: closed")]
    Closed,

    /// Any other I/O failure during setup or teardown.
    #[error("adapter: {0}")]
    Io(#[from] io::Error),
}

impl TapError {
    /// Returns true for failures that may succeed if the caller retries,
    /// such as a busy device or an interrupted call.
    pub fn is_transient(&self) -> bool {
        let source = match self {
            TapError::Open { source, .. } => source,
            TapError::Io(source) => source,
            _ => return false,
        };

        matches!(
            source.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
        ) || source.raw_os_error() == Some(EBUSY)
    }
}

#[cfg(not(windows))]
const EBUSY: i32 = 16;

// ERROR_BUSY
#[cfg(windows)]
const EBUSY: i32 = 170;

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, TapError>;
