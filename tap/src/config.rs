//! Adapter construction options.

use crate::error::{Result, TapError};

pub const DEFAULT_MTU: u32 = 1500;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Options for [`crate::Tap::open`].
///
/// The requested MTU is informational unless `apply_mtu` is set; in every
/// case the value to use afterwards is the one reported by
/// [`crate::Tap::mtu`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TapConfig {
    /// Interface name hint. Honored on Linux (empty lets the kernel pick),
    /// ignored on Windows where the installed adapter decides.
    pub name: Option<String>,
    pub mtu: u32,
    /// Push `mtu` to the OS before reading metadata back.
    pub apply_mtu: bool,
    /// Set the interface administratively up after creation (Linux).
    pub bring_up: bool,
    /// Capacity of both the inbound and the outbound queue.
    pub queue_capacity: usize,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            name: None,
            mtu: DEFAULT_MTU,
            apply_mtu: false,
            bring_up: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl TapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_apply_mtu(mut self, apply: bool) -> Self {
        self.apply_mtu = apply;
        self
    }

    pub fn with_bring_up(mut self, up: bool) -> Self {
        self.bring_up = up;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_capacity(self.queue_capacity)?;

        if self.apply_mtu && self.mtu < 68 {
            return Err(TapError::Config(format!(
                "mtu {} is below the IPv4 minimum of 68",
                self.mtu
            )));
        }

        if let Some(name) = &self.name {
            if name.as_bytes().contains(&0) {
                return Err(TapError::Config(
                    "interface name contains a NUL byte".into(),
                ));
            }
        }

        Ok(())
    }
}

pub(crate) fn validate_capacity(capacity: usize) -> Result<()> {
    if capacity == 0 {
        return Err(TapError::Config("queue capacity must be at least 1".into()));
    }
    Ok(())
}
