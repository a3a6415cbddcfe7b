//! Virtual Ethernet (TAP) adapters presented as a pair of bounded frame
//! queues.
//!
//! [`Tap::open`] creates or locates the OS adapter, reads back its identity
//! and starts two pump threads: one writes frames queued on
//! [`Tap::transmit`] to the device, the other reads frames from the device
//! into [`Tap::receive`]. Linux uses `/dev/net/tun`; Windows drives an
//! installed TAP-Windows adapter through its kernel driver handle.

mod config;
pub mod driver;
mod error;
mod mac;
mod pump;
mod queue;
mod tap_impl;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(windows)]
mod windows;

pub use config::{TapConfig, DEFAULT_MTU, DEFAULT_QUEUE_CAPACITY};
pub use crossbeam_channel::RecvTimeoutError;
pub use error::{Result, TapError};
pub use mac::{MacAddr, ParseMacError};
pub use queue::{FrameReceiver, FrameSender, TrySendError};
pub use tap_impl::{DeviceInfo, ReadErrorPolicy, TapImpl, MAX_FRAME_SIZE};

use crossbeam_channel::Sender;
use pump::{Running, TapHandle};
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Liveness of the two pump threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpHealth {
    pub transmit_running: bool,
    pub receive_running: bool,
}

/// An open virtual adapter.
///
/// Dropping the adapter closes it.
pub struct Tap {
    inner: TapHandle,
    info: DeviceInfo,
    tx: FrameSender,
    rx: FrameReceiver,
    closing: Arc<AtomicBool>,
    shutdown: Mutex<Option<Sender<()>>>,
    transmit_running: Arc<AtomicBool>,
    receive_running: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Tap {
    /// Opens the platform adapter described by `config` and starts pumping
    /// frames.
    pub fn open(config: &TapConfig) -> Result<Self> {
        config.validate()?;

        #[cfg(target_os = "linux")]
        {
            let (backend, info) = crate::linux::LinuxTap::open(config)?;
            return Self::from_backend(backend, info, config.queue_capacity);
        }

        #[cfg(windows)]
        {
            let (backend, info) = crate::windows::open(config)?;
            return Self::from_backend(backend, info, config.queue_capacity);
        }

        #[allow(unreachable_code)]
        Err(TapError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "Unsupported OS",
        )))
    }

    /// Wraps an already open backend and starts both pumps.
    ///
    /// `info` is reported verbatim by [`Tap::name`], [`Tap::mtu`] and
    /// [`Tap::mac_address`]. The backend is closed if the adapter cannot be
    /// started.
    pub fn from_backend<T>(backend: T, info: DeviceInfo, queue_capacity: usize) -> Result<Self>
    where
        T: TapImpl + 'static,
    {
        let inner: TapHandle = Arc::new(backend);

        if let Err(e) = config::validate_capacity(queue_capacity) {
            close_quietly(&*inner);
            return Err(e);
        }

        let (out_tx, out_rx) = crossbeam_channel::bounded::<Vec<u8>>(queue_capacity);
        let (in_tx, in_rx) = crossbeam_channel::bounded::<Vec<u8>>(queue_capacity);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);

        let closing = Arc::new(AtomicBool::new(false));
        let transmit_running = Arc::new(AtomicBool::new(false));
        let receive_running = Arc::new(AtomicBool::new(false));

        let tap = Tap {
            inner: Arc::clone(&inner),
            info,
            tx: FrameSender::new(out_tx, Arc::clone(&closing)),
            rx: FrameReceiver::new(in_rx),
            closing: Arc::clone(&closing),
            shutdown: Mutex::new(Some(shutdown_tx)),
            transmit_running: Arc::clone(&transmit_running),
            receive_running: Arc::clone(&receive_running),
            threads: Mutex::new(Vec::with_capacity(2)),
        };

        let tap_for_writer = Arc::clone(&inner);
        let closing_for_writer = Arc::clone(&closing);
        let writer_state = Running::mark(transmit_running);
        let writer = thread::Builder::new()
            .name("tap-tx".into())
            .spawn(move || {
                pump::write_to_tap(
                    tap_for_writer,
                    out_rx,
                    shutdown_rx,
                    closing_for_writer,
                    writer_state,
                );
            });
        tap.track(writer)?;

        let tap_for_reader = Arc::clone(&inner);
        let closing_for_reader = Arc::clone(&closing);
        let reader_state = Running::mark(receive_running);
        let reader = thread::Builder::new()
            .name("tap-rx".into())
            .spawn(move || {
                pump::read_from_tap(tap_for_reader, in_tx, closing_for_reader, reader_state);
            });
        tap.track(reader)?;

        Ok(tap)
    }

    // On spawn failure the returned error drops `self`, which closes the
    // backend and stops whichever pump did start.
    fn track(&self, spawned: io::Result<JoinHandle<()>>) -> Result<()> {
        let handle = spawned?;
        self.threads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
        Ok(())
    }

    /// Producer end of the outbound queue.
    pub fn transmit(&self) -> FrameSender {
        self.tx.clone()
    }

    /// Consumer end of the inbound queue.
    pub fn receive(&self) -> FrameReceiver {
        self.rx.clone()
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// MTU reported by the OS when the adapter was opened.
    pub fn mtu(&self) -> u32 {
        self.info.mtu
    }

    pub fn mac_address(&self) -> MacAddr {
        self.info.mac
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn health(&self) -> PumpHealth {
        PumpHealth {
            transmit_running: self.transmit_running.load(Ordering::Acquire),
            receive_running: self.receive_running.load(Ordering::Acquire),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Stops accepting outbound frames and releases the device.
    ///
    /// Frames already queued are still handed to the device, but frames in
    /// flight may be lost once the device is gone. The pumps wind down on
    /// their own; use [`Tap::join`] to wait for them. Calling `close` again
    /// does nothing.
    pub fn close(&self) -> Result<()> {
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(shutdown) = shutdown else {
            return Ok(());
        };

        log::debug!("tap: closing {}", self.info.name);

        self.closing.store(true, Ordering::Release);
        drop(shutdown);

        if let Err(e) = self.inner.set_link_state(false) {
            log::warn!("tap: failed to mark {} disconnected: {}", self.info.name, e);
        }

        self.inner.close()?;
        Ok(())
    }

    /// Closes the adapter and waits for both pumps to exit.
    ///
    /// Frames still waiting in the inbound queue are discarded.
    pub fn join(self) -> Result<()> {
        let result = self.close();

        while self.rx.recv().is_some() {}

        let threads = mem::take(
            &mut *self
                .threads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for handle in threads {
            let name = handle.thread().name().unwrap_or("tap pump").to_string();
            if handle.join().is_err() {
                log::error!("tap: {} panicked", name);
            }
        }

        result
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("tap: error closing {}: {}", self.info.name, e);
        }
    }
}

fn close_quietly(tap: &dyn TapImpl) {
    if let Err(e) = tap.close() {
        log::warn!("tap: error closing backend: {}", e);
    }
}
