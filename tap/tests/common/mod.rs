#![allow(dead_code)]

use crossbeam_channel::{select, Receiver, Sender};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tap::{DeviceInfo, MacAddr, ReadErrorPolicy, TapImpl};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn info() -> DeviceInfo {
    DeviceInfo {
        name: "tap-mock".into(),
        mac: MacAddr::new([0x02, 0x00, 0x5e, 0x10, 0x20, 0x30]),
        mtu: 1400,
    }
}

pub fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

/// What a mock backend saw.
#[derive(Default)]
pub struct Observed {
    pub writes: Mutex<Vec<Vec<u8>>>,
    pub write_attempts: AtomicUsize,
    pub reads: AtomicUsize,
    pub closes: AtomicUsize,
    pub link: Mutex<Vec<bool>>,
}

impl Observed {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }
}

/// In-memory backend. Reads are fed through [`MockHandle::frames`]; a read
/// blocks until a scripted result arrives or the backend is closed.
pub struct MockTap {
    frames: Receiver<io::Result<Vec<u8>>>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    fail_writes: AtomicUsize,
    write_gate: Option<(Sender<()>, Receiver<()>)>,
    policy: ReadErrorPolicy,
    observed: Arc<Observed>,
}

pub struct MockHandle {
    pub frames: Sender<io::Result<Vec<u8>>>,
    pub observed: Arc<Observed>,
    /// Signals each write that has started, when the gate is enabled.
    pub write_started: Option<Receiver<()>>,
    /// Releases one gated write per message.
    pub release_write: Option<Sender<()>>,
}

pub struct MockBuilder {
    fail_writes: usize,
    gated: bool,
    policy: ReadErrorPolicy,
}

impl MockTap {
    pub fn builder() -> MockBuilder {
        MockBuilder {
            fail_writes: 0,
            gated: false,
            policy: ReadErrorPolicy::Retry,
        }
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "mock closed")
    }
}

impl MockBuilder {
    pub fn fail_writes(mut self, n: usize) -> Self {
        self.fail_writes = n;
        self
    }

    pub fn gated_writes(mut self) -> Self {
        self.gated = true;
        self
    }

    pub fn policy(mut self, policy: ReadErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> (MockTap, MockHandle) {
        let (frames_tx, frames_rx) = crossbeam_channel::unbounded();
        let (close_tx, close_rx) = crossbeam_channel::bounded(0);
        let observed = Arc::new(Observed::default());

        let (write_gate, write_started, release_write) = if self.gated {
            let (started_tx, started_rx) = crossbeam_channel::unbounded();
            let (release_tx, release_rx) = crossbeam_channel::unbounded();
            (
                Some((started_tx, release_rx)),
                Some(started_rx),
                Some(release_tx),
            )
        } else {
            (None, None, None)
        };

        let tap = MockTap {
            frames: frames_rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            fail_writes: AtomicUsize::new(self.fail_writes),
            write_gate,
            policy: self.policy,
            observed: Arc::clone(&observed),
        };
        let handle = MockHandle {
            frames: frames_tx,
            observed,
            write_started,
            release_write,
        };
        (tap, handle)
    }
}

impl TapImpl for MockTap {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.observed.reads.fetch_add(1, Ordering::SeqCst);
        let next = select! {
            recv(self.frames) -> next => next,
            recv(self.close_rx) -> _ => return Err(Self::closed()),
        };
        match next {
            Ok(Ok(frame)) => {
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // Script finished; behave like an idle device until closed.
                let _ = self.close_rx.recv();
                Err(Self::closed())
            }
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.observed.write_attempts.fetch_add(1, Ordering::SeqCst);

        if let Some((started, release)) = &self.write_gate {
            let _ = started.send(());
            let _ = release.recv();
        }

        let failing = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "driver busy"));
        }

        self.observed.writes.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    fn set_link_state(&self, connected: bool) -> io::Result<()> {
        self.observed.link.lock().unwrap().push(connected);
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        if self.close_tx.lock().unwrap().take().is_some() {
            self.observed.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn read_error_policy(&self) -> ReadErrorPolicy {
        self.policy
    }
}
