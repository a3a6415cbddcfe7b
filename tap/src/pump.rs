use crate::tap_impl::{ReadErrorPolicy, TapImpl, MAX_FRAME_SIZE};
use crossbeam_channel::{select, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) type TapHandle = Arc<dyn TapImpl>;

/// Clears a pump's liveness flag when the pump returns or unwinds.
pub(crate) struct Running(Arc<AtomicBool>);

impl Running {
    pub(crate) fn mark(flag: Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Transmit pump: writes every outbound frame to the device in queue order.
///
/// Returns once `shutdown` disconnects and everything already queued has
/// been written, or once every producer is gone. Dropping `outbound` on
/// return wakes any producer still blocked on a full queue.
pub(crate) fn write_to_tap(
    tap: TapHandle,
    outbound: Receiver<Vec<u8>>,
    shutdown: Receiver<()>,
    closing: Arc<AtomicBool>,
    running: Running,
) {
    loop {
        select! {
            recv(outbound) -> frame => match frame {
                Ok(frame) => write_frame(&*tap, &frame, &closing),
                Err(_) => break,
            },
            recv(shutdown) -> _ => {
                for frame in outbound.try_iter() {
                    write_frame(&*tap, &frame, &closing);
                }
                break;
            }
        }
    }

    log::debug!("tap: transmit pump stopped");
    drop(running);
}

fn write_frame(tap: &dyn TapImpl, frame: &[u8], closing: &AtomicBool) {
    if let Err(e) = tap.write(frame) {
        if closing.load(Ordering::Acquire) {
            log::debug!("tap: dropped frame during close: {}", e);
        } else {
            log::warn!("tap: error when writing to tap: {}", e);
        }
    }
}

/// Receive pump: pushes every frame read from the device onto `inbound`,
/// blocking while the consumer is behind.
///
/// Stops when the adapter is closing, when the backend's policy says a read
/// error is fatal, or when nobody holds the inbound queue any more. Dropping
/// `inbound` on return is what tells consumers the adapter is down.
pub(crate) fn read_from_tap(
    tap: TapHandle,
    inbound: Sender<Vec<u8>>,
    closing: Arc<AtomicBool>,
    running: Running,
) {
    let policy = tap.read_error_policy();

    loop {
        let mut buf = vec![0u8; MAX_FRAME_SIZE];
        match tap.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => {
                buf.truncate(n);
                if inbound.send(buf).is_err() {
                    log::debug!("tap: inbound queue dropped, stopping receive pump");
                    break;
                }
            }
            Err(e) => {
                if closing.load(Ordering::Acquire) {
                    log::debug!("tap: read ended by close: {}", e);
                    break;
                }
                match policy {
                    ReadErrorPolicy::Retry => {
                        log::warn!("tap: error when reading from tap: {}", e);
                    }
                    ReadErrorPolicy::Terminate => {
                        log::error!("tap: read returned error, stopping receive pump: {}", e);
                        break;
                    }
                }
            }
        }
    }

    log::debug!("tap: receive pump stopped");
    drop(running);
}
