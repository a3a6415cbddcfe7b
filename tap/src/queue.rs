//! Producer and consumer ends of the adapter's frame queues.

use crate::error::{Result, TapError};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A frame that could not be queued without blocking.
#[derive(Debug, Error)]
pub enum TrySendError {
    /// The outbound queue stayed full.
    #[error("outbound queue full")]
    Full(Vec<u8>),

    #[error("adapter: closed")]
    Closed(Vec<u8>),
}

impl TrySendError {
    pub fn into_frame(self) -> Vec<u8> {
        match self {
            TrySendError::Full(frame) | TrySendError::Closed(frame) => frame,
        }
    }
}

/// Producer end of the outbound queue. Clones share the same queue.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: Sender<Vec<u8>>,
    closing: Arc<AtomicBool>,
}

impl FrameSender {
    pub(crate) fn new(tx: Sender<Vec<u8>>, closing: Arc<AtomicBool>) -> Self {
        Self { tx, closing }
    }

    /// Queues one frame, blocking while the queue is full.
    pub fn send(&self, frame: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(TapError::Closed);
        }
        self.tx.send(frame).map_err(|_| TapError::Closed)
    }

    pub fn try_send(&self, frame: Vec<u8>) -> std::result::Result<(), TrySendError> {
        if self.is_closed() {
            return Err(TrySendError::Closed(frame));
        }
        self.tx.try_send(frame).map_err(|e| match e {
            crossbeam_channel::TrySendError::Full(f) => TrySendError::Full(f),
            crossbeam_channel::TrySendError::Disconnected(f) => TrySendError::Closed(f),
        })
    }

    pub fn send_timeout(
        &self,
        frame: Vec<u8>,
        timeout: Duration,
    ) -> std::result::Result<(), TrySendError> {
        if self.is_closed() {
            return Err(TrySendError::Closed(frame));
        }
        self.tx.send_timeout(frame, timeout).map_err(|e| match e {
            SendTimeoutError::Timeout(f) => TrySendError::Full(f),
            SendTimeoutError::Disconnected(f) => TrySendError::Closed(f),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Frames currently waiting for the transmit pump.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }
}

/// Consumer end of the inbound queue. Clones share the same queue.
///
/// Once the receive pump has stopped and the queue is drained, every
/// receive returns nothing: the adapter is down.
#[derive(Debug, Clone)]
pub struct FrameReceiver {
    rx: Receiver<Vec<u8>>,
}

impl FrameReceiver {
    pub(crate) fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Blocks for the next frame. `None` means the adapter is down.
    pub fn recv(&self) -> Option<Vec<u8>> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Vec<u8>, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn iter(&self) -> crossbeam_channel::Iter<'_, Vec<u8>> {
        self.rx.iter()
    }

    /// The underlying channel, for use in `crossbeam_channel::select!`.
    pub fn as_channel(&self) -> &Receiver<Vec<u8>> {
        &self.rx
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<'a> IntoIterator for &'a FrameReceiver {
    type Item = Vec<u8>;
    type IntoIter = crossbeam_channel::Iter<'a, Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.rx.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_send_reports_full_queue() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let sender = FrameSender::new(tx, Arc::new(AtomicBool::new(false)));

        sender.try_send(vec![1]).unwrap();
        let err = sender.try_send(vec![2]).unwrap_err();
        assert!(matches!(err, TrySendError::Full(_)));
        assert_eq!(err.into_frame(), vec![2]);
    }

    #[test]
    fn closing_flag_rejects_without_touching_queue() {
        let (tx, rx) = crossbeam_channel::bounded(4);
        let closing = Arc::new(AtomicBool::new(false));
        let sender = FrameSender::new(tx, Arc::clone(&closing));

        closing.store(true, Ordering::Release);
        assert!(matches!(sender.send(vec![1]), Err(TapError::Closed)));
        assert!(matches!(sender.try_send(vec![1]), Err(TrySendError::Closed(_))));
        assert!(rx.is_empty());
    }

    #[test]
    fn dropped_consumer_surfaces_as_closed() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let sender = FrameSender::new(tx, Arc::new(AtomicBool::new(false)));
        drop(rx);
        assert!(matches!(sender.send(vec![1]), Err(TapError::Closed)));
    }

    #[test]
    fn receiver_yields_none_after_disconnect() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let receiver = FrameReceiver::new(rx);
        tx.send(vec![7]).unwrap();
        drop(tx);

        assert_eq!(receiver.recv(), Some(vec![7]));
        assert_eq!(receiver.recv(), None);
    }
}
