mod common;

use common::{info, wait_until, MockTap, WAIT};
use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tap::{ReadErrorPolicy, Tap, TapError, TrySendError};

#[test]
fn blocked_writer_applies_backpressure() {
    let capacity = 2;
    let (mock, handle) = MockTap::builder().gated_writes().build();
    let tap = Tap::from_backend(mock, info(), capacity).unwrap();
    let tx = tap.transmit();
    let started = handle.write_started.as_ref().unwrap();

    // The pump takes the first frame and parks inside the write.
    tx.send(vec![0]).unwrap();
    started.recv_timeout(WAIT).unwrap();

    for i in 1..=capacity as u8 {
        tx.send_timeout(vec![i], WAIT).unwrap();
    }

    let err = tx
        .send_timeout(vec![99], Duration::from_millis(50))
        .unwrap_err();
    assert!(matches!(err, TrySendError::Full(_)));

    // Unblocking the writer frees space again.
    let release = handle.release_write.as_ref().unwrap();
    release.send(()).unwrap();
    tx.send_timeout(vec![3], WAIT).unwrap();

    for _ in 0..3 {
        release.send(()).unwrap();
    }
    wait_until("all writes", || handle.observed.writes().len() == 4);
    assert_eq!(
        handle.observed.writes(),
        vec![vec![0], vec![1], vec![2], vec![3]]
    );
}

#[test]
fn frames_are_written_in_queue_order() {
    let (mock, handle) = MockTap::builder().build();
    let tap = Tap::from_backend(mock, info(), 64).unwrap();
    let tx = tap.transmit();

    let frames: Vec<Vec<u8>> = (0..50u8).map(|i| vec![i, i.wrapping_mul(3), 0xee]).collect();
    for frame in &frames {
        tx.send(frame.clone()).unwrap();
    }

    wait_until("all writes", || handle.observed.writes().len() == frames.len());
    assert_eq!(handle.observed.writes(), frames);
}

#[test]
fn frames_are_received_in_read_order() {
    let (mock, handle) = MockTap::builder().build();
    let tap = Tap::from_backend(mock, info(), 4).unwrap();
    let rx = tap.receive();

    for i in 0..20u8 {
        handle.frames.send(Ok(vec![i; (i as usize) + 1])).unwrap();
    }

    for i in 0..20u8 {
        let frame = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(frame, vec![i; (i as usize) + 1]);
    }
}

#[test]
fn close_is_idempotent() {
    let (mock, handle) = MockTap::builder().build();
    let tap = Tap::from_backend(mock, info(), 8).unwrap();

    tap.close().unwrap();
    tap.close().unwrap();

    assert!(tap.is_closed());
    assert_eq!(handle.observed.closes.load(Ordering::SeqCst), 1);
    assert_eq!(*handle.observed.link.lock().unwrap(), vec![false]);

    drop(tap);
    assert_eq!(handle.observed.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn sends_after_close_are_rejected() {
    let (mock, _handle) = MockTap::builder().build();
    let tap = Tap::from_backend(mock, info(), 8).unwrap();
    let tx = tap.transmit();

    tap.close().unwrap();

    assert!(matches!(tx.send(vec![1, 2, 3]), Err(TapError::Closed)));
    assert!(matches!(
        tx.try_send(vec![1]),
        Err(TrySendError::Closed(_))
    ));
    assert!(matches!(
        tap.transmit().send_timeout(vec![1], Duration::from_millis(10)),
        Err(TrySendError::Closed(_))
    ));
}

#[test]
fn receive_queue_runs_dry_after_close() {
    let (mock, handle) = MockTap::builder().build();
    let tap = Tap::from_backend(mock, info(), 8).unwrap();
    let rx = tap.receive();

    handle.frames.send(Ok(vec![1])).unwrap();
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![1]);

    tap.close().unwrap();

    assert_eq!(rx.recv(), None);
    wait_until("pumps to stop", || {
        let health = tap.health();
        !health.receive_running && !health.transmit_running
    });
}

#[test]
fn failed_write_does_not_stop_transmit_pump() {
    let (mock, handle) = MockTap::builder().fail_writes(1).build();
    let tap = Tap::from_backend(mock, info(), 8).unwrap();
    let tx = tap.transmit();

    tx.send(vec![1]).unwrap();
    tx.send(vec![2]).unwrap();
    tx.send(vec![3]).unwrap();

    wait_until("remaining writes", || handle.observed.writes().len() == 2);
    assert_eq!(handle.observed.writes(), vec![vec![2], vec![3]]);
    assert_eq!(handle.observed.write_attempts.load(Ordering::SeqCst), 3);
    assert!(tap.health().transmit_running);
}

#[test]
fn terminate_policy_stops_receive_pump_on_first_error() {
    let (mock, handle) = MockTap::builder()
        .policy(ReadErrorPolicy::Terminate)
        .build();
    let tap = Tap::from_backend(mock, info(), 8).unwrap();
    let rx = tap.receive();

    handle.frames.send(Ok(vec![1])).unwrap();
    handle
        .frames
        .send(Err(io::Error::new(io::ErrorKind::Other, "adapter disabled")))
        .unwrap();
    handle.frames.send(Ok(vec![2])).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![1]);
    assert_eq!(rx.recv(), None);

    assert!(!tap.health().receive_running);
    assert!(tap.health().transmit_running);
    assert_eq!(handle.observed.reads.load(Ordering::SeqCst), 2);
}

#[test]
fn retry_policy_keeps_reading_after_error() {
    let (mock, handle) = MockTap::builder().policy(ReadErrorPolicy::Retry).build();
    let tap = Tap::from_backend(mock, info(), 8).unwrap();
    let rx = tap.receive();

    handle
        .frames
        .send(Err(io::Error::new(io::ErrorKind::Interrupted, "signal")))
        .unwrap();
    handle.frames.send(Ok(vec![7, 7])).unwrap();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), vec![7, 7]);
    assert!(tap.health().receive_running);
}

#[test]
fn metadata_is_reported_verbatim() {
    let (mock, _handle) = MockTap::builder().build();
    let tap = Tap::from_backend(mock, info(), 1).unwrap();

    assert_eq!(tap.name(), "tap-mock");
    assert_eq!(tap.mtu(), 1400);
    assert_eq!(tap.mac_address(), info().mac);
    assert_eq!(tap.info(), &info());
}

#[test]
fn zero_capacity_is_rejected_and_backend_released() {
    let (mock, handle) = MockTap::builder().build();
    let err = Tap::from_backend(mock, info(), 0).err().unwrap();

    assert!(matches!(err, TapError::Config(_)));
    assert_eq!(handle.observed.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn join_waits_for_both_pumps() {
    let (mock, handle) = MockTap::builder().build();
    let tap = Tap::from_backend(mock, info(), 2).unwrap();

    // Leave the inbound queue full so the receive pump is parked on it.
    for i in 0..3u8 {
        handle.frames.send(Ok(vec![i])).unwrap();
    }
    tap.transmit().send(vec![9]).unwrap();

    wait_until("inbound queue to fill", || tap.receive().len() == 2);
    tap.join().unwrap();

    assert_eq!(handle.observed.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn queued_frames_are_drained_on_close() {
    let (mock, handle) = MockTap::builder().gated_writes().build();
    let tap = Tap::from_backend(mock, info(), 8).unwrap();
    let tx = tap.transmit();
    let started = handle.write_started.as_ref().unwrap();
    let release = handle.release_write.as_ref().unwrap();

    tx.send(vec![0]).unwrap();
    started.recv_timeout(WAIT).unwrap();
    for i in 1..4u8 {
        tx.send(vec![i]).unwrap();
    }

    tap.close().unwrap();
    for _ in 0..4 {
        release.send(()).unwrap();
    }

    wait_until("transmit pump to stop", || !tap.health().transmit_running);
    assert_eq!(
        handle.observed.write_attempts.load(Ordering::SeqCst),
        4,
        "every queued frame reaches the backend before the pump exits"
    );
}
