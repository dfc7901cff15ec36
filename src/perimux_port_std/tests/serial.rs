//! Serial manager scenarios on the loopback interface.
use std::{sync::Mutex, thread, time::Duration};

use perimux::{
    CallbackMessage, ReadResult, SerialError, SerialManager, SerialManagerOptions, SerialStatus,
};
use perimux_port_std::{init_logger, FlagWakeup, LoopbackSerial};

type Manager = SerialManager<LoopbackSerial, FlagWakeup>;

type EventLog = Mutex<Vec<(SerialStatus, Vec<u8>, usize)>>;

fn new_log() -> &'static EventLog {
    Box::leak(Box::new(Mutex::new(Vec::new())))
}

fn log_param(log: &'static EventLog) -> usize {
    log as *const EventLog as usize
}

fn log_event(param: usize, msg: &CallbackMessage<'_>) {
    let log = unsafe { &*(param as *const EventLog) };
    log.lock().unwrap().push((msg.status, msg.data.to_vec(), msg.len));
}

fn entries(log: &EventLog) -> Vec<(SerialStatus, Vec<u8>, usize)> {
    log.lock().unwrap().clone()
}

#[test]
fn echo_round_trip() {
    init_logger();
    let driver = LoopbackSerial::new();
    driver.set_echo(true);
    let mgr: Manager = SerialManager::new(driver.clone(), FlagWakeup::new());

    let w = mgr.open_write_handle();
    let r = mgr.open_read_handle().unwrap();
    mgr.write_blocking(w, b"hello").unwrap();
    assert_eq!(driver.sent(), b"hello".to_vec());

    let mut out = [0u8; 5];
    let result = mgr.read_blocking(r, &mut out).unwrap();
    assert_eq!(&out, b"hello");
    assert_eq!(
        result,
        ReadResult {
            len: 5,
            overflow: false
        }
    );
}

#[test]
fn interleaved_writers_drain_in_order() {
    init_logger();
    let driver = LoopbackSerial::new_manual();
    let wakeup = FlagWakeup::new();
    let mgr: Manager = SerialManager::new(driver.clone(), wakeup.clone());

    let handles: Vec<_> = (0..3).map(|_| mgr.open_write_handle()).collect();
    let logs: Vec<_> = (0..3).map(|_| new_log()).collect();
    for (h, log) in handles.iter().zip(&logs) {
        mgr.set_write_callback(*h, Some(log_event), log_param(log)).unwrap();
    }

    mgr.write_nonblocking(handles[0], b"aa").unwrap();
    mgr.write_nonblocking(handles[1], b"bb").unwrap();
    mgr.write_nonblocking(handles[2], b"cc").unwrap();
    // Nothing finished yet; only the first transfer is in flight.
    assert!(driver.sent().is_empty());

    for _ in 0..3 {
        driver.complete_tx();
        mgr.isr();
        if wakeup.take() {
            mgr.process();
        }
    }

    assert_eq!(driver.sent(), b"aabbcc".to_vec());
    for (log, payload) in logs.iter().zip([&b"aa"[..], b"bb", b"cc"]) {
        assert_eq!(
            entries(log),
            vec![(SerialStatus::Success, payload.to_vec(), payload.len())]
        );
    }
}

#[test]
fn ring_overflow_surfaces_in_delivery() {
    init_logger();
    let driver = LoopbackSerial::new();
    let mgr: Manager = SerialManager::with_options(
        driver.clone(),
        FlagWakeup::new(),
        SerialManagerOptions { ring_capacity: 16 },
    );

    let r = mgr.open_read_handle().unwrap();
    let log = new_log();
    mgr.set_read_callback(r, Some(log_event), log_param(log)).unwrap();

    // 20 bytes into a ring that holds 15: the oldest five are lost.
    let data: Vec<u8> = (0..20).collect();
    driver.inject_rx(&data);
    mgr.isr();

    mgr.read_nonblocking(r, 10).unwrap();
    assert_eq!(
        entries(log),
        vec![(SerialStatus::RingBufferOverflow, data[5..15].to_vec(), 10)]
    );

    // The loss was reported; the remainder reads back clean.
    let mut rest = [0u8; 10];
    assert_eq!(
        mgr.try_read(r, &mut rest),
        Ok(ReadResult {
            len: 5,
            overflow: false
        })
    );
    assert_eq!(&rest[..5], &data[15..]);
}

#[test]
fn unclaimed_bytes_are_announced() {
    init_logger();
    let driver = LoopbackSerial::new();
    let wakeup = FlagWakeup::new();
    let mgr: Manager = SerialManager::new(driver.clone(), wakeup.clone());

    let r = mgr.open_read_handle().unwrap();
    let log = new_log();
    mgr.set_read_callback(r, Some(log_event), log_param(log)).unwrap();

    driver.inject_rx(b"ping");
    mgr.isr();
    assert!(wakeup.take());
    mgr.process();
    assert_eq!(entries(log), vec![(SerialStatus::DataAvailable, vec![], 4)]);
}

#[test]
fn overflow_before_handle_opens_is_still_reported() {
    init_logger();
    let driver = LoopbackSerial::new();
    let mgr: Manager = SerialManager::with_options(
        driver.clone(),
        FlagWakeup::new(),
        SerialManagerOptions { ring_capacity: 16 },
    );

    // 20 bytes arrive while nobody is reading; the oldest five are
    // lost, and the loss must survive until a session shows up.
    let data: Vec<u8> = (0..20).collect();
    driver.inject_rx(&data);
    mgr.isr();

    let r = mgr.open_read_handle().unwrap();
    let log = new_log();
    mgr.set_read_callback(r, Some(log_event), log_param(log)).unwrap();
    mgr.read_nonblocking(r, 10).unwrap();
    assert_eq!(
        entries(log),
        vec![(SerialStatus::RingBufferOverflow, data[5..15].to_vec(), 10)]
    );
}

#[test]
fn cancel_of_parked_blocking_read_is_busy() {
    init_logger();
    let driver = LoopbackSerial::new();
    let mgr: &'static Manager =
        Box::leak(Box::new(SerialManager::new(driver.clone(), FlagWakeup::new())));
    let r = mgr.open_read_handle().unwrap();

    let tx_side = driver.clone();
    let canceler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let outcome = mgr.cancel_reading(r);
        tx_side.inject_rx(b"done");
        outcome
    });

    let mut out = [0u8; 4];
    let result = mgr.read_blocking(r, &mut out).unwrap();
    // The cancel bounced off the parked call and the read completed.
    assert_eq!(canceler.join().unwrap(), Err(SerialError::Busy));
    assert_eq!(&out, b"done");
    assert_eq!(result.len, 4);
}

#[test]
fn cancel_of_parked_blocking_write_is_busy() {
    init_logger();
    let driver = LoopbackSerial::new_manual();
    let mgr: &'static Manager =
        Box::leak(Box::new(SerialManager::new(driver.clone(), FlagWakeup::new())));
    let w = mgr.open_write_handle();

    let tx_side = driver.clone();
    let canceler = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let outcome = mgr.cancel_writing(w);
        tx_side.complete_tx();
        outcome
    });

    mgr.write_blocking(w, b"held").unwrap();
    assert_eq!(canceler.join().unwrap(), Err(SerialError::Busy));
    assert_eq!(driver.sent(), b"held".to_vec());
}

#[test]
fn blocking_read_waits_for_late_arrival() {
    init_logger();
    let driver = LoopbackSerial::new();
    let mgr: Manager = SerialManager::new(driver.clone(), FlagWakeup::new());
    let r = mgr.open_read_handle().unwrap();

    let tx_side = driver.clone();
    let injector = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        tx_side.inject_rx(b"late");
    });

    let mut out = [0u8; 4];
    let result = mgr.read_blocking(r, &mut out).unwrap();
    injector.join().unwrap();
    assert_eq!(&out, b"late");
    assert_eq!(result.len, 4);
}
