//! Simulated peripherals for running [`perimux`] in a hosted
//! environment.
//!
//! Nothing here talks to real hardware. [`VirtualTimer`] is a manually
//! advanced clock, [`LoopbackSerial`] a scripted serial interface, and
//! [`FlagWakeup`] a wakeup line that can be inspected. All three are
//! cheaply cloneable handles to shared state, so a test can keep one
//! clone for itself while the manager owns the other.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use perimux::{DriverError, PortTimer, PortWakeup, SerialDriver, SerialEvent};
use spin::Mutex;

/// Install a logger printing to stderr, controlled by `RUST_LOG`.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The outcome of [`VirtualTimer::step_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The programmed deadline was hit; the interrupt handler should
    /// run before stepping further.
    Fired,
    /// The target time was reached without an interrupt.
    Reached,
}

#[derive(Debug)]
struct VtState {
    now: u64,
    /// Start of the current measurement window.
    basis: u64,
    deadline: Option<u64>,
    enabled: bool,
    max_timeout: u32,
}

/// A manually advanced microsecond clock implementing [`PortTimer`].
#[derive(Debug, Clone)]
pub struct VirtualTimer(Arc<Mutex<VtState>>);

impl VirtualTimer {
    pub fn new() -> Self {
        Self::with_max_timeout(u32::MAX)
    }

    /// Simulate a counter that cannot be programmed beyond
    /// `max_timeout` microseconds.
    pub fn with_max_timeout(max_timeout: u32) -> Self {
        Self(Arc::new(Mutex::new(VtState {
            now: 0,
            basis: 0,
            deadline: None,
            enabled: false,
            max_timeout,
        })))
    }

    /// The current simulated time in microseconds.
    pub fn now(&self) -> u64 {
        self.0.lock().now
    }

    /// Advance time towards `target`, stopping at the programmed
    /// deadline if it comes first. Call in a loop, running the
    /// manager's `isr` and `process` after every [`Step::Fired`].
    pub fn step_to(&self, target: u64) -> Step {
        let mut st = self.0.lock();
        match st.deadline {
            Some(deadline) if st.enabled && deadline <= target => {
                st.now = st.now.max(deadline);
                st.deadline = None;
                log::trace!("virtual timer fired at {}us", st.now);
                Step::Fired
            }
            _ => {
                st.now = st.now.max(target);
                Step::Reached
            }
        }
    }
}

impl Default for VirtualTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PortTimer for VirtualTimer {
    fn enable(&self) {
        let mut st = self.0.lock();
        st.enabled = true;
        st.basis = st.now;
    }

    fn disable(&self) {
        let mut st = self.0.lock();
        st.enabled = false;
        st.deadline = None;
        st.basis = st.now;
    }

    fn update_timeout(&self, timeout: u32) {
        let mut st = self.0.lock();
        let timeout = timeout.min(st.max_timeout);
        st.basis = st.now;
        st.deadline = Some(st.now + timeout as u64);
    }

    fn elapsed(&self) -> u32 {
        let mut st = self.0.lock();
        let elapsed = st.now - st.basis;
        st.basis = st.now;
        elapsed as u32
    }

    fn max_timeout(&self) -> u32 {
        self.0.lock().max_timeout
    }
}

#[derive(Debug, Default)]
struct LoopState {
    in_flight: Option<Vec<u8>>,
    /// Completes the in-flight transfer on the next `poll` without an
    /// explicit [`LoopbackSerial::complete_tx`] call.
    auto_complete: bool,
    complete_pending: bool,
    sent: Vec<u8>,
    rx_queue: VecDeque<u8>,
    /// Completed transmissions loop back into the receive queue.
    echo: bool,
}

/// A scripted serial interface implementing [`SerialDriver`].
///
/// Transmissions sit in flight until completed (immediately in
/// auto-complete mode, or when the test decides in manual mode)
/// and their bytes are recorded. Inbound traffic is injected with
/// [`inject_rx`](Self::inject_rx).
#[derive(Debug, Clone, Default)]
pub struct LoopbackSerial(Arc<Mutex<LoopState>>);

impl LoopbackSerial {
    /// A driver that completes every transmission on the next `poll`.
    pub fn new() -> Self {
        let this = Self::default();
        this.0.lock().auto_complete = true;
        this
    }

    /// A driver whose transmissions only complete when
    /// [`complete_tx`](Self::complete_tx) is called.
    pub fn new_manual() -> Self {
        Self::default()
    }

    /// Feed completed transmissions back into the receive side.
    pub fn set_echo(&self, echo: bool) {
        self.0.lock().echo = echo;
    }

    /// Let the in-flight transmission finish on the next `poll`.
    pub fn complete_tx(&self) {
        self.0.lock().complete_pending = true;
    }

    /// Queue inbound bytes for delivery through `poll`.
    pub fn inject_rx(&self, bytes: &[u8]) {
        self.0.lock().rx_queue.extend(bytes.iter().copied());
    }

    /// Every byte sent over the interface so far, in wire order.
    pub fn sent(&self) -> Vec<u8> {
        self.0.lock().sent.clone()
    }
}

impl SerialDriver for LoopbackSerial {
    fn start_write(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        let mut st = self.0.lock();
        if st.in_flight.is_some() {
            // A second transfer while one is in flight is a protocol
            // violation; refuse it so tests notice.
            return Err(DriverError);
        }
        st.in_flight = Some(bytes.to_vec());
        Ok(())
    }

    fn cancel_write(&mut self) -> Option<usize> {
        let mut st = self.0.lock();
        st.in_flight.take().map(|_| 0)
    }

    fn poll(&mut self, rx: &mut [u8]) -> Option<SerialEvent> {
        let mut st = self.0.lock();
        if st.in_flight.is_some() && (st.auto_complete || st.complete_pending) {
            st.complete_pending = false;
            if let Some(bytes) = st.in_flight.take() {
                st.sent.extend_from_slice(&bytes);
                if st.echo {
                    st.rx_queue.extend(bytes.iter().copied());
                }
                return Some(SerialEvent::TxDone {
                    len: bytes.len(),
                    canceled: false,
                });
            }
        }
        if !st.rx_queue.is_empty() {
            let mut len = 0;
            while len < rx.len() {
                match st.rx_queue.pop_front() {
                    Some(b) => {
                        rx[len] = b;
                        len += 1;
                    }
                    None => break,
                }
            }
            return Some(SerialEvent::RxData { len });
        }
        None
    }
}

/// A wakeup line implementing [`PortWakeup`] that tests can inspect.
#[derive(Debug, Clone, Default)]
pub struct FlagWakeup(Arc<AtomicBool>);

impl FlagWakeup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume the signal. Returns whether it was raised.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

impl PortWakeup for FlagWakeup {
    fn wake(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}
