//! Interfaces binding the managers to the hardware underneath them
//! and to the execution environment around them.
//!
//! The managers never touch hardware directly; a port supplies one
//! implementor of [`PortTimer`] or [`SerialDriver`] per peripheral
//! instance. [`PortWakeup`] is the outbound signal in the other
//! direction: it tells the environment that deferred work is pending
//! and a call to `process` is due.

/// The largest number of inbound bytes a [`SerialDriver`] may deliver
/// per [`poll`](SerialDriver::poll) call.
pub const RX_CHUNK: usize = 64;

/// A single down-counting hardware timer.
///
/// `update_timeout`, `enable`, and `disable` each restart the
/// measurement window: `elapsed` reports the time since whichever of
/// them ran last.
pub trait PortTimer {
    /// Start the counter.
    fn enable(&self);

    /// Stop the counter.
    fn disable(&self);

    /// Program the counter to fire in `timeout` microseconds.
    fn update_timeout(&self, timeout: u32);

    /// Microseconds elapsed since the measurement window started.
    fn elapsed(&self) -> u32;

    /// The longest timeout the counter can be programmed with, in
    /// microseconds.
    fn max_timeout(&self) -> u32;
}

/// Signal to the environment that a manager has deferred work pending.
///
/// Called from interrupt context; must be non-blocking. The
/// environment reacts by scheduling a call to the manager's `process`
/// method from task context.
pub trait PortWakeup {
    fn wake(&self);
}

/// For environments that poll `process` unconditionally.
impl PortWakeup for () {
    fn wake(&self) {}
}

impl<T: PortWakeup> PortWakeup for &'_ T {
    fn wake(&self) {
        (**self).wake()
    }
}

/// Opaque hardware-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverError;

/// A completion event reported by [`SerialDriver::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialEvent {
    /// The outbound transfer finished or was aborted.
    TxDone {
        /// Bytes actually sent.
        len: usize,
        canceled: bool,
    },
    /// `len` inbound bytes were stored into the buffer given to
    /// `poll`.
    RxData { len: usize },
}

/// A byte-oriented peripheral with at most one outbound transfer in
/// flight.
pub trait SerialDriver {
    /// Begin sending `bytes`. The driver must keep whatever state it
    /// needs; completion is reported through [`poll`](Self::poll).
    fn start_write(&mut self, bytes: &[u8]) -> Result<(), DriverError>;

    /// Abort the in-flight transfer, if any. Returns the number of
    /// bytes already sent, or `None` if no transfer could be aborted
    /// (it may have just completed; its `TxDone` is still delivered).
    fn cancel_write(&mut self) -> Option<usize>;

    /// Hint that the manager can accept up to `max` inbound bytes.
    /// Drivers that push data unprompted can ignore this.
    fn request_read(&mut self, max: usize) {
        let _ = max;
    }

    /// Retrieve the next pending completion event. Inbound bytes are
    /// stored into `rx`, which is at least [`RX_CHUNK`] long.
    fn poll(&mut self, rx: &mut [u8]) -> Option<SerialEvent>;

    /// Release the hardware. No calls follow.
    fn deinit(&mut self) {}
}
