//! Multiplexes one byte-oriented peripheral across any number of
//! write sessions and one read session.
//!
//! Outbound transfers are queued in FIFO order with at most one handed
//! to the hardware at a time. Inbound bytes land in an internal ring
//! buffer, from which read requests are satisfied; when the ring wraps
//! the oldest bytes are dropped and the loss is reported on the next
//! delivery instead of being silently swallowed.
//!
//! Work is split across two contexts, mirroring [`crate::timer`]:
//!
//!  - [`isr`](SerialManager::isr) runs at interrupt priority. It
//!    drains the driver's completion events, advances the queues, and
//!    stores inbound bytes, but never calls back into the application.
//!  - [`process`](SerialManager::process) runs in task context and
//!    delivers completion callbacks with no lock held.
//!
//! Blocking variants of the transfer operations drive `isr`
//! themselves until their transfer completes, so they work even before
//! the environment's event loop is up.
use alloc::vec::Vec;
use core::mem;

use spin::Mutex;

use crate::{
    error::SerialError,
    list::{HasNode, List, ListNode, ListTag},
    port::{PortWakeup, SerialDriver, SerialEvent, RX_CHUNK},
    utils::{pool::Pool, pool::Ptr, ring_buffer::RingBuffer},
};

/// Completion callback. The `usize` is the parameter registered with
/// the callback; the message is only valid for the duration of the
/// call.
pub type SerialCallback = fn(usize, &CallbackMessage<'_>);

/// Describes a completed or notified event to a [`SerialCallback`].
#[derive(Debug)]
pub struct CallbackMessage<'a> {
    /// The bytes involved. Empty for pure notifications.
    pub data: &'a [u8],
    /// The byte count the event is about. For a
    /// [`DataAvailable`](SerialStatus::DataAvailable) notification,
    /// the number of buffered bytes awaiting a read.
    pub len: usize,
    pub status: SerialStatus,
}

/// Outcome reported through a [`SerialCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialStatus {
    Success,
    /// The driver rejected the transfer.
    Error,
    /// The transfer was canceled before it finished.
    Canceled,
    /// Inbound bytes were lost since the last delivery.
    RingBufferOverflow,
    /// Unclaimed inbound bytes are buffered.
    DataAvailable,
}

/// Identifies an open write session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteHandle(Ptr);

/// Identifies the open read session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadHandle(Ptr);

/// The outcome of a read operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResult {
    /// Bytes stored into the caller's buffer.
    pub len: usize,
    /// Inbound bytes were lost to a ring buffer wrap since the last
    /// read.
    pub overflow: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Blocking,
    NonBlocking,
}

/// An outstanding transfer. For writes, `data` holds the bytes to
/// send; for reads, it is the staging area filled from the ring
/// buffer.
#[derive(Debug)]
struct Transfer {
    data: Vec<u8>,
    requested: usize,
    /// Bytes actually transferred, set at completion. Reads track
    /// progress through `data.len()` instead.
    progress: usize,
    mode: Mode,
    status: SerialStatus,
}

/// Session control block.
#[derive(Debug)]
struct SessionCb {
    node: ListNode,
    callback: Option<SerialCallback>,
    param: usize,
    transfer: Option<Transfer>,
    /// Outcome of the last blocking transfer on this session.
    blocking_status: SerialStatus,
}

impl SessionCb {
    fn new() -> Self {
        Self {
            node: ListNode::new(),
            callback: None,
            param: 0,
            transfer: None,
            blocking_status: SerialStatus::Success,
        }
    }
}

impl HasNode for SessionCb {
    fn node(&self) -> &ListNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut ListNode {
        &mut self.node
    }
}

/// Write sessions waiting for the hardware, in submission order. The
/// front element is the one in flight.
const TAG_PENDING: ListTag = ListTag(1);
/// Write sessions whose outcome awaits delivery by `process`.
const TAG_COMPLETED: ListTag = ListTag(2);

#[derive(Debug, Clone, Copy)]
pub struct SerialManagerOptions {
    /// Backing size of the receive ring buffer in bytes. The usable
    /// capacity is one byte less.
    pub ring_capacity: usize,
}

impl Default for SerialManagerOptions {
    fn default() -> Self {
        Self { ring_capacity: 128 }
    }
}

struct State<D> {
    driver: D,
    pool: Pool<SessionCb>,
    pending_writes: List,
    completed_writes: List,
    read_handle: Option<Ptr>,
    open_writes: usize,
    ring: RingBuffer,
    /// Latched until consumed by a read operation.
    overflow: bool,
    /// A `DataAvailable` notification is due.
    rx_notify: bool,
}

/// See the [module documentation](self).
pub struct SerialManager<D: SerialDriver, W: PortWakeup = ()> {
    state: Mutex<State<D>>,
    wakeup: W,
}

impl<D: SerialDriver, W: PortWakeup> SerialManager<D, W> {
    pub fn new(driver: D, wakeup: W) -> Self {
        Self::with_options(driver, wakeup, SerialManagerOptions::default())
    }

    pub fn with_options(driver: D, wakeup: W, options: SerialManagerOptions) -> Self {
        Self {
            state: Mutex::new(State {
                driver,
                pool: Pool::new(),
                pending_writes: List::new(TAG_PENDING),
                completed_writes: List::new(TAG_COMPLETED),
                read_handle: None,
                open_writes: 0,
                ring: RingBuffer::new(options.ring_capacity),
                overflow: false,
                rx_notify: false,
            }),
            wakeup,
        }
    }

    /// Open a write session. Any number can be open at a time.
    pub fn open_write_handle(&self) -> WriteHandle {
        let mut state = self.state.lock();
        let ptr = state.pool.allocate(SessionCb::new());
        state.open_writes += 1;
        WriteHandle(ptr)
    }

    /// Open the read session. The peripheral has a single receive
    /// stream, so at most one can be open; a second attempt fails with
    /// [`SerialError::Busy`].
    pub fn open_read_handle(&self) -> Result<ReadHandle, SerialError> {
        let mut state = self.state.lock();
        if state.read_handle.is_some() {
            return Err(SerialError::Busy);
        }
        let ptr = state.pool.allocate(SessionCb::new());
        state.read_handle = Some(ptr);
        let free = state.ring.free();
        state.driver.request_read(free);
        Ok(ReadHandle(ptr))
    }

    /// Install the completion callback for a write session. `None`
    /// drops completions of non-blocking writes silently.
    pub fn set_write_callback(
        &self,
        handle: WriteHandle,
        callback: Option<SerialCallback>,
        param: usize,
    ) -> Result<(), SerialError> {
        let mut state = self.state.lock();
        let cb = Self::write_cb(&mut state, handle)?;
        cb.callback = callback;
        cb.param = param;
        Ok(())
    }

    /// Install the callback for the read session. It receives
    /// completions of non-blocking reads, cancellations, and
    /// [`DataAvailable`](SerialStatus::DataAvailable) notifications
    /// for buffered bytes no read has claimed.
    pub fn set_read_callback(
        &self,
        handle: ReadHandle,
        callback: Option<SerialCallback>,
        param: usize,
    ) -> Result<(), SerialError> {
        let mut state = self.state.lock();
        let cb = Self::read_cb(&mut state, handle)?;
        cb.callback = callback;
        cb.param = param;
        Ok(())
    }

    /// Queue `bytes` for transmission and return immediately. The
    /// outcome is reported through the session's callback once the
    /// transfer leaves the hardware, including transfers the driver
    /// refused to start.
    pub fn write_nonblocking(&self, handle: WriteHandle, bytes: &[u8]) -> Result<(), SerialError> {
        self.submit_write(handle, bytes, Mode::NonBlocking)
    }

    /// Queue `bytes` for transmission and wait for the hardware to
    /// finish sending them. Drives [`isr`](Self::isr) while waiting.
    pub fn write_blocking(&self, handle: WriteHandle, bytes: &[u8]) -> Result<(), SerialError> {
        self.submit_write(handle, bytes, Mode::Blocking)?;
        if bytes.is_empty() {
            return Ok(());
        }
        loop {
            {
                let mut state = self.state.lock();
                let cb = Self::write_cb(&mut state, handle)?;
                if cb.transfer.is_none() {
                    return match cb.blocking_status {
                        SerialStatus::Success => Ok(()),
                        _ => Err(SerialError::Driver),
                    };
                }
            }
            self.isr();
            core::hint::spin_loop();
        }
    }

    /// Receive exactly `out.len()` bytes, waiting for them to arrive.
    /// Drives [`isr`](Self::isr) while waiting.
    pub fn read_blocking(
        &self,
        handle: ReadHandle,
        out: &mut [u8],
    ) -> Result<ReadResult, SerialError> {
        if out.is_empty() {
            let mut state = self.state.lock();
            Self::read_cb(&mut state, handle)?;
            return Ok(ReadResult {
                len: 0,
                overflow: false,
            });
        }
        self.submit_read(handle, out.len(), Mode::Blocking)?;
        loop {
            {
                let mut state = self.state.lock();
                let cb = Self::read_cb(&mut state, handle)?;
                let filled = cb
                    .transfer
                    .as_ref()
                    .map_or(false, |t| t.data.len() >= t.requested);
                if filled {
                    let t = cb.transfer.take();
                    if let Some(t) = t {
                        out[..t.data.len()].copy_from_slice(&t.data);
                        let overflow = mem::replace(&mut state.overflow, false);
                        return Ok(ReadResult {
                            len: t.data.len(),
                            overflow,
                        });
                    }
                }
            }
            self.isr();
            core::hint::spin_loop();
        }
    }

    /// Request `len` inbound bytes. The session callback is invoked
    /// once they have arrived, immediately from this call if the ring
    /// buffer already holds enough.
    pub fn read_nonblocking(&self, handle: ReadHandle, len: usize) -> Result<(), SerialError> {
        if len == 0 {
            let mut state = self.state.lock();
            Self::read_cb(&mut state, handle)?;
            return Ok(());
        }
        self.submit_read(handle, len, Mode::NonBlocking)?;
        self.complete_read();
        Ok(())
    }

    /// Drain whatever the ring buffer holds, up to `out.len()` bytes,
    /// without waiting.
    pub fn try_read(&self, handle: ReadHandle, out: &mut [u8]) -> Result<ReadResult, SerialError> {
        let mut state = self.state.lock();
        if Self::read_cb(&mut state, handle)?.transfer.is_some() {
            return Err(SerialError::Busy);
        }
        let len = state.ring.read(out);
        let overflow = mem::replace(&mut state.overflow, false);
        if state.ring.is_empty() {
            state.rx_notify = false;
        }
        let free = state.ring.free();
        state.driver.request_read(free);
        Ok(ReadResult { len, overflow })
    }

    /// Cancel the session's queued write, if any. A transfer the
    /// hardware already finished is left alone; canceling a blocking
    /// write fails with [`SerialError::Busy`].
    ///
    /// A canceled non-blocking write is reported through the callback
    /// with [`SerialStatus::Canceled`].
    pub fn cancel_writing(&self, handle: WriteHandle) -> Result<(), SerialError> {
        let mut need_wake = false;
        {
            let mut state = self.state.lock();
            let mode = match Self::write_cb(&mut state, handle)?.transfer.as_ref() {
                Some(t) => t.mode,
                None => return Ok(()),
            };
            if mode == Mode::Blocking {
                return Err(SerialError::Busy);
            }
            if state.pending_writes.front() == Some(handle.0) {
                // In flight. If the driver reports the transfer as
                // already finished, its TxDone is still on the way and
                // there is nothing to cancel.
                if let Some(sent) = state.driver.cancel_write() {
                    need_wake |= Self::tx_done(&mut state, sent, true);
                }
            } else if state.pending_writes.contains(&state.pool, handle.0) {
                let State {
                    pool,
                    pending_writes,
                    completed_writes,
                    ..
                } = &mut *state;
                let _ = pending_writes.accessor(pool).remove(handle.0);
                if let Some(t) = pool[handle.0].transfer.as_mut() {
                    t.progress = 0;
                    t.status = SerialStatus::Canceled;
                }
                let r = completed_writes.accessor(pool).push_back(handle.0);
                debug_assert!(r.is_ok());
                need_wake = true;
            }
            // Otherwise the transfer already completed and awaits
            // delivery by `process`.
        }
        if need_wake {
            self.wakeup.wake();
        }
        Ok(())
    }

    /// Cancel the outstanding non-blocking read, if any. Bytes staged
    /// so far are delivered through the callback with
    /// [`SerialStatus::Canceled`]. Canceling a blocking read fails
    /// with [`SerialError::Busy`].
    pub fn cancel_reading(&self, handle: ReadHandle) -> Result<(), SerialError> {
        let fire = {
            let mut state = self.state.lock();
            let cb = Self::read_cb(&mut state, handle)?;
            match cb.transfer.as_ref() {
                None => return Ok(()),
                Some(t) if t.mode == Mode::Blocking => return Err(SerialError::Busy),
                Some(_) => {}
            }
            let t = cb.transfer.take();
            t.map(|t| (cb.callback, cb.param, t))
        };
        if let Some((Some(callback), param, t)) = fire {
            callback(
                param,
                &CallbackMessage {
                    data: &t.data,
                    len: t.data.len(),
                    status: SerialStatus::Canceled,
                },
            );
        }
        Ok(())
    }

    /// Close a write session, canceling its queued transfer. Fails
    /// with [`SerialError::Busy`] while a transfer is in the hands of
    /// the hardware.
    pub fn close_write_handle(&self, handle: WriteHandle) -> Result<(), SerialError> {
        self.cancel_writing(handle)?;
        let mut state = self.state.lock();
        let has_transfer = Self::write_cb(&mut state, handle)?.transfer.is_some();
        if has_transfer && state.pending_writes.front() == Some(handle.0) {
            return Err(SerialError::Busy);
        }
        {
            let State {
                pool,
                pending_writes,
                completed_writes,
                ..
            } = &mut *state;
            let _ = pending_writes.accessor(pool).remove(handle.0);
            let _ = completed_writes.accessor(pool).remove(handle.0);
        }
        state.pool.deallocate(handle.0);
        state.open_writes -= 1;
        Ok(())
    }

    /// Close the read session, canceling its outstanding read. Bytes
    /// left in the ring buffer are kept for a future session.
    pub fn close_read_handle(&self, handle: ReadHandle) -> Result<(), SerialError> {
        self.cancel_reading(handle)?;
        let mut state = self.state.lock();
        if state.read_handle != Some(handle.0) {
            return Err(SerialError::HandleConflict);
        }
        state.read_handle = None;
        state.rx_notify = false;
        state.pool.deallocate(handle.0);
        Ok(())
    }

    /// Release the underlying driver. Fails with
    /// [`SerialError::Busy`] while any session is open. The manager
    /// must not be used afterwards.
    pub fn deinit(&self) -> Result<(), SerialError> {
        let mut state = self.state.lock();
        if state.read_handle.is_some() || state.open_writes != 0 {
            return Err(SerialError::Busy);
        }
        state.driver.deinit();
        Ok(())
    }

    /// The peripheral interrupt handler.
    ///
    /// Drains the driver's completion events: finished writes advance
    /// the queue and the next one is handed to the hardware, inbound
    /// bytes are stored. Callbacks are never invoked from here;
    /// delivery is requested through the wakeup signal.
    pub fn isr(&self) {
        let mut need_wake = false;
        loop {
            let mut rx = [0u8; RX_CHUNK];
            let mut state = self.state.lock();
            match state.driver.poll(&mut rx) {
                None => break,
                Some(SerialEvent::TxDone { len, canceled }) => {
                    need_wake |= Self::tx_done(&mut state, len, canceled);
                }
                Some(SerialEvent::RxData { len }) => {
                    need_wake |= Self::ingest(&mut state, &rx[..len.min(RX_CHUNK)]);
                }
            }
        }
        if need_wake {
            self.wakeup.wake();
        }
    }

    /// Deliver pending completion callbacks.
    ///
    /// Must be called from task context after the wakeup signal (or
    /// periodically in polled environments). Callbacks run with no
    /// internal lock held, so they may freely call back into the
    /// manager.
    pub fn process(&self) {
        // Outcomes of non-blocking writes, oldest first.
        loop {
            let mut state = self.state.lock();
            let head = {
                let State {
                    pool,
                    completed_writes,
                    ..
                } = &mut *state;
                completed_writes.accessor(pool).pop_front()
            };
            let head = match head {
                Some(head) => head,
                None => break,
            };
            let cb = &mut state.pool[head];
            let t = cb.transfer.take();
            let (callback, param) = (cb.callback, cb.param);
            drop(state);
            if let (Some(callback), Some(t)) = (callback, t) {
                callback(
                    param,
                    &CallbackMessage {
                        data: &t.data[..t.progress.min(t.data.len())],
                        len: t.progress,
                        status: t.status,
                    },
                );
            }
        }

        self.complete_read();

        // Buffered bytes no read has claimed.
        let fire = {
            let mut state = self.state.lock();
            if !state.rx_notify {
                None
            } else {
                state.rx_notify = false;
                match state.read_handle.and_then(|rp| state.pool.get(rp)) {
                    Some(cb) if cb.transfer.is_none() && !state.ring.is_empty() => cb
                        .callback
                        .map(|callback| (callback, cb.param, state.ring.len(), state.overflow)),
                    _ => None,
                }
            }
        };
        if let Some((callback, param, len, overflow)) = fire {
            let status = if overflow {
                SerialStatus::RingBufferOverflow
            } else {
                SerialStatus::DataAvailable
            };
            callback(
                param,
                &CallbackMessage {
                    data: &[],
                    len,
                    status,
                },
            );
        }
    }

    fn write_cb<'a>(
        state: &'a mut State<D>,
        handle: WriteHandle,
    ) -> Result<&'a mut SessionCb, SerialError> {
        if state.read_handle == Some(handle.0) {
            return Err(SerialError::HandleConflict);
        }
        state
            .pool
            .get_mut(handle.0)
            .ok_or(SerialError::HandleConflict)
    }

    fn read_cb<'a>(
        state: &'a mut State<D>,
        handle: ReadHandle,
    ) -> Result<&'a mut SessionCb, SerialError> {
        if state.read_handle != Some(handle.0) {
            return Err(SerialError::HandleConflict);
        }
        state
            .pool
            .get_mut(handle.0)
            .ok_or(SerialError::HandleConflict)
    }

    fn submit_write(
        &self,
        handle: WriteHandle,
        bytes: &[u8],
        mode: Mode,
    ) -> Result<(), SerialError> {
        let mut need_wake = false;
        {
            let mut state = self.state.lock();
            let cb = Self::write_cb(&mut state, handle)?;
            if bytes.is_empty() {
                return Ok(());
            }
            if cb.transfer.is_some() {
                return Err(SerialError::Busy);
            }
            cb.blocking_status = SerialStatus::Success;
            cb.transfer = Some(Transfer {
                data: bytes.to_vec(),
                requested: bytes.len(),
                progress: 0,
                mode,
                status: SerialStatus::Success,
            });
            let was_idle = state.pending_writes.is_empty();
            {
                let State {
                    pool,
                    pending_writes,
                    ..
                } = &mut *state;
                if pending_writes.accessor(pool).push_back(handle.0).is_err() {
                    pool[handle.0].transfer = None;
                    return Err(SerialError::Busy);
                }
            }
            log::trace!("queued {} byte write on {:?}", bytes.len(), handle);
            if was_idle {
                need_wake |= Self::start_next_write(&mut state);
            }
        }
        if need_wake {
            self.wakeup.wake();
        }
        Ok(())
    }

    fn submit_read(&self, handle: ReadHandle, len: usize, mode: Mode) -> Result<(), SerialError> {
        let mut state = self.state.lock();
        if Self::read_cb(&mut state, handle)?.transfer.is_some() {
            return Err(SerialError::Busy);
        }
        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            match state.ring.pop() {
                Some(b) => data.push(b),
                None => break,
            }
        }
        if state.ring.is_empty() {
            state.rx_notify = false;
        }
        let cb = &mut state.pool[handle.0];
        cb.transfer = Some(Transfer {
            data,
            requested: len,
            progress: 0,
            mode,
            status: SerialStatus::Success,
        });
        let free = state.ring.free();
        state.driver.request_read(free);
        Ok(())
    }

    /// Hand the front of the write queue to the hardware. Transfers
    /// the driver refuses are failed over to the completed queue and
    /// the next one is tried. Returns `true` if a completion delivery
    /// is due.
    fn start_next_write(state: &mut State<D>) -> bool {
        let mut need_wake = false;
        loop {
            let head = match state.pending_writes.front() {
                Some(head) => head,
                None => return need_wake,
            };
            let started = {
                let State { driver, pool, .. } = &mut *state;
                match pool[head].transfer.as_ref() {
                    Some(t) => driver.start_write(&t.data).is_ok(),
                    None => false,
                }
            };
            if started {
                return need_wake;
            }
            log::warn!("serial driver refused a write, failing the transfer");
            {
                let State {
                    pool,
                    pending_writes,
                    ..
                } = &mut *state;
                let _ = pending_writes.accessor(pool).remove(head);
            }
            need_wake |= Self::finish_write(state, head, 0, SerialStatus::Error);
        }
    }

    /// A completion event for the in-flight transfer arrived.
    fn tx_done(state: &mut State<D>, len: usize, canceled: bool) -> bool {
        let head = {
            let State {
                pool,
                pending_writes,
                ..
            } = &mut *state;
            pending_writes.accessor(pool).pop_front()
        };
        let head = match head {
            Some(head) => head,
            // Spurious event; nothing was in flight.
            None => return false,
        };
        let mut need_wake = Self::start_next_write(state);
        let status = if canceled {
            SerialStatus::Canceled
        } else {
            SerialStatus::Success
        };
        need_wake |= Self::finish_write(state, head, len, status);
        need_wake
    }

    /// Record a write session's outcome. Blocking transfers are
    /// resolved in place for their pump loop to pick up; non-blocking
    /// ones move to the completed queue for `process`.
    fn finish_write(state: &mut State<D>, ptr: Ptr, len: usize, status: SerialStatus) -> bool {
        let cb = match state.pool.get_mut(ptr) {
            Some(cb) => cb,
            None => return false,
        };
        let mode = cb.transfer.as_ref().map(|t| t.mode);
        match mode {
            Some(Mode::Blocking) => {
                cb.blocking_status = status;
                cb.transfer = None;
                false
            }
            Some(Mode::NonBlocking) => {
                if let Some(t) = cb.transfer.as_mut() {
                    t.progress = len;
                    t.status = status;
                }
                let State {
                    pool,
                    completed_writes,
                    ..
                } = &mut *state;
                let r = completed_writes.accessor(pool).push_back(ptr);
                debug_assert!(r.is_ok());
                true
            }
            None => false,
        }
    }

    /// Store inbound bytes, topping up the outstanding read first.
    fn ingest(state: &mut State<D>, bytes: &[u8]) -> bool {
        let dropped = state.ring.write(bytes);
        if dropped > 0 {
            state.overflow = true;
            log::debug!("serial rx ring wrapped, {} bytes dropped", dropped);
        }
        let mut need_wake = false;
        if let Some(rp) = state.read_handle {
            let State { pool, ring, .. } = &mut *state;
            if let Some(cb) = pool.get_mut(rp) {
                if let Some(t) = cb.transfer.as_mut() {
                    while t.data.len() < t.requested {
                        match ring.pop() {
                            Some(b) => t.data.push(b),
                            None => break,
                        }
                    }
                    if t.data.len() >= t.requested {
                        need_wake = true;
                    }
                }
            }
        }
        if !state.ring.is_empty() && state.read_handle.is_some() {
            state.rx_notify = true;
            need_wake = true;
        }
        let free = state.ring.free();
        state.driver.request_read(free);
        need_wake
    }

    /// Deliver the outstanding non-blocking read if its staging buffer
    /// is full.
    fn complete_read(&self) {
        let fire = {
            let mut state = self.state.lock();
            let rp = match state.read_handle {
                Some(rp) => rp,
                None => return,
            };
            let filled = state
                .pool
                .get(rp)
                .and_then(|cb| cb.transfer.as_ref())
                .map_or(false, |t| {
                    t.mode == Mode::NonBlocking && t.data.len() >= t.requested
                });
            if !filled {
                None
            } else {
                let overflow = mem::replace(&mut state.overflow, false);
                let cb = &mut state.pool[rp];
                let t = cb.transfer.take();
                t.map(|t| (cb.callback, cb.param, t, overflow))
            }
        };
        if let Some((Some(callback), param, t, overflow)) = fire {
            let status = if overflow {
                SerialStatus::RingBufferOverflow
            } else {
                SerialStatus::Success
            };
            callback(
                param,
                &CallbackMessage {
                    data: &t.data,
                    len: t.data.len(),
                    status,
                },
            );
        }
    }
}

impl<D: SerialDriver, W: PortWakeup> Drop for SerialManager<D, W> {
    fn drop(&mut self) {
        self.state.get_mut().driver.deinit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::DriverError;
    use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec, vec::Vec};

    #[derive(Default)]
    struct StubState {
        started: Vec<Vec<u8>>,
        in_flight: Option<usize>,
        rx_queue: VecDeque<Vec<u8>>,
        complete_on_poll: bool,
        fail_start: bool,
        requested_read: usize,
    }

    /// A scripted driver. Cloning shares the state, letting tests
    /// inject events while the manager owns the other handle.
    #[derive(Clone, Default)]
    struct StubDriver(Arc<Mutex<StubState>>);

    impl StubDriver {
        fn complete_tx(&self) {
            let mut st = self.0.lock();
            st.complete_on_poll = true;
        }

        fn inject_rx(&self, bytes: &[u8]) {
            self.0.lock().rx_queue.push_back(bytes.to_vec());
        }

        fn started(&self) -> Vec<Vec<u8>> {
            self.0.lock().started.clone()
        }
    }

    impl SerialDriver for StubDriver {
        fn start_write(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
            let mut st = self.0.lock();
            if st.fail_start {
                return Err(DriverError);
            }
            st.started.push(bytes.to_vec());
            st.in_flight = Some(bytes.len());
            Ok(())
        }

        fn cancel_write(&mut self) -> Option<usize> {
            self.0.lock().in_flight.take().map(|_| 0)
        }

        fn request_read(&mut self, max: usize) {
            self.0.lock().requested_read = max;
        }

        fn poll(&mut self, rx: &mut [u8]) -> Option<SerialEvent> {
            let mut st = self.0.lock();
            if st.complete_on_poll {
                if let Some(len) = st.in_flight.take() {
                    st.complete_on_poll = false;
                    return Some(SerialEvent::TxDone {
                        len,
                        canceled: false,
                    });
                }
                st.complete_on_poll = false;
            }
            if let Some(data) = st.rx_queue.pop_front() {
                let n = data.len().min(rx.len());
                rx[..n].copy_from_slice(&data[..n]);
                // Anything beyond the chunk size goes back to the
                // front of the queue.
                if n < data.len() {
                    st.rx_queue.push_front(data[n..].to_vec());
                }
                return Some(SerialEvent::RxData { len: n });
            }
            None
        }
    }

    /// Per-test callback journal. The registered `param` carries the
    /// journal's address, the way a production callback carries its
    /// context.
    type EventLog = Mutex<Vec<(SerialStatus, Vec<u8>, usize)>>;

    fn new_log() -> &'static EventLog {
        Box::leak(Box::new(Mutex::new(Vec::new())))
    }

    fn log_event(param: usize, msg: &CallbackMessage<'_>) {
        let log = unsafe { &*(param as *const EventLog) };
        log.lock().push((msg.status, msg.data.to_vec(), msg.len));
    }

    fn log_param(log: &'static EventLog) -> usize {
        log as *const EventLog as usize
    }

    fn entries(log: &EventLog) -> Vec<(SerialStatus, Vec<u8>, usize)> {
        log.lock().clone()
    }

    fn new_mgr() -> (SerialManager<StubDriver>, StubDriver) {
        let _ = env_logger::builder().is_test(true).try_init();
        let driver = StubDriver::default();
        let mgr = SerialManager::with_options(
            driver.clone(),
            (),
            SerialManagerOptions { ring_capacity: 16 },
        );
        (mgr, driver)
    }

    #[test]
    fn writes_are_fifo_with_one_in_flight() {
        let (mgr, driver) = new_mgr();
        let h1 = mgr.open_write_handle();
        let h2 = mgr.open_write_handle();
        let (log1, log2) = (new_log(), new_log());
        mgr.set_write_callback(h1, Some(log_event), log_param(log1))
            .unwrap();
        mgr.set_write_callback(h2, Some(log_event), log_param(log2))
            .unwrap();

        mgr.write_nonblocking(h1, b"first").unwrap();
        mgr.write_nonblocking(h2, b"second").unwrap();
        assert_eq!(driver.started(), vec![b"first".to_vec()]);

        driver.complete_tx();
        mgr.isr();
        mgr.process();
        assert_eq!(
            driver.started(),
            vec![b"first".to_vec(), b"second".to_vec()]
        );
        assert_eq!(
            entries(log1),
            vec![(SerialStatus::Success, b"first".to_vec(), 5)]
        );
        assert!(entries(log2).is_empty());

        driver.complete_tx();
        mgr.isr();
        mgr.process();
        assert_eq!(
            entries(log2),
            vec![(SerialStatus::Success, b"second".to_vec(), 6)]
        );
    }

    #[test]
    fn second_write_on_same_handle_is_busy() {
        let (mgr, _driver) = new_mgr();
        let h = mgr.open_write_handle();
        mgr.write_nonblocking(h, b"one").unwrap();
        assert_eq!(mgr.write_nonblocking(h, b"two"), Err(SerialError::Busy));
    }

    #[test]
    fn blocking_write_pumps_to_completion() {
        let (mgr, driver) = new_mgr();
        let h = mgr.open_write_handle();
        driver.complete_tx();
        mgr.write_blocking(h, b"hello").unwrap();
        assert_eq!(driver.started(), vec![b"hello".to_vec()]);
        // The session is reusable immediately.
        driver.complete_tx();
        mgr.write_blocking(h, b"again").unwrap();
    }

    #[test]
    fn refused_write_reports_error() {
        let (mgr, driver) = new_mgr();
        driver.0.lock().fail_start = true;
        let h = mgr.open_write_handle();
        let log = new_log();
        mgr.set_write_callback(h, Some(log_event), log_param(log))
            .unwrap();
        mgr.write_nonblocking(h, b"doomed").unwrap();
        mgr.process();
        assert_eq!(entries(log), vec![(SerialStatus::Error, vec![], 0)]);
    }

    #[test]
    fn cancel_queued_write() {
        let (mgr, driver) = new_mgr();
        let h1 = mgr.open_write_handle();
        let h2 = mgr.open_write_handle();
        let log = new_log();
        mgr.set_write_callback(h2, Some(log_event), log_param(log))
            .unwrap();

        mgr.write_nonblocking(h1, b"front").unwrap();
        mgr.write_nonblocking(h2, b"queued").unwrap();
        // `h2` never reached the hardware; removal is immediate.
        mgr.cancel_writing(h2).unwrap();
        mgr.process();
        assert_eq!(entries(log), vec![(SerialStatus::Canceled, vec![], 0)]);
        assert_eq!(driver.started(), vec![b"front".to_vec()]);

        // Canceling a session with no transfer is a no-op.
        mgr.cancel_writing(h2).unwrap();
    }

    #[test]
    fn cancel_in_flight_write() {
        let (mgr, driver) = new_mgr();
        let h1 = mgr.open_write_handle();
        let h2 = mgr.open_write_handle();
        let log = new_log();
        mgr.set_write_callback(h1, Some(log_event), log_param(log))
            .unwrap();

        mgr.write_nonblocking(h1, b"front").unwrap();
        mgr.write_nonblocking(h2, b"queued").unwrap();
        mgr.cancel_writing(h1).unwrap();
        mgr.process();
        assert_eq!(entries(log), vec![(SerialStatus::Canceled, vec![], 0)]);
        // The queue moved on.
        assert_eq!(
            driver.started(),
            vec![b"front".to_vec(), b"queued".to_vec()]
        );
    }

    #[test]
    fn read_handle_is_exclusive() {
        let (mgr, _driver) = new_mgr();
        let r = mgr.open_read_handle().unwrap();
        assert_eq!(mgr.open_read_handle().err(), Some(SerialError::Busy));
        mgr.close_read_handle(r).unwrap();
        mgr.open_read_handle().unwrap();
    }

    #[test]
    fn try_read_drains_ring() {
        let (mgr, driver) = new_mgr();
        let r = mgr.open_read_handle().unwrap();
        driver.inject_rx(b"abcdef");
        mgr.isr();

        let mut out = [0u8; 4];
        assert_eq!(
            mgr.try_read(r, &mut out),
            Ok(ReadResult {
                len: 4,
                overflow: false
            })
        );
        assert_eq!(&out, b"abcd");
        assert_eq!(
            mgr.try_read(r, &mut out),
            Ok(ReadResult {
                len: 2,
                overflow: false
            })
        );
        assert_eq!(&out[..2], b"ef");
    }

    #[test]
    fn overflow_is_latched_and_reported_once() {
        let (mgr, driver) = new_mgr();
        let r = mgr.open_read_handle().unwrap();
        // Capacity 16 holds 15 bytes; 20 arrive.
        let data: Vec<u8> = (0..20).collect();
        driver.inject_rx(&data);
        mgr.isr();

        let mut out = [0u8; 10];
        assert_eq!(
            mgr.try_read(r, &mut out),
            Ok(ReadResult {
                len: 10,
                overflow: true
            })
        );
        // The oldest surviving bytes are delivered.
        assert_eq!(&out, &data[5..15]);
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
    fn nonblocking_read_completes_from_ring() {
        let (mgr, driver) = new_mgr();
        let r = mgr.open_read_handle().unwrap();
        let log = new_log();
        mgr.set_read_callback(r, Some(log_event), log_param(log))
            .unwrap();

        driver.inject_rx(b"xyz");
        mgr.isr();
        mgr.process();
        // The unclaimed bytes were announced.
        assert_eq!(entries(log), vec![(SerialStatus::DataAvailable, vec![], 3)]);

        log.lock().clear();
        mgr.read_nonblocking(r, 3).unwrap();
        assert_eq!(entries(log), vec![(SerialStatus::Success, b"xyz".to_vec(), 3)]);
    }

    #[test]
    fn nonblocking_read_waits_for_arrival() {
        let (mgr, driver) = new_mgr();
        let r = mgr.open_read_handle().unwrap();
        let log = new_log();
        mgr.set_read_callback(r, Some(log_event), log_param(log))
            .unwrap();

        mgr.read_nonblocking(r, 4).unwrap();
        assert!(entries(log).is_empty());

        driver.inject_rx(b"ab");
        mgr.isr();
        mgr.process();
        assert!(entries(log).is_empty());

        driver.inject_rx(b"cd");
        mgr.isr();
        mgr.process();
        assert_eq!(entries(log), vec![(SerialStatus::Success, b"abcd".to_vec(), 4)]);
    }

    #[test]
    fn cancel_reading_delivers_partial_data() {
        let (mgr, driver) = new_mgr();
        let r = mgr.open_read_handle().unwrap();
        let log = new_log();
        mgr.set_read_callback(r, Some(log_event), log_param(log))
            .unwrap();

        mgr.read_nonblocking(r, 8).unwrap();
        driver.inject_rx(b"abc");
        mgr.isr();
        mgr.cancel_reading(r).unwrap();
        assert_eq!(entries(log), vec![(SerialStatus::Canceled, b"abc".to_vec(), 3)]);
        // Idempotent.
        mgr.cancel_reading(r).unwrap();
    }

    #[test]
    fn stale_handles_are_rejected() {
        let (mgr, _driver) = new_mgr();
        let h = mgr.open_write_handle();
        mgr.close_write_handle(h).unwrap();
        assert_eq!(
            mgr.write_nonblocking(h, b"x"),
            Err(SerialError::HandleConflict)
        );
        assert_eq!(mgr.cancel_writing(h), Err(SerialError::HandleConflict));
        // Zero-length transfers still validate the handle.
        assert_eq!(mgr.write_blocking(h, b""), Err(SerialError::HandleConflict));

        let r = mgr.open_read_handle().unwrap();
        mgr.close_read_handle(r).unwrap();
        let mut out = [0u8; 1];
        assert_eq!(mgr.try_read(r, &mut out), Err(SerialError::HandleConflict));
        assert_eq!(
            mgr.read_blocking(r, &mut []),
            Err(SerialError::HandleConflict)
        );
        assert_eq!(mgr.read_nonblocking(r, 0), Err(SerialError::HandleConflict));
    }

    #[test]
    fn deinit_requires_all_sessions_closed() {
        let (mgr, _driver) = new_mgr();
        let h = mgr.open_write_handle();
        let r = mgr.open_read_handle().unwrap();
        assert_eq!(mgr.deinit(), Err(SerialError::Busy));
        mgr.close_write_handle(h).unwrap();
        assert_eq!(mgr.deinit(), Err(SerialError::Busy));
        mgr.close_read_handle(r).unwrap();
        mgr.deinit().unwrap();
    }

    #[test]
    fn blocking_read_pumps_to_completion() {
        let (mgr, driver) = new_mgr();
        let r = mgr.open_read_handle().unwrap();
        driver.inject_rx(b"hello");
        let mut out = [0u8; 5];
        let result = mgr.read_blocking(r, &mut out).unwrap();
        assert_eq!(result.len, 5);
        assert!(!result.overflow);
        assert_eq!(&out, b"hello");
    }
}
