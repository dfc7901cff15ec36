//! Multiplexes one hardware timer channel across any number of
//! software timers.
//!
//! The hardware counter is always programmed with the smallest
//! remaining time among the armed timers, so one channel serves them
//! all. Work is split across two contexts:
//!
//!  - [`isr`](TimerManager::isr) runs at interrupt priority. It only
//!    folds the elapsed time into the armed timers' countdowns and
//!    signals the wakeup; it never calls back into the application.
//!  - [`process`](TimerManager::process) runs in task context. It
//!    arms newly started timers, fires the callbacks of expired ones
//!    with no lock held, and reprograms the hardware.
//!
//! `start` only stages a timer; until the next `process` call it sits
//! in the [`Ready`](TimerState::Ready) state. This keeps every
//! hardware reprogram on the task-context side.
use arrayvec::ArrayVec;
use spin::Mutex;

use crate::{
    error::{BadIdError, OpenError, StartTimerError},
    list::{HasNode, InsertError, List, ListNode, ListTag},
    port::{PortTimer, PortWakeup},
    utils::pool::{Pool, Ptr},
};

/// Called from [`TimerManager::process`] when a timer expires. The
/// `usize` is the parameter registered at `open`.
pub type TimerCallback = fn(usize);

bitflags::bitflags! {
    /// Timer mode flags. Exactly one of `SINGLE_SHOT` and `INTERVAL`
    /// must be set; the remaining flags are modifiers.
    pub struct TimerFlags: u8 {
        /// Fire once, then return to [`TimerState::Inactive`].
        const SINGLE_SHOT = 1 << 0;
        /// Re-arm with the same timeout after every expiry.
        const INTERVAL = 1 << 1;
        /// The timeout is given in seconds instead of microseconds.
        const SECOND = 1 << 2;
        /// The timeout is given in minutes instead of microseconds.
        const MINUTE = 1 << 3;
        /// Keep counting across low-power periods
        /// (see [`TimerManager::sync_lpm_timers`]).
        const LOW_POWER = 1 << 4;
    }
}

/// The life cycle state of a software timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    /// Not counting.
    Inactive,
    /// Started, but not yet picked up by `process`.
    Ready,
    /// Counting down.
    Active,
}

/// Identifies an open software timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(Ptr);

/// Timer control block.
#[derive(Debug)]
struct TimerCb {
    node: ListNode,
    callback: TimerCallback,
    param: usize,
    flags: TimerFlags,
    /// The programmed timeout, scaled to microseconds.
    timeout: u64,
    /// Microseconds left until expiry.
    remaining: u64,
    state: TimerState,
}

impl HasNode for TimerCb {
    fn node(&self) -> &ListNode {
        &self.node
    }

    fn node_mut(&mut self) -> &mut ListNode {
        &mut self.node
    }
}

const TAG_TIMERS: ListTag = ListTag(1);

/// The number of expired timers fired per lock acquisition in
/// [`TimerManager::process`].
const FIRE_BATCH: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct TimerManagerOptions {
    /// The maximum number of concurrently open timers. `None` means
    /// unlimited.
    pub max_timers: Option<usize>,
}

impl Default for TimerManagerOptions {
    fn default() -> Self {
        Self { max_timers: None }
    }
}

struct State {
    pool: Pool<TimerCb>,
    timers: List,
    hw_enabled: bool,
}

/// See the [module documentation](self).
pub struct TimerManager<P: PortTimer, W: PortWakeup = ()> {
    port: P,
    wakeup: W,
    state: Mutex<State>,
}

impl<P: PortTimer, W: PortWakeup> TimerManager<P, W> {
    pub fn new(port: P, wakeup: W) -> Self {
        Self::with_options(port, wakeup, TimerManagerOptions::default())
    }

    pub fn with_options(port: P, wakeup: W, options: TimerManagerOptions) -> Self {
        let timers = match options.max_timers {
            Some(max) => List::with_capacity(TAG_TIMERS, max),
            None => List::new(TAG_TIMERS),
        };
        Self {
            port,
            wakeup,
            state: Mutex::new(State {
                pool: Pool::new(),
                timers,
                hw_enabled: false,
            }),
        }
    }

    /// Register a software timer. The timer starts out
    /// [`Inactive`](TimerState::Inactive).
    pub fn open(&self, callback: TimerCallback, param: usize) -> Result<TimerId, OpenError> {
        let mut state = self.state.lock();
        let ptr = state.pool.allocate(TimerCb {
            node: ListNode::new(),
            callback,
            param,
            flags: TimerFlags::empty(),
            timeout: 0,
            remaining: 0,
            state: TimerState::Inactive,
        });
        let result = {
            let State { pool, timers, .. } = &mut *state;
            timers.accessor(pool).push_back(ptr)
        };
        match result {
            Ok(()) => Ok(TimerId(ptr)),
            Err(InsertError::CapacityExceeded) => {
                state.pool.deallocate(ptr);
                Err(OpenError::CapacityExceeded)
            }
            // A freshly allocated control block cannot be linked, and
            // `push_back` takes no anchor.
            Err(InsertError::AlreadyLinked) | Err(InsertError::BadAnchor) => unreachable!(),
        }
    }

    /// Unregister a software timer, stopping it if needed.
    pub fn close(&self, id: TimerId) -> Result<(), BadIdError> {
        let mut state = self.state.lock();
        self.sync_elapsed(&mut state);
        let State { pool, timers, .. } = &mut *state;
        timers
            .accessor(pool)
            .remove(id.0)
            .map_err(|_| BadIdError::BadId)?;
        state.pool.deallocate(id.0);
        if !Self::any_active(&state) && state.hw_enabled {
            self.port.disable();
            state.hw_enabled = false;
        }
        Ok(())
    }

    /// Arm a timer. A timer that is already counting is restarted with
    /// the new parameters.
    ///
    /// `timeout` is in microseconds unless [`TimerFlags::SECOND`] or
    /// [`TimerFlags::MINUTE`] says otherwise. The timer is picked up
    /// by the next [`process`](Self::process) call.
    pub fn start(
        &self,
        id: TimerId,
        flags: TimerFlags,
        timeout: u32,
    ) -> Result<(), StartTimerError> {
        let kind = flags & (TimerFlags::SINGLE_SHOT | TimerFlags::INTERVAL);
        if kind != TimerFlags::SINGLE_SHOT && kind != TimerFlags::INTERVAL {
            return Err(StartTimerError::BadParam);
        }
        if flags.contains(TimerFlags::SECOND | TimerFlags::MINUTE) || timeout == 0 {
            return Err(StartTimerError::BadParam);
        }
        let unit: u64 = if flags.contains(TimerFlags::MINUTE) {
            60_000_000
        } else if flags.contains(TimerFlags::SECOND) {
            1_000_000
        } else {
            1
        };
        let timeout = timeout as u64 * unit;

        let mut state = self.state.lock();
        self.sync_elapsed(&mut state);
        let cb = state.pool.get_mut(id.0).ok_or(BadIdError::BadId)?;
        cb.flags = flags;
        cb.timeout = timeout;
        cb.remaining = timeout;
        cb.state = TimerState::Ready;
        drop(state);

        log::trace!("timer {:?} staged with timeout {}us", id, timeout);
        self.wakeup.wake();
        Ok(())
    }

    /// Disarm a timer. Stopping an inactive timer is a no-op.
    pub fn stop(&self, id: TimerId) -> Result<(), BadIdError> {
        let mut state = self.state.lock();
        self.sync_elapsed(&mut state);
        let cb = state.pool.get_mut(id.0).ok_or(BadIdError::BadId)?;
        cb.state = TimerState::Inactive;
        if !Self::any_active(&state) && state.hw_enabled {
            self.port.disable();
            state.hw_enabled = false;
        }
        Ok(())
    }

    /// Microseconds left until the timer expires. Zero for an inactive
    /// timer.
    pub fn remaining_time(&self, id: TimerId) -> Result<u64, BadIdError> {
        let mut state = self.state.lock();
        self.sync_elapsed(&mut state);
        let cb = state.pool.get(id.0).ok_or(BadIdError::BadId)?;
        Ok(match cb.state {
            TimerState::Inactive => 0,
            TimerState::Ready | TimerState::Active => cb.remaining,
        })
    }

    /// The hardware timer interrupt handler.
    ///
    /// Folds the time elapsed since the last hardware interaction into
    /// every counting timer and requests a `process` call. Callbacks
    /// are never invoked from here.
    pub fn isr(&self) {
        let mut state = self.state.lock();
        self.sync_elapsed(&mut state);
        drop(state);
        self.wakeup.wake();
    }

    /// Fire expired timers and reprogram the hardware.
    ///
    /// Must be called from task context after the wakeup signal (or
    /// periodically in polled environments). Callbacks run with no
    /// internal lock held, so they may freely call back into the
    /// manager.
    pub fn process(&self) {
        loop {
            let mut batch: ArrayVec<(TimerCallback, usize), FIRE_BATCH> = ArrayVec::new();

            let mut state = self.state.lock();
            self.sync_elapsed(&mut state);
            let mut cur = state.timers.front();
            while let Some(ptr) = cur {
                cur = state.timers.next_of(&state.pool, ptr);
                let cb = &mut state.pool[ptr];
                match cb.state {
                    TimerState::Ready => cb.state = TimerState::Active,
                    TimerState::Active if cb.remaining == 0 => {
                        // The control block is updated before the
                        // callback runs, so a `start` or `stop` from
                        // within the callback takes effect cleanly.
                        if cb.flags.contains(TimerFlags::INTERVAL) {
                            cb.remaining = cb.timeout;
                        } else {
                            cb.state = TimerState::Inactive;
                        }
                        batch.push((cb.callback, cb.param));
                        if batch.is_full() {
                            break;
                        }
                    }
                    _ => {}
                }
            }

            if batch.is_empty() {
                self.reprogram(&mut state);
                return;
            }
            drop(state);

            for (callback, param) in batch {
                callback(param);
            }
        }
    }

    /// The counter time accumulated since the last hardware
    /// interaction, folded into the armed timers and returned.
    ///
    /// Call right before entering a low-power state. Because the
    /// returned amount is already accounted for, pass only the
    /// additional time slept to [`sync_lpm_timers`](Self::sync_lpm_timers)
    /// afterwards.
    pub fn not_counted_time_before_sleep(&self) -> u32 {
        let mut state = self.state.lock();
        if !Self::any_active(&state) {
            return 0;
        }
        let elapsed = self.port.elapsed();
        Self::fold_elapsed(&mut state, elapsed as u64, false);
        elapsed
    }

    /// Fold `slept` microseconds of low-power time into the timers
    /// flagged [`TimerFlags::LOW_POWER`]. Timers without the flag are
    /// frozen across sleep and are left untouched.
    pub fn sync_lpm_timers(&self, slept: u64) {
        let mut state = self.state.lock();
        Self::fold_elapsed(&mut state, slept, true);
        drop(state);
        self.wakeup.wake();
    }

    fn any_active(state: &State) -> bool {
        state
            .timers
            .iter(&state.pool)
            .any(|(_, cb)| cb.state == TimerState::Active)
    }

    /// Subtract elapsed time from the counting timers. With
    /// `low_power_only`, timers not flagged `LOW_POWER` are skipped.
    fn fold_elapsed(state: &mut State, elapsed: u64, low_power_only: bool) {
        if elapsed == 0 {
            return;
        }
        let mut cur = state.timers.front();
        while let Some(ptr) = cur {
            cur = state.timers.next_of(&state.pool, ptr);
            let cb = &mut state.pool[ptr];
            if cb.state == TimerState::Active
                && (!low_power_only || cb.flags.contains(TimerFlags::LOW_POWER))
            {
                cb.remaining = cb.remaining.saturating_sub(elapsed);
            }
        }
    }

    /// Consume the port's elapsed time and fold it into the armed
    /// timers. Only meaningful while the hardware counter runs.
    fn sync_elapsed(&self, state: &mut State) {
        if state.hw_enabled {
            let elapsed = self.port.elapsed();
            Self::fold_elapsed(state, elapsed as u64, false);
        }
    }

    /// Program the hardware with the smallest remaining time among the
    /// counting timers, or shut it down if there is none.
    fn reprogram(&self, state: &mut State) {
        let min = state
            .timers
            .iter(&state.pool)
            .filter(|(_, cb)| cb.state == TimerState::Active)
            .map(|(_, cb)| cb.remaining)
            .min();
        match min {
            None => {
                if state.hw_enabled {
                    self.port.disable();
                    state.hw_enabled = false;
                }
            }
            Some(remaining) => {
                let timeout = remaining.min(self.port.max_timeout() as u64).max(1) as u32;
                self.port.update_timeout(timeout);
                if !state.hw_enabled {
                    self.port.enable();
                    state.hw_enabled = true;
                }
            }
        }
    }
}

impl<P: PortTimer, W: PortWakeup> Drop for TimerManager<P, W> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.hw_enabled {
            self.port.disable();
            state.hw_enabled = false;
        }
    }
}
