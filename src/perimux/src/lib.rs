//! Shares single-instance hardware peripherals (one timer channel,
//! one serial interface) among many independent software clients.
//!
//! The two managers follow the same shape: an explicit manager object
//! owns the hardware through a port trait, hands out generation-checked
//! handles, splits its work between an interrupt-side `isr` method and
//! a task-side `process` method, and reports deferred work through a
//! [`PortWakeup`] signal. Application callbacks only ever run from
//! `process` (or from the blocking convenience calls), never at
//! interrupt priority.
//!
//!  - [`timer`]: many software timers over one hardware timer
//!    channel.
//!  - [`serial`]: write queueing and buffered reading over one
//!    byte-oriented peripheral.
//!  - [`list`]: the pool-backed linked list underlying both.
//!
//! The crate is `no_std` and uses `alloc` for transfer staging and
//! control block storage.
#![no_std]
extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod error;
pub mod list;
pub mod port;
pub mod serial;
pub mod timer;
pub mod utils;

pub use crate::{
    error::{BadIdError, OpenError, SerialError, StartTimerError},
    port::{DriverError, PortTimer, PortWakeup, SerialDriver, SerialEvent, RX_CHUNK},
    serial::{
        CallbackMessage, ReadHandle, ReadResult, SerialCallback, SerialManager,
        SerialManagerOptions, SerialStatus, WriteHandle,
    },
    timer::{TimerCallback, TimerFlags, TimerId, TimerManager, TimerManagerOptions, TimerState},
};
