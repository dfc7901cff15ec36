//! Error types for the public API.
//!
//! Every fallible operation returns a dedicated enum listing exactly
//! the failures it can produce. Nothing in the managers panics on
//! misuse; a stale handle, a busy resource, or a bad parameter always
//! comes back as a value.

/// Returned when a handle does not designate an open object of this
/// manager (never opened, already closed, or belonging to another
/// manager instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadIdError {
    BadId,
}

/// Error type for handle-opening operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// The configured maximum number of handles is already open.
    CapacityExceeded,
}

/// Error type for [`TimerManager::start`](crate::timer::TimerManager::start).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartTimerError {
    BadId,
    /// The mode flags or the timeout value are invalid.
    BadParam,
}

impl From<BadIdError> for StartTimerError {
    fn from(e: BadIdError) -> Self {
        match e {
            BadIdError::BadId => Self::BadId,
        }
    }
}

/// Error type for serial session operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialError {
    /// The underlying driver rejected the request.
    Driver,
    /// The resource is occupied: the handle already has a transfer
    /// outstanding, the single read handle is taken, or open sessions
    /// prevent tearing the manager down.
    Busy,
    /// The handle does not designate an open session of this manager.
    HandleConflict,
}
