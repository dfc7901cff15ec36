//! Utility types shared by the component managers.
pub mod pool;
pub mod ring_buffer;
