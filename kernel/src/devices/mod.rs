//! Devices the kernel talks to directly.

pub mod serial;
