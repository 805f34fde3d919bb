use core::fmt;

/// Recoverable failures while bringing up memory management.
///
/// Exhaustion and corruption after bring-up are not represented here: those halt the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// The boot memory map described no memory at all.
    EmptyMemoryMap,
    /// No usable region can hold the frame bitmap.
    NoBitmapRegion { needed: usize },
    /// The frame allocator had nothing left for a structure needed during bring-up.
    OutOfFrames,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::EmptyMemoryMap => write!(f, "boot memory map is empty"),
            MemoryError::NoBitmapRegion { needed } => {
                write!(f, "no usable region can hold a {needed} byte frame bitmap")
            }
            MemoryError::OutOfFrames => write!(f, "out of physical frames"),
        }
    }
}

impl core::error::Error for MemoryError {}
