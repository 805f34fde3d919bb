pub const PAGE_SIZE: u64 = 4096;
pub const FRAME_SIZE: usize = 4096;

pub const BITMAP_ENTRY_SIZE: usize = 64;
pub const FULL_BITMAP_ENTRY: u64 = 0xFFFFFFFFFFFFFFFF;

// Kernel heap window, grows upward from here
pub const HEAP_START: u64 = 0xFFFF_A000_0000_0000;
pub const HEAP_INITIAL_SIZE: usize = 1024 * 1024; // 1 MB
pub const HEAP_MIN_GROWTH: usize = 4096;

/// Every heap payload is rounded up to this many bytes.
pub const HEAP_ALIGN: usize = 16;

/// Detects heap header corruption, never interpreted otherwise.
pub const HEAP_MAGIC: u64 = 0xC0FF_EE12_3456_7890;

// Uncacheable device windows are handed out from here
pub const MMIO_WINDOW_START: u64 = 0xFFFF_C000_0000_0000;

/// Largest number of boot memory map entries the kernel will consume.
pub const MAX_MEMORY_REGIONS: usize = 256;
