//! Scheduler configuration.

/// Number of timer ticks a thread runs before the next one in the ring gets the CPU.
pub const SCHED_SLICE: u64 = 10;

/// Stack size of every created thread, taken from the kernel heap.
pub const THREAD_STACK_SIZE: usize = 8192;

/// Capacity of the thread slot table, bootstrap thread included.
pub const MAX_THREADS: usize = 64;

/// RFLAGS of a fresh thread: reserved bit 1 plus IF.
pub const THREAD_INITIAL_RFLAGS: u64 = 0x202;
