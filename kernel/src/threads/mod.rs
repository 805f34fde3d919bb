//! Kernel threads and their preemptive round-robin scheduler.

pub mod context;
pub mod scheduler;

use core::alloc::GlobalAlloc;

pub use scheduler::{Scheduler, ThreadEntry, ThreadId};

use crate::{constants::sched::SCHED_SLICE, info, memory::heap::KernelHeap, sync::IrqMutex};

static SCHEDULER: IrqMutex<Option<Scheduler>> = IrqMutex::new(None);

/// Turns the running boot code into thread 0. The heap must be up before threads are spawned.
pub fn init() {
    let mut scheduler = SCHEDULER.lock();
    assert!(scheduler.is_none(), "scheduler initialized twice");
    *scheduler = Some(Scheduler::init());
    info!("scheduler up, switching every {} ticks", SCHED_SLICE);
}

/// Creates a kernel thread with its stack on the kernel heap.
pub fn spawn(entry: ThreadEntry) -> ThreadId {
    spawn_on(&SCHEDULER, entry, &KernelHeap)
}

fn spawn_on<A: GlobalAlloc>(
    scheduler: &IrqMutex<Option<Scheduler>>,
    entry: ThreadEntry,
    allocator: &A,
) -> ThreadId {
    scheduler
        .lock()
        .as_mut()
        .expect("thread spawned before threads::init")
        .create(entry, allocator)
}

/// Scheduler half of the timer interrupt: the stack pointer to resume, if it changes.
pub fn tick(current_sp: u64) -> Option<u64> {
    SCHEDULER
        .lock()
        .as_mut()
        .and_then(|scheduler| scheduler.tick(current_sp))
}

/// Id of the running thread, `None` before [`init`].
pub fn current_id() -> Option<ThreadId> {
    SCHEDULER.lock().as_ref().map(Scheduler::current_id)
}
