//! Preemptive round-robin over a ring of kernel threads.
//!
//! Threads live in a fixed table and form a circular singly linked ring through table indices.
//! Each thread's context is a [`TrapFrame`] on its own stack; switching is nothing more than the
//! interrupt trampoline loading a different saved stack pointer before it pops.

use core::{
    alloc::{GlobalAlloc, Layout},
    fmt, iter,
};

use arrayvec::ArrayVec;

use super::context::{TrapFrame, TRAP_FRAME_SIZE};
use crate::{
    constants::sched::{MAX_THREADS, SCHED_SLICE, THREAD_STACK_SIZE},
    info, trace,
};

const STACK_LAYOUT: Layout = match Layout::from_size_align(THREAD_STACK_SIZE, 16) {
    Ok(layout) => layout,
    Err(_) => panic!("invalid thread stack layout"),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// The thread that was running when the scheduler came up.
    pub const BOOTSTRAP: Self = Self(0);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry point of a kernel thread. Returning from it halts the kernel.
pub type ThreadEntry = extern "C" fn();

struct Thread {
    id: ThreadId,
    /// Stack pointer to resume from; only meaningful while the thread is not running.
    saved_sp: u64,
    /// Table index of the next thread in the ring.
    next: usize,
    /// Base of the heap-allocated stack, `None` for the bootstrap thread.
    stack_base: Option<u64>,
}

pub struct Scheduler {
    threads: ArrayVec<Thread, MAX_THREADS>,
    current: usize,
    ticks: u64,
    slice: u64,
    next_id: u64,
}

impl Scheduler {
    /// Adopts the caller's execution as the only thread of a one-element ring.
    pub fn init() -> Self {
        Self::with_slice(SCHED_SLICE)
    }

    /// Like [`Scheduler::init`], switching every `slice` ticks.
    pub fn with_slice(slice: u64) -> Self {
        assert!(slice > 0, "time slice must be at least one tick");

        let mut threads = ArrayVec::new();
        threads.push(Thread {
            id: ThreadId::BOOTSTRAP,
            saved_sp: 0,
            next: 0,
            stack_base: None,
        });

        Self {
            threads,
            current: 0,
            ticks: 0,
            slice,
            next_id: 1,
        }
    }

    /// Creates a thread that starts at `entry` the first time the ring reaches it.
    ///
    /// The stack comes from `allocator`. Its top word is the return address `entry` will see,
    /// pointing at a trap that halts the kernel; right below sits the initial frame the
    /// trampoline pops on the first switch. The thread is linked in directly after the current
    /// one.
    pub fn create<A: GlobalAlloc>(&mut self, entry: ThreadEntry, allocator: &A) -> ThreadId {
        if self.threads.is_full() {
            panic!("thread table full: {MAX_THREADS} threads already exist");
        }

        // SAFETY: the layout has a non-zero size
        let stack = unsafe { allocator.alloc(STACK_LAYOUT) };
        if stack.is_null() {
            panic!("out of memory allocating a {THREAD_STACK_SIZE} byte thread stack");
        }

        let base = stack as u64;
        let return_slot = base + (THREAD_STACK_SIZE - 8) as u64;
        let frame = (return_slot - TRAP_FRAME_SIZE as u64) & !0xF;

        // SAFETY: both writes land inside the stack just allocated, suitably aligned
        unsafe {
            stack
                .add(THREAD_STACK_SIZE - 8)
                .cast::<u64>()
                .write(thread_returned as usize as u64);
            stack
                .add((frame - base) as usize)
                .cast::<TrapFrame>()
                .write(TrapFrame::for_kernel_thread(entry as usize as u64, return_slot));
        }

        let id = ThreadId(self.next_id);
        self.next_id += 1;

        let index = self.threads.len();
        let next = self.threads[self.current].next;
        self.threads.push(Thread {
            id,
            saved_sp: frame,
            next,
            stack_base: Some(base),
        });
        self.threads[self.current].next = index;

        info!(
            "created thread {} with stack {:#x}..{:#x}",
            id,
            base,
            base + THREAD_STACK_SIZE as u64
        );
        id
    }

    /// Called once per timer interrupt with the interrupted thread's stack pointer.
    ///
    /// Returns the stack pointer to resume instead, or `None` to keep running the current
    /// thread. A lone thread never switches and its ticks are not counted.
    pub fn tick(&mut self, current_sp: u64) -> Option<u64> {
        if self.threads.len() == 1 {
            return None;
        }

        self.ticks += 1;
        if self.ticks % self.slice != 0 {
            return None;
        }

        self.threads[self.current].saved_sp = current_sp;
        self.current = self.threads[self.current].next;

        let incoming = &self.threads[self.current];
        trace!("tick {}: switching to thread {}", self.ticks, incoming.id);
        Some(incoming.saved_sp)
    }

    pub fn current_id(&self) -> ThreadId {
        self.threads[self.current].id
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Thread ids in ring order, starting with the current thread.
    pub fn ring(&self) -> impl Iterator<Item = ThreadId> + '_ {
        iter::successors(Some(self.current), move |&index| {
            let next = self.threads[index].next;
            (next != self.current).then_some(next)
        })
        .map(|index| self.threads[index].id)
    }

    /// Stack pointer `id` will resume from, if it exists.
    pub fn saved_stack_pointer(&self, id: ThreadId) -> Option<u64> {
        self.threads
            .iter()
            .find(|thread| thread.id == id)
            .map(|thread| thread.saved_sp)
    }

    /// Base of the stack allocated for `id`; the bootstrap thread has none.
    pub fn stack_base(&self, id: ThreadId) -> Option<u64> {
        self.threads
            .iter()
            .find(|thread| thread.id == id)
            .and_then(|thread| thread.stack_base)
    }
}

/// Return address planted on every new thread's stack.
extern "C" fn thread_returned() -> ! {
    match super::current_id() {
        Some(id) => panic!("thread {id} returned from its entry point"),
        None => panic!("a thread returned from its entry point"),
    }
}

#[cfg(test)]
mod tests {
    use std::{alloc::System, collections::BTreeSet};

    use super::*;

    extern "C" fn worker() {}

    fn switch(scheduler: &mut Scheduler, sp: u64) -> Option<u64> {
        let mut result = None;
        for _ in 0..scheduler.slice {
            result = scheduler.tick(sp);
        }
        result
    }

    #[test]
    fn bootstrap_thread_never_switches() {
        let mut scheduler = Scheduler::init();

        assert_eq!(scheduler.thread_count(), 1);
        assert_eq!(scheduler.current_id(), ThreadId::BOOTSTRAP);
        for _ in 0..3 * SCHED_SLICE {
            assert_eq!(scheduler.tick(0x1000), None);
        }
        assert_eq!(scheduler.ticks(), 0);
        assert_eq!(scheduler.stack_base(ThreadId::BOOTSTRAP), None);
    }

    #[test]
    fn new_thread_stack_holds_trap_slot_and_initial_frame() {
        let mut scheduler = Scheduler::init();
        let id = scheduler.create(worker, &System);
        assert_eq!(id.as_u64(), 1);

        let base = scheduler.stack_base(id).unwrap();
        let top = base + THREAD_STACK_SIZE as u64;
        let sp = scheduler.saved_stack_pointer(id).unwrap();
        assert_eq!(sp % 16, 0);
        assert!(sp >= base && sp + TRAP_FRAME_SIZE as u64 <= top - 8);

        let frame = unsafe { &*(sp as *const TrapFrame) };
        assert_eq!(frame.rip, worker as usize as u64);
        assert_eq!(frame.cs, 0x08);
        assert_eq!(frame.ss, 0x10);
        assert_eq!(frame.rflags, 0x202);
        assert_eq!(frame.rsp, top - 8);
        assert_eq!((frame.rax, frame.rdi, frame.r15), (0, 0, 0));

        let return_address = unsafe { *((top - 8) as *const u64) };
        assert_eq!(return_address, thread_returned as usize as u64);
    }

    #[test]
    fn switches_only_on_slice_boundaries() {
        let mut scheduler = Scheduler::init();
        let worker_id = scheduler.create(worker, &System);
        let worker_sp = scheduler.saved_stack_pointer(worker_id).unwrap();

        for _ in 1..SCHED_SLICE {
            assert_eq!(scheduler.tick(0xAAAA_0000), None);
        }
        assert_eq!(scheduler.tick(0xAAAA_0000), Some(worker_sp));
        assert_eq!(scheduler.current_id(), worker_id);

        // the outgoing pointer was stored for the bootstrap thread
        assert_eq!(switch(&mut scheduler, 0xBBBB_0000), Some(0xAAAA_0000));
        assert_eq!(scheduler.current_id(), ThreadId::BOOTSTRAP);
        assert_eq!(scheduler.saved_stack_pointer(worker_id), Some(0xBBBB_0000));
        assert_eq!(scheduler.ticks(), 2 * SCHED_SLICE);
    }

    #[test]
    fn full_rotation_visits_every_thread_once() {
        let mut scheduler = Scheduler::with_slice(3);
        for _ in 0..3 {
            scheduler.create(worker, &System);
        }

        let k = scheduler.thread_count() as u64;
        let mut visited = Vec::new();
        for tick in 1..=k * 3 {
            if scheduler.tick(tick).is_some() {
                visited.push(scheduler.current_id());
            }
        }

        assert_eq!(visited.len() as u64, k);
        assert_eq!(visited.iter().collect::<BTreeSet<_>>().len() as u64, k);
        assert_eq!(scheduler.current_id(), ThreadId::BOOTSTRAP);
    }

    #[test]
    fn new_threads_run_right_after_the_current_one() {
        let mut scheduler = Scheduler::init();
        let a = scheduler.create(worker, &System);
        let b = scheduler.create(worker, &System);
        assert_eq!(
            scheduler.ring().collect::<Vec<_>>(),
            vec![ThreadId::BOOTSTRAP, b, a]
        );

        switch(&mut scheduler, 0x1000);
        assert_eq!(scheduler.current_id(), b);
        let c = scheduler.create(worker, &System);
        assert_eq!(
            scheduler.ring().collect::<Vec<_>>(),
            vec![b, c, a, ThreadId::BOOTSTRAP]
        );
    }

    #[test]
    #[should_panic(expected = "thread table full")]
    fn overflowing_the_thread_table_is_fatal() {
        let mut scheduler = Scheduler::init();
        for _ in 0..MAX_THREADS {
            scheduler.create(worker, &System);
        }
    }
}
