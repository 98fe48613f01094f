use std::{
    cell::Cell,
    ptr::null_mut,
    sync::atomic::{AtomicBool, AtomicPtr},
};

use atomic::{Atomic, Ordering};
use parking_lot::Mutex;

use crate::{heap::Heap, object_stack::ObjectStack, shadow_stack::ShadowStack};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    /// Executing managed code; polls safepoints and holds the mutator lock
    /// shared.
    Runnable,
    /// Blocked in native code; the GC may act on its behalf.
    Native,
    /// Parked at a safepoint while the world is stopped.
    Suspended,
}

/// Work run on each mutator at its next safepoint (or by the GC on the
/// mutator's behalf while it is in native state).
pub trait Closure: Sync {
    fn run(&self, thread: &Thread);
}

#[derive(Clone, Copy)]
pub(crate) struct CheckpointRef(pub *const dyn Closure);
unsafe impl Send for CheckpointRef {}

thread_local! {
    static CURRENT: Cell<*mut Thread> = Cell::new(null_mut());
}

/// Mutator control block. The two GC flags are relaxed atomics published by
/// checkpoints; the TLAB cells are owner-only except during the flip pause.
pub struct Thread {
    id: u32,
    pub(crate) heap: *mut Heap,
    state: Atomic<ThreadState>,
    is_gc_marking: AtomicBool,
    weak_ref_access_enabled: AtomicBool,
    tl_mark_stack: AtomicPtr<ObjectStack>,
    pending_checkpoint: Mutex<Option<CheckpointRef>>,
    tlab_start: Cell<*mut u8>,
    tlab_cur: Cell<*mut u8>,
    tlab_end: Cell<*mut u8>,
    tlab_objects: Cell<usize>,
    shadow_stack: ShadowStack,
    disallow_read_barrier: Cell<i32>,
    is_gc_thread: bool,
}

impl Thread {
    pub(crate) fn new(id: u32, heap: *mut Heap, is_gc_thread: bool) -> Self {
        Self {
            id,
            heap,
            state: Atomic::new(ThreadState::Runnable),
            is_gc_marking: AtomicBool::new(false),
            weak_ref_access_enabled: AtomicBool::new(true),
            tl_mark_stack: AtomicPtr::new(null_mut()),
            pending_checkpoint: Mutex::new(None),
            tlab_start: Cell::new(null_mut()),
            tlab_cur: Cell::new(null_mut()),
            tlab_end: Cell::new(null_mut()),
            tlab_objects: Cell::new(0),
            shadow_stack: ShadowStack::new(),
            disallow_read_barrier: Cell::new(0),
            is_gc_thread,
        }
    }

    #[inline(always)]
    pub fn current() -> *mut Thread {
        CURRENT.with(|c| c.get())
    }

    pub(crate) fn set_current(thread: *mut Thread) {
        CURRENT.with(|c| c.set(thread));
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn is_gc_thread(&self) -> bool {
        self.is_gc_thread
    }

    pub fn heap(&self) -> &Heap {
        unsafe { &*self.heap }
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state, Ordering::Release);
    }

    pub fn shadow_stack(&self) -> &'static ShadowStack {
        unsafe { std::mem::transmute(&self.shadow_stack) }
    }

    // GC flags.

    #[inline(always)]
    pub fn is_gc_marking(&self) -> bool {
        self.is_gc_marking.load(Ordering::Relaxed)
    }

    pub fn set_is_gc_marking(&self, marking: bool) {
        self.is_gc_marking.store(marking, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn weak_ref_access_enabled(&self) -> bool {
        self.weak_ref_access_enabled.load(Ordering::Relaxed)
    }

    pub fn set_weak_ref_access_enabled(&self, enabled: bool) {
        self.weak_ref_access_enabled.store(enabled, Ordering::Relaxed);
    }

    // Thread-local mark stack.

    pub fn tl_mark_stack(&self) -> *mut ObjectStack {
        self.tl_mark_stack.load(Ordering::Relaxed)
    }

    pub fn set_tl_mark_stack(&self, stack: *mut ObjectStack) {
        self.tl_mark_stack.store(stack, Ordering::Relaxed);
    }

    // TLAB.

    pub fn has_tlab(&self) -> bool {
        !self.tlab_start.get().is_null()
    }

    pub(crate) fn set_tlab(&self, start: *mut u8, len: usize) {
        self.tlab_start.set(start);
        self.tlab_cur.set(start);
        self.tlab_end.set((start as usize + len) as *mut u8);
        self.tlab_objects.set(0);
    }

    pub fn tlab(&self) -> (*mut u8, *mut u8, *mut u8) {
        (
            self.tlab_start.get(),
            self.tlab_cur.get(),
            self.tlab_end.get(),
        )
    }

    pub fn tlab_objects(&self) -> usize {
        self.tlab_objects.get()
    }

    pub fn reset_tlab(&self) {
        self.tlab_start.set(null_mut());
        self.tlab_cur.set(null_mut());
        self.tlab_end.set(null_mut());
        self.tlab_objects.set(0);
    }

    #[inline]
    pub(crate) fn alloc_tlab(&self, size: usize) -> *mut u8 {
        let cur = self.tlab_cur.get();
        if cur.is_null() {
            return null_mut();
        }
        let new = (cur as usize + size) as *mut u8;
        if new > self.tlab_end.get() {
            return null_mut();
        }
        self.tlab_cur.set(new);
        self.tlab_objects.set(self.tlab_objects.get() + 1);
        cur
    }

    // Checkpoints.

    pub(crate) fn arm_checkpoint(&self, closure: CheckpointRef) {
        let mut pending = self.pending_checkpoint.lock();
        debug_assert!(pending.is_none(), "thread {} already armed", self.id);
        *pending = Some(closure);
    }

    pub(crate) fn take_checkpoint(&self) -> Option<CheckpointRef> {
        self.pending_checkpoint.lock().take()
    }

    pub(crate) fn run_pending_checkpoint(&self) {
        if let Some(cp) = self.take_checkpoint() {
            unsafe { (*cp.0).run(self) };
        }
    }

    /// Safepoint poll: run pending checkpoint work, then park if the world
    /// is being stopped. Mutators call this from allocation slow paths and
    /// loop back-edges.
    #[inline]
    pub fn safepoint(&self) {
        self.run_pending_checkpoint();
        if self.heap().thread_list().suspend_all_requested() {
            self.heap().thread_list().park_at_safepoint(self);
        }
    }

    /// Bracket a blocking section: the GC treats the thread as stopped and
    /// may run checkpoints on its behalf.
    pub fn enter_native(&self) {
        self.run_pending_checkpoint();
        self.heap().thread_list().transition_to_native(self);
    }

    pub fn exit_native(&self) {
        self.heap().thread_list().transition_from_native(self);
    }

    // Debug read-barrier accounting during Scan.

    pub(crate) fn modify_disallow_read_barrier(&self, delta: i32) {
        self.disallow_read_barrier
            .set(self.disallow_read_barrier.get() + delta);
    }

    pub(crate) fn read_barrier_disallowed(&self) -> bool {
        self.disallow_read_barrier.get() != 0
    }
}

// Cells are owner-thread state; the GC only touches them while the owner is
// stopped at a safepoint or parked in native code.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}
