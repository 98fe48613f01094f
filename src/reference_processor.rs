use std::{
    ptr::null_mut,
    sync::atomic::{AtomicPtr, Ordering},
};

use im::Vector;
use parking_lot::{Condvar, Mutex};

use crate::{
    api::{pending_next_slot, referent_slot},
    header::{HeapObjectHeader, ReferenceKind, RB_GRAY, RB_WHITE},
    thread::Thread,
};

/// Collector callbacks the reference processor drives marking through.
pub trait ReferenceVisitor {
    /// Null if dead; the canonical (possibly moved) pointer otherwise.
    fn is_marked(&mut self, obj: *mut HeapObjectHeader) -> *mut HeapObjectHeader;
    /// Mark (and possibly copy) the object, returning its canonical pointer.
    fn mark_object(&mut self, obj: *mut HeapObjectHeader) -> *mut HeapObjectHeader;
    /// Mark the slot's object and forward the slot in place.
    fn mark_heap_reference(&mut self, slot: &AtomicPtr<HeapObjectHeader>);
    /// True if the slot's object is live; forwards the slot in place when
    /// the object moved.
    fn is_marked_heap_reference(&mut self, slot: &AtomicPtr<HeapObjectHeader>) -> bool;
    fn process_mark_stack(&mut self);
}

/// Pending references linked through their `pending_next` words. A
/// reference whose `pending_next` is null is not enqueued; the tail links
/// to itself.
pub struct ReferenceQueue {
    head: *mut HeapObjectHeader,
}

impl ReferenceQueue {
    pub fn new() -> Self {
        Self { head: null_mut() }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn enqueue(&mut self, reference: *mut HeapObjectHeader) {
        unsafe {
            let slot = pending_next_slot(reference);
            if !slot.load(Ordering::Relaxed).is_null() {
                // Already enqueued.
                return;
            }
            let next = if self.head.is_null() {
                reference
            } else {
                self.head
            };
            slot.store(next, Ordering::Relaxed);
            self.head = reference;
        }
    }

    /// Pop one reference and whiten it: it was left gray in the queue so
    /// mutator `get_referent` calls kept hitting the read barrier.
    pub fn dequeue_pending_reference(&mut self) -> Option<*mut HeapObjectHeader> {
        if self.head.is_null() {
            return None;
        }
        let reference = self.head;
        unsafe {
            let slot = pending_next_slot(reference);
            let next = slot.load(Ordering::Relaxed);
            self.head = if next == reference { null_mut() } else { next };
            slot.store(null_mut(), Ordering::Relaxed);
            if (*reference).rb_state() == RB_GRAY {
                let whitened = (*reference).cas_rb_state(RB_GRAY, RB_WHITE);
                debug_assert!(whitened);
            }
        }
        Some(reference)
    }

    fn for_each(&self, mut f: impl FnMut(*mut HeapObjectHeader)) {
        let mut cur = self.head;
        while !cur.is_null() {
            f(cur);
            let next = unsafe { pending_next_slot(cur).load(Ordering::Relaxed) };
            cur = if next == cur { null_mut() } else { next };
        }
    }

    /// Keep every soft referent alive by marking it through the visitor.
    pub fn forward_soft_references(&self, visitor: &mut dyn ReferenceVisitor) {
        self.for_each(|reference| unsafe {
            let slot = referent_slot(reference);
            if !slot.load(Ordering::Relaxed).is_null() {
                visitor.mark_heap_reference(slot);
            }
        });
    }

    /// Clear dead referents, handing their references to `cleared`. Live
    /// referents get their slots forwarded and the reference is dropped
    /// from the pending set.
    pub fn clear_white_references(
        &mut self,
        cleared: &mut Vector<*mut HeapObjectHeader>,
        visitor: &mut dyn ReferenceVisitor,
    ) {
        while let Some(reference) = self.dequeue_pending_reference() {
            unsafe {
                let slot = referent_slot(reference);
                if slot.load(Ordering::Relaxed).is_null() {
                    continue;
                }
                if !visitor.is_marked_heap_reference(slot) {
                    slot.store(null_mut(), Ordering::Relaxed);
                    cleared.push_back(reference);
                }
            }
        }
    }

    /// Finalizer semantics: dead referents are resurrected (marked) so the
    /// finalizer can run against them, and the reference is enqueued for
    /// the embedder.
    pub fn enqueue_finalizer_references(
        &mut self,
        cleared: &mut Vector<*mut HeapObjectHeader>,
        visitor: &mut dyn ReferenceVisitor,
    ) {
        while let Some(reference) = self.dequeue_pending_reference() {
            unsafe {
                let slot = referent_slot(reference);
                if slot.load(Ordering::Relaxed).is_null() {
                    continue;
                }
                if !visitor.is_marked_heap_reference(slot) {
                    let referent = slot.load(Ordering::Relaxed);
                    let forwarded = visitor.mark_object(referent);
                    slot.store(forwarded, Ordering::Relaxed);
                    cleared.push_back(reference);
                }
            }
        }
    }
}

impl Default for ReferenceQueue {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingQueues {
    soft: ReferenceQueue,
    weak: ReferenceQueue,
    finalizer: ReferenceQueue,
    phantom: ReferenceQueue,
}

/// Soft/weak/finalizer/phantom processing, run by the collector after
/// marking converges (GC-exclusive mark stack mode).
pub struct ReferenceProcessor {
    queues: Mutex<PendingQueues>,
    cleared: Mutex<Vector<*mut HeapObjectHeader>>,
    /// Gate for mutator referent reads while weak-ref access is disabled.
    condition_lock: Mutex<()>,
    condition: Condvar,
}

impl ReferenceProcessor {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(PendingQueues {
                soft: ReferenceQueue::new(),
                weak: ReferenceQueue::new(),
                finalizer: ReferenceQueue::new(),
                phantom: ReferenceQueue::new(),
            }),
            cleared: Mutex::new(Vector::new()),
            condition_lock: Mutex::new(()),
            condition: Condvar::new(),
        }
    }

    /// Scanner callback for reference-type holders: if the referent is not
    /// yet marked, park the reference on the pending queue for its kind;
    /// if it is, just forward the slot.
    pub fn delay_reference_referent(
        &self,
        kind: ReferenceKind,
        reference: *mut HeapObjectHeader,
        visitor: &mut dyn ReferenceVisitor,
    ) {
        debug_assert_ne!(kind, ReferenceKind::Regular);
        unsafe {
            let slot = referent_slot(reference);
            if slot.load(Ordering::Relaxed).is_null() {
                return;
            }
            if visitor.is_marked_heap_reference(slot) {
                return;
            }
        }
        let mut queues = self.queues.lock();
        match kind {
            ReferenceKind::Soft => queues.soft.enqueue(reference),
            ReferenceKind::Weak => queues.weak.enqueue(reference),
            ReferenceKind::Finalizer => queues.finalizer.enqueue(reference),
            ReferenceKind::Phantom => queues.phantom.enqueue(reference),
            ReferenceKind::Regular => unreachable!(),
        }
    }

    /// Process all pending references. May mark new objects (soft
    /// forwarding, finalizer resurrection); drains the mark stack through
    /// the visitor between stages. The queue lock is dropped around the
    /// drains: scanning can discover new reference objects and re-enter
    /// [delay_reference_referent](Self::delay_reference_referent).
    pub fn process_references(&self, clear_soft: bool, visitor: &mut dyn ReferenceVisitor) {
        if !clear_soft {
            {
                let queues = self.queues.lock();
                queues.soft.forward_soft_references(visitor);
            }
            visitor.process_mark_stack();
        }
        {
            let mut queues = self.queues.lock();
            let mut cleared = self.cleared.lock();
            queues.soft.clear_white_references(&mut cleared, visitor);
            queues.weak.clear_white_references(&mut cleared, visitor);
            queues
                .finalizer
                .enqueue_finalizer_references(&mut cleared, visitor);
        }
        visitor.process_mark_stack();
        {
            // Resurrection may have revived soft/weak referents enqueued
            // after the finalizer pass marked through them.
            let mut queues = self.queues.lock();
            let mut cleared = self.cleared.lock();
            queues.soft.clear_white_references(&mut cleared, visitor);
            queues.weak.clear_white_references(&mut cleared, visitor);
            queues.phantom.clear_white_references(&mut cleared, visitor);
            debug_assert!(queues.soft.is_empty());
            debug_assert!(queues.weak.is_empty());
            debug_assert!(queues.finalizer.is_empty());
            debug_assert!(queues.phantom.is_empty());
        }
    }

    /// Hand the embedder everything cleared since the last call.
    pub fn collect_cleared_references(&self) -> Vector<*mut HeapObjectHeader> {
        std::mem::take(&mut *self.cleared.lock())
    }

    /// Mutator-side referent read. Blocks while the calling thread's
    /// weak-ref access is disabled; the read itself goes through the read
    /// barrier.
    pub fn get_referent(
        &self,
        thread: &Thread,
        reference: *mut HeapObjectHeader,
    ) -> *mut HeapObjectHeader {
        if !thread.weak_ref_access_enabled() {
            // Park as a blocking section so checkpoints and pauses do not
            // wait on us while we wait on the collector.
            thread.enter_native();
            {
                let mut guard = self.condition_lock.lock();
                while !thread.weak_ref_access_enabled() {
                    self.condition.wait(&mut guard);
                }
            }
            thread.exit_native();
        }
        let referent = unsafe { referent_slot(reference).load(Ordering::Acquire) };
        if referent.is_null() {
            return null_mut();
        }
        crate::heap::read_barrier(referent)
    }

    /// Wake every mutator parked in the referent slow path.
    pub fn broadcast_for_slow_path(&self) {
        let _guard = self.condition_lock.lock();
        self.condition.notify_all();
    }
}

impl Default for ReferenceProcessor {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for ReferenceProcessor {}
unsafe impl Sync for ReferenceProcessor {}
