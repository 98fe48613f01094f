use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{
    lock_api::RawRwLock as RawRwLockApi, Condvar, Mutex, RawRwLock,
};

use crate::thread::{CheckpointRef, Closure, Thread, ThreadState};

/// Registry of mutator threads plus the machinery the collector coordinates
/// with them through: checkpoints, stop-the-world suspension, and the
/// thread flip.
///
/// Runnable mutators hold `mutator_lock` shared; the two GC pauses take it
/// exclusively. A mutator releases the shared lock whenever it parks at a
/// safepoint or enters native code.
pub struct ThreadList {
    threads: Mutex<Vec<*mut Thread>>,
    mutator_lock: RawRwLock,
    suspend_all_requested: AtomicBool,
    resume_lock: Mutex<()>,
    resume_condition: Condvar,
    /// Serializes thread flips against sections that must not observe a
    /// half-flipped world (the JNI-critical analogue).
    thread_flip_lock: Mutex<()>,
    next_thread_id: AtomicU32,
}

impl ThreadList {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            mutator_lock: RawRwLock::INIT,
            suspend_all_requested: AtomicBool::new(false),
            resume_lock: Mutex::new(()),
            resume_condition: Condvar::new(),
            thread_flip_lock: Mutex::new(()),
            next_thread_id: AtomicU32::new(1),
        }
    }

    pub fn mutator_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub(crate) fn suspend_all_requested(&self) -> bool {
        self.suspend_all_requested.load(Ordering::Acquire)
    }

    /// Register the calling OS thread as a mutator.
    pub fn attach(&self, heap: *mut crate::heap::Heap) -> *mut Thread {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let thread = Box::into_raw(Box::new(Thread::new(id, heap, false)));
        // Block here if a pause is in progress so we never start runnable
        // mid-pause.
        self.wait_for_resume();
        self.mutator_lock.lock_shared();
        unsafe {
            (*thread).set_state(ThreadState::Runnable);
            // A thread created mid-cycle must start with the collector's
            // current view of the world.
            (*thread).set_is_gc_marking((*heap).collector().is_marking());
            (*thread)
                .set_weak_ref_access_enabled((*heap).collector().weak_ref_access_enabled());
        }
        self.threads.lock().push(thread);
        Thread::set_current(thread);
        thread
    }

    /// Unregister and free the calling thread's control block. Any armed
    /// checkpoint is run first so its barrier pass is not lost.
    pub fn detach(&self, thread: *mut Thread) {
        unsafe {
            {
                let mut threads = self.threads.lock();
                (*thread).run_pending_checkpoint();
                threads.retain(|&t| t != thread);
            }
            self.mutator_lock.unlock_shared();
            Thread::set_current(std::ptr::null_mut());
            drop(Box::from_raw(thread));
        }
    }

    fn wait_for_resume(&self) {
        if !self.suspend_all_requested() {
            return;
        }
        let mut guard = self.resume_lock.lock();
        while self.suspend_all_requested() {
            self.resume_condition.wait(&mut guard);
        }
    }

    /// Park the calling mutator until `resume_all`. Called from the
    /// safepoint poll.
    pub(crate) fn park_at_safepoint(&self, thread: &Thread) {
        thread.set_state(ThreadState::Suspended);
        self.mutator_lock.unlock_shared();
        self.wait_for_resume();
        self.mutator_lock.lock_shared();
        thread.set_state(ThreadState::Runnable);
    }

    pub(crate) fn transition_to_native(&self, thread: &Thread) {
        thread.set_state(ThreadState::Native);
        self.mutator_lock.unlock_shared();
    }

    pub(crate) fn transition_from_native(&self, thread: &Thread) {
        self.wait_for_resume();
        self.mutator_lock.lock_shared();
        thread.set_state(ThreadState::Runnable);
        thread.run_pending_checkpoint();
    }

    /// Stop the world: every mutator is parked at a safepoint or in native
    /// code before this returns.
    pub fn suspend_all(&self) {
        self.suspend_all_requested.store(true, Ordering::Release);
        // Acquires once every runnable mutator has dropped its shared hold.
        self.mutator_lock.lock_exclusive();
    }

    pub fn resume_all(&self) {
        {
            let _guard = self.resume_lock.lock();
            self.suspend_all_requested.store(false, Ordering::Release);
            self.resume_condition.notify_all();
        }
        unsafe { self.mutator_lock.unlock_exclusive() };
    }

    /// Arm `closure` on every mutator. Runnable threads run it at their
    /// next safepoint; threads parked in native code have it run here on
    /// their behalf. Returns the number of closures armed; the caller waits
    /// on its barrier for that many passes.
    pub fn run_checkpoint(&self, closure: &dyn Closure) -> usize {
        let threads = self.threads.lock();
        let count = threads.len();
        for &t in threads.iter() {
            unsafe {
                (*t).arm_checkpoint(CheckpointRef(closure as *const dyn Closure));
            }
        }
        for &t in threads.iter() {
            let t = unsafe { &*t };
            if t.state() != ThreadState::Runnable {
                // The take is atomic, so we never double-run against the
                // owner waking up.
                if let Some(cp) = t.take_checkpoint() {
                    unsafe { (*cp.0).run(t) };
                }
            }
        }
        count
    }

    /// The flip pause: stop the world, run `flip_callback` once, then run
    /// `thread_flip` on every mutator before any of them resumes.
    pub fn flip_thread_roots(
        &self,
        thread_flip: &dyn Closure,
        flip_callback: impl FnOnce(),
    ) -> usize {
        let _flip_guard = self.thread_flip_lock.lock();
        self.suspend_all();
        flip_callback();
        let count;
        {
            let threads = self.threads.lock();
            count = threads.len();
            for &t in threads.iter() {
                unsafe { thread_flip.run(&*t) };
            }
        }
        self.resume_all();
        count
    }

    pub fn for_each(&self, mut f: impl FnMut(&Thread)) {
        let threads = self.threads.lock();
        for &t in threads.iter() {
            f(unsafe { &*t });
        }
    }
}

impl Default for ThreadList {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for ThreadList {}
unsafe impl Sync for ThreadList {}
