use std::{
    fmt,
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering},
};

use flume::{Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::{
    api::{allocation_size_of, vtable_of, Collectable, Gc, Reference, Weak},
    card_table::CardTable,
    concurrent_copying::ConcurrentCopying,
    header::{HeapObjectHeader, ReferenceKind},
    large_object_space::LargeObjectSpace,
    mod_union_table::ModUnionTable,
    non_moving_space::NonMovingSpace,
    object_stack::ObjectStack,
    reference_processor::ReferenceProcessor,
    region_space::RegionSpace,
    space::BootImageSpace,
    space_bitmap::HeapBitmap,
    thread::Thread,
    thread_list::ThreadList,
    utils::formatted_size,
    USE_BAKER_READ_BARRIER,
};

/// Allocations at or above this bypass the TLAB.
const MAX_TLAB_ALLOCATION: usize = 8 * 1024;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum GcCause {
    /// Heap-policy triggered.
    Background,
    /// `collect_garbage` from the embedder; evacuates everything.
    Explicit,
    /// Native allocation pressure; evacuates everything.
    ForNativeAlloc,
}

#[derive(Clone)]
pub struct HeapOptions {
    pub region_space_capacity: usize,
    pub non_moving_space_initial_size: usize,
    pub non_moving_space_capacity: usize,
    pub large_object_space_capacity: usize,
    pub boot_image_space_capacity: usize,
    /// Entries, not bytes.
    pub allocation_stack_capacity: usize,
    pub large_object_threshold: usize,
    pub initial_gc_threshold: usize,
    pub use_tlab: bool,
    pub measure_read_barrier_slow_path: bool,
}

impl Default for HeapOptions {
    fn default() -> Self {
        Self {
            region_space_capacity: 64 * 1024 * 1024,
            non_moving_space_initial_size: 4 * 1024 * 1024,
            non_moving_space_capacity: 16 * 1024 * 1024,
            large_object_space_capacity: 32 * 1024 * 1024,
            boot_image_space_capacity: 4 * 1024 * 1024,
            allocation_stack_capacity: 64 * 1024,
            large_object_threshold: 12 * 1024,
            initial_gc_threshold: 16 * 1024 * 1024,
            use_tlab: true,
            measure_read_barrier_slow_path: false,
        }
    }
}

impl fmt::Debug for HeapOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HeapOptions:")?;
        writeln!(
            f,
            "\tregion_space_capacity: {}",
            formatted_size(self.region_space_capacity)
        )?;
        writeln!(
            f,
            "\tnon_moving_space_capacity: {}",
            formatted_size(self.non_moving_space_capacity)
        )?;
        writeln!(
            f,
            "\tlarge_object_space_capacity: {}",
            formatted_size(self.large_object_space_capacity)
        )?;
        writeln!(
            f,
            "\tlarge_object_threshold: {}",
            formatted_size(self.large_object_threshold)
        )?;
        writeln!(
            f,
            "\tinitial_gc_threshold: {}",
            formatted_size(self.initial_gc_threshold)
        )?;
        writeln!(f, "\tuse_tlab: {}", self.use_tlab)
    }
}

enum GcTask {
    Collect { cause: GcCause, clear_soft: bool },
    Shutdown,
}

struct SendPtr(*mut Heap);
unsafe impl Send for SendPtr {}

/// Owns the spaces, the accounting structures, the thread registry and the
/// collector, and runs the dedicated GC thread.
pub struct Heap {
    options: HeapOptions,
    region_space: Box<RegionSpace>,
    boot_image_space: Box<BootImageSpace>,
    non_moving_space: Box<NonMovingSpace>,
    large_object_space: Box<LargeObjectSpace>,
    card_table: Box<CardTable>,
    mod_union_tables: Vec<Box<ModUnionTable>>,
    heap_bitmap: Box<HeapBitmap>,
    allocation_stack: AtomicPtr<ObjectStack>,
    live_stack: AtomicPtr<ObjectStack>,
    stacks: [Box<ObjectStack>; 2],
    thread_list: ThreadList,
    reference_processor: ReferenceProcessor,
    collector: Option<Box<ConcurrentCopying>>,
    weak_slots: Mutex<Vec<*mut AtomicPtr<HeapObjectHeader>>>,
    global_roots: Mutex<Vec<*mut AtomicPtr<HeapObjectHeader>>>,
    post_marking_callbacks: Mutex<Vec<Box<dyn Fn() + Send>>>,
    pub(crate) num_bytes_allocated: AtomicUsize,
    gc_threshold: AtomicUsize,
    gc_pending: AtomicBool,
    gcs_completed: Mutex<u64>,
    gcs_completed_count: AtomicU64,
    gc_complete_condition: Condvar,
    gc_request_snd: Sender<GcTask>,
    gc_request_recv: Receiver<GcTask>,
    gc_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Heap {
    pub fn new(options: HeapOptions) -> Box<Self> {
        let region_space = RegionSpace::new(options.region_space_capacity);
        let boot_image_space =
            BootImageSpace::create("boot image space", options.boot_image_space_capacity);
        let mut non_moving_space = NonMovingSpace::create(
            "non moving space",
            options.non_moving_space_initial_size,
            options.non_moving_space_capacity,
        );
        let mut large_object_space =
            LargeObjectSpace::create("large object space", options.large_object_space_capacity);
        let card_table = Box::new(CardTable::create(
            boot_image_space.space().begin(),
            boot_image_space.space().capacity(),
        ));
        let mut heap_bitmap = Box::new(HeapBitmap::new());
        heap_bitmap.add_continuous_space_bitmap(non_moving_space.mark_bitmap_ptr());
        heap_bitmap.add_large_object_bitmap(large_object_space.mark_bitmap_ptr());
        let mod_union_tables = vec![Box::new(ModUnionTable::new(
            "boot image mod-union table",
            boot_image_space.space().begin() as usize,
            boot_image_space.space().limit() as usize,
        ))];
        let stacks = [
            Box::new(ObjectStack::new(
                "allocation stack",
                options.allocation_stack_capacity,
            )),
            Box::new(ObjectStack::new(
                "live stack",
                options.allocation_stack_capacity,
            )),
        ];
        let (gc_request_snd, gc_request_recv) = flume::unbounded();
        let initial_gc_threshold = options.initial_gc_threshold;
        let measure = options.measure_read_barrier_slow_path;
        let mut heap = Box::new(Self {
            options,
            region_space,
            boot_image_space,
            non_moving_space,
            large_object_space,
            card_table,
            mod_union_tables,
            heap_bitmap,
            allocation_stack: AtomicPtr::new(null_mut()),
            live_stack: AtomicPtr::new(null_mut()),
            stacks,
            thread_list: ThreadList::new(),
            reference_processor: ReferenceProcessor::new(),
            collector: None,
            weak_slots: Mutex::new(Vec::new()),
            global_roots: Mutex::new(Vec::new()),
            post_marking_callbacks: Mutex::new(Vec::new()),
            num_bytes_allocated: AtomicUsize::new(0),
            gc_threshold: AtomicUsize::new(initial_gc_threshold),
            gc_pending: AtomicBool::new(false),
            gcs_completed: Mutex::new(0),
            gcs_completed_count: AtomicU64::new(0),
            gc_complete_condition: Condvar::new(),
            gc_request_snd,
            gc_request_recv,
            gc_thread: Mutex::new(None),
        });
        heap.allocation_stack
            .store(&mut *heap.stacks[0] as *mut _, Ordering::Relaxed);
        heap.live_stack
            .store(&mut *heap.stacks[1] as *mut _, Ordering::Relaxed);
        let heap_ptr: *mut Heap = &mut *heap;
        heap.collector = Some(Box::new(ConcurrentCopying::new(heap_ptr, measure)));
        let ptr = SendPtr(heap_ptr);
        *heap.gc_thread.lock() = Some(
            std::thread::Builder::new()
                .name("gc thread".into())
                .spawn(move || gc_thread_routine(ptr))
                .unwrap(),
        );
        heap
    }

    // Accessors the collector drives everything through.

    pub fn collector(&self) -> &ConcurrentCopying {
        self.collector.as_ref().unwrap()
    }

    pub fn region_space(&self) -> &RegionSpace {
        &self.region_space
    }

    pub(crate) fn region_space_ptr(&self) -> *mut RegionSpace {
        &*self.region_space as *const RegionSpace as *mut RegionSpace
    }

    pub fn boot_image_space(&self) -> &BootImageSpace {
        &self.boot_image_space
    }

    pub fn non_moving_space(&self) -> &NonMovingSpace {
        &self.non_moving_space
    }

    pub fn large_object_space(&self) -> &LargeObjectSpace {
        &self.large_object_space
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    pub fn heap_bitmap(&self) -> &HeapBitmap {
        &self.heap_bitmap
    }

    pub fn thread_list(&self) -> &ThreadList {
        &self.thread_list
    }

    pub fn reference_processor(&self) -> &ReferenceProcessor {
        &self.reference_processor
    }

    pub fn use_tlab(&self) -> bool {
        self.options.use_tlab
    }

    pub fn options(&self) -> &HeapOptions {
        &self.options
    }

    pub fn num_bytes_allocated(&self) -> usize {
        self.num_bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn mod_union_table_for(&self, space_begin: *mut u8) -> Option<&ModUnionTable> {
        self.mod_union_tables
            .iter()
            .find(|t| t.covers(space_begin))
            .map(|t| &**t)
    }

    // Allocation & live stacks.

    pub fn allocation_stack(&self) -> &ObjectStack {
        unsafe { &*self.allocation_stack.load(Ordering::Relaxed) }
    }

    pub fn live_stack(&self) -> &ObjectStack {
        unsafe { &*self.live_stack.load(Ordering::Relaxed) }
    }

    /// Flip-time exchange of the allocation and live stacks.
    pub fn swap_stacks(&self) {
        let alloc = self.allocation_stack.load(Ordering::Relaxed);
        let live = self.live_stack.load(Ordering::Relaxed);
        self.allocation_stack.store(live, Ordering::Relaxed);
        self.live_stack.store(alloc, Ordering::Relaxed);
    }

    /// Pre-flip allocations become live in their space bitmaps so the sweep
    /// can see (and possibly reclaim) them.
    pub fn mark_alloc_stack_as_live(&self, stack: &ObjectStack) {
        for &obj in stack.slice() {
            if obj.is_null() {
                continue;
            }
            if self.non_moving_space.has_address(obj) {
                self.non_moving_space.live_bitmap().set(obj.cast());
            } else if self.large_object_space.has_address(obj) {
                self.large_object_space.live_bitmap().set(obj.cast());
            }
            // Region-space entries need no bitmap; liveness is per region.
        }
    }

    pub fn clear_marked_objects(&self) {
        self.non_moving_space.mark_bitmap().clear_all();
        self.large_object_space.mark_bitmap().clear_all();
    }

    pub(crate) fn record_free(&self, _objects: usize, bytes: usize) {
        let mut cur = self.num_bytes_allocated.load(Ordering::Relaxed);
        loop {
            let new = cur.saturating_sub(bytes);
            match self.num_bytes_allocated.compare_exchange_weak(
                cur,
                new,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(n) => cur = n,
            }
        }
    }

    pub(crate) fn add_bytes_allocated(&self, bytes: usize) {
        self.num_bytes_allocated.fetch_add(bytes, Ordering::SeqCst);
    }

    // Mutator management.

    pub fn attach_current_thread(&self) -> *mut Thread {
        self.thread_list
            .attach(self as *const Heap as *mut Heap)
    }

    pub fn detach_current_thread(&self, thread: *mut Thread) {
        self.thread_list.detach(thread);
    }

    /// Spawn an OS thread attached to the heap as a mutator.
    pub fn spawn_mutator<F>(&self, f: F) -> std::thread::JoinHandle<()>
    where
        F: FnOnce(&Thread) + Send + 'static,
    {
        let ptr = SendPtr(self as *const Heap as *mut Heap);
        std::thread::spawn(move || {
            let heap = unsafe { &*ptr.0 };
            let thread = heap.thread_list.attach(ptr.0);
            f(unsafe { &*thread });
            heap.thread_list.detach(thread);
        })
    }

    // Allocation.

    pub fn allocate<T: Collectable + 'static>(&self, thread: &Thread, value: T) -> Gc<T> {
        self.allocate_with_kind(thread, value, ReferenceKind::Regular)
    }

    pub fn allocate_reference<T: Collectable + 'static>(
        &self,
        thread: &Thread,
        kind: ReferenceKind,
        referent: Option<Gc<T>>,
    ) -> Gc<Reference<T>> {
        debug_assert_ne!(kind, ReferenceKind::Regular);
        self.allocate_with_kind(thread, Reference::new(referent), kind)
    }

    fn allocate_with_kind<T: Collectable + 'static>(
        &self,
        thread: &Thread,
        value: T,
        kind: ReferenceKind,
    ) -> Gc<T> {
        let size = allocation_size_of(&value);
        let large = size >= self.options.large_object_threshold;
        let memory = if large {
            self.large_object_space.alloc(size)
        } else {
            self.try_allocate_small(thread, size).cast()
        };
        if memory.is_null() {
            return self.allocate_slow_path(thread, value, size, kind, large);
        }
        if large {
            self.add_bytes_allocated(self.large_object_space.object_size(memory));
        }
        unsafe { self.finish_alloc(thread, memory, value, size, kind, large) }
    }

    fn try_allocate_small(&self, thread: &Thread, size: usize) -> *mut u8 {
        if self.options.use_tlab && size <= MAX_TLAB_ALLOCATION {
            let ptr = thread.alloc_tlab(size);
            if !ptr.is_null() {
                return ptr;
            }
            // Refill: fold the old TLAB's counts into its region first.
            self.region_space.revoke_thread_local_buffers(thread);
            let (start, len) = self.region_space.alloc_new_tlab();
            if start.is_null() {
                return null_mut();
            }
            thread.set_tlab(start, len);
            self.add_bytes_allocated(len);
            let ptr = thread.alloc_tlab(size);
            debug_assert!(!ptr.is_null());
            return ptr;
        }
        let ptr = self.region_space.alloc_nonvirtual(size);
        if !ptr.is_null() {
            self.add_bytes_allocated(size);
        }
        ptr.cast()
    }

    /// Out of memory on the fast path: collect (once normally, once
    /// clearing soft references) and retry. The value is rooted across the
    /// collections so the references embedded in it stay precise through a
    /// flip.
    #[cold]
    fn allocate_slow_path<T: Collectable + 'static>(
        &self,
        thread: &Thread,
        value: T,
        size: usize,
        kind: ReferenceKind,
        large: bool,
    ) -> Gc<T> {
        let stack = thread.shadow_stack();
        crate::letroot!(rooted = stack, Some(value));
        for clear_soft in [false, true] {
            self.collect_garbage_internal(thread, GcCause::Background, clear_soft);
            let memory = if large {
                self.large_object_space.alloc(size)
            } else {
                self.try_allocate_small(thread, size).cast()
            };
            if !memory.is_null() {
                if large {
                    self.add_bytes_allocated(self.large_object_space.object_size(memory));
                }
                let value = rooted.take().unwrap();
                return unsafe { self.finish_alloc(thread, memory, value, size, kind, large) };
            }
        }
        oom_abort()
    }

    unsafe fn finish_alloc<T: Collectable + 'static>(
        &self,
        thread: &Thread,
        memory: *mut HeapObjectHeader,
        value: T,
        size: usize,
        kind: ReferenceKind,
        large: bool,
    ) -> Gc<T> {
        let mut header = HeapObjectHeader::new(vtable_of::<T>(), size);
        if large {
            header.set_large();
        }
        if kind != ReferenceKind::Regular {
            header.set_reference_kind(kind);
        }
        memory.write(header);
        ((*memory).data() as *mut T).write(value);
        // Rooted from here: the push below may have to run a collection,
        // and the flip must see (and forward) this object.
        let stack = thread.shadow_stack();
        crate::letroot!(rooted = stack, Gc::<T>::from_header(memory));
        while !self.allocation_stack().atomic_push(rooted.header()) {
            // Stack full; a collection swaps in the (reset) other stack.
            self.collect_garbage_internal(thread, GcCause::Background, false);
        }
        let gc = *rooted;
        self.check_gc_policy(thread);
        gc
    }

    fn check_gc_policy(&self, _thread: &Thread) {
        if self.num_bytes_allocated() > self.gc_threshold.load(Ordering::Relaxed) {
            self.request_gc(GcCause::Background, false);
        }
    }

    /// Lay down a boot object before mutators start; it is immune to every
    /// collection.
    pub fn allocate_in_boot_space<T: Collectable + 'static>(&mut self, value: T) -> Gc<T> {
        match self.boot_image_space.alloc(value) {
            Some(gc) => gc,
            None => oom_abort(),
        }
    }

    // System weaks & roots.

    pub fn new_weak<T: Collectable + ?Sized>(&self, value: Gc<T>) -> Weak<T> {
        let slot = Box::into_raw(Box::new(AtomicPtr::new(value.header())));
        self.weak_slots.lock().push(slot);
        Weak {
            slot: unsafe { NonNull::new_unchecked(slot) },
            marker: std::marker::PhantomData,
        }
    }

    /// Null dead entries, forward moved ones.
    pub(crate) fn sweep_system_weaks(
        &self,
        is_marked: &mut dyn FnMut(*mut HeapObjectHeader) -> *mut HeapObjectHeader,
    ) {
        let slots = self.weak_slots.lock();
        for &slot in slots.iter() {
            unsafe {
                let obj = (*slot).load(Ordering::Relaxed);
                if obj.is_null() {
                    continue;
                }
                (*slot).store(is_marked(obj), Ordering::Relaxed);
            }
        }
    }

    /// Register a global strong root slot.
    pub fn add_global_root<T: Collectable + ?Sized>(&self, value: Gc<T>) -> NonNull<AtomicPtr<HeapObjectHeader>> {
        let slot = Box::into_raw(Box::new(AtomicPtr::new(value.header())));
        self.global_roots.lock().push(slot);
        unsafe { NonNull::new_unchecked(slot) }
    }

    pub(crate) fn visit_global_roots(&self, mut f: impl FnMut(&AtomicPtr<HeapObjectHeader>)) {
        let roots = self.global_roots.lock();
        for &slot in roots.iter() {
            f(unsafe { &*slot });
        }
    }

    pub fn add_post_marking_callback(&self, callback: Box<dyn Fn() + Send>) {
        self.post_marking_callbacks.lock().push(callback);
    }

    /// Hook point for runtime bookkeeping that must run once marking is
    /// done (class-loader cleanup and the like in a full runtime).
    pub(crate) fn run_post_marking_callbacks(&self) {
        for callback in self.post_marking_callbacks.lock().iter() {
            callback();
        }
    }

    /// Cleared soft/weak/finalizer/phantom references, for the embedder's
    /// reference queues.
    pub fn collect_cleared_references(&self) -> im::Vector<*mut HeapObjectHeader> {
        self.reference_processor.collect_cleared_references()
    }

    // Barriers.

    /// Dirty the holder's card after a reference store into it. Only
    /// writes into never-collected spaces need remembering.
    pub fn write_barrier<T: Collectable + ?Sized>(&self, holder: Gc<T>) {
        let addr = holder.header().cast::<u8>();
        if self.boot_image_space.has_address(holder.header()) {
            self.card_table.mark_card(addr);
        }
    }

    // GC triggering.

    /// Queue a collection without waiting for it.
    pub fn request_gc(&self, cause: GcCause, clear_soft: bool) {
        if self
            .gc_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            let _ = self.gc_request_snd.send(GcTask::Collect { cause, clear_soft });
        }
    }

    /// Run a full collection and wait for it to finish.
    pub fn collect_garbage(&self, thread: &Thread, clear_soft: bool) {
        self.collect_garbage_internal(thread, GcCause::Explicit, clear_soft);
    }

    pub(crate) fn collect_garbage_internal(&self, thread: &Thread, cause: GcCause, clear_soft: bool) {
        let start = self.gcs_completed_count.load(Ordering::Acquire);
        self.request_gc(cause, clear_soft);
        // The wait is a blocking section: the GC must be able to flip us.
        thread.enter_native();
        {
            let mut completed = self.gcs_completed.lock();
            while *completed <= start {
                self.gc_complete_condition.wait(&mut completed);
            }
        }
        thread.exit_native();
    }

    fn grow_for_utilization(&self) {
        let live = self.num_bytes_allocated();
        let new_threshold = (live * 2).max(self.options.initial_gc_threshold);
        self.gc_threshold.store(new_threshold, Ordering::Relaxed);
    }

    fn notify_gc_complete(&self) {
        self.grow_for_utilization();
        self.gc_pending.store(false, Ordering::Release);
        let mut completed = self.gcs_completed.lock();
        *completed += 1;
        self.gcs_completed_count.fetch_add(1, Ordering::Release);
        self.gc_complete_condition.notify_all();
    }

    pub fn dump_performance_info(&self, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        writeln!(out, "{:?}", self.options)?;
        self.collector().dump_performance_info(out)
    }
}

fn gc_thread_routine(heap: SendPtr) {
    let heap = unsafe { &*heap.0 };
    // The GC thread carries a thread block for TLS identity but is not a
    // mutator; it never appears in the thread list.
    let gc_thread = Box::into_raw(Box::new(Thread::new(
        0,
        heap as *const Heap as *mut Heap,
        true,
    )));
    Thread::set_current(gc_thread);
    while let Ok(task) = heap.gc_request_recv.recv() {
        match task {
            GcTask::Collect { cause, clear_soft } => {
                heap.collector().run_phases(cause, clear_soft);
                heap.notify_gc_complete();
            }
            GcTask::Shutdown => break,
        }
    }
    Thread::set_current(null_mut());
    unsafe { drop(Box::from_raw(gc_thread)) };
}

impl Drop for Heap {
    fn drop(&mut self) {
        let _ = self.gc_request_snd.send(GcTask::Shutdown);
        if let Some(handle) = self.gc_thread.lock().take() {
            let _ = handle.join();
        }
        for &slot in self.weak_slots.lock().iter() {
            unsafe { drop(Box::from_raw(slot)) };
        }
        for &slot in self.global_roots.lock().iter() {
            unsafe { drop(Box::from_raw(slot)) };
        }
    }
}

unsafe impl Send for Heap {}
unsafe impl Sync for Heap {}

/// The read barrier: a no-op unless the calling thread is in marking mode.
#[inline(always)]
pub fn read_barrier(ptr: *mut HeapObjectHeader) -> *mut HeapObjectHeader {
    if !USE_BAKER_READ_BARRIER {
        return ptr;
    }
    let thread = Thread::current();
    if thread.is_null() {
        return ptr;
    }
    let thread = unsafe { &*thread };
    if !thread.is_gc_marking() {
        return ptr;
    }
    thread.heap().collector().mark_from_read_barrier(ptr)
}

/// Referent loads funnel through the reference processor's access gate.
pub(crate) fn referent_slow_path(reference: *mut HeapObjectHeader) -> *mut HeapObjectHeader {
    let thread = Thread::current();
    assert!(!thread.is_null(), "referent read on an unattached thread");
    let thread = unsafe { &*thread };
    thread
        .heap()
        .reference_processor()
        .get_referent(thread, reference)
}

#[cold]
pub fn oom_abort() -> ! {
    eprintln!("OutOfMemory");
    std::process::abort();
}
