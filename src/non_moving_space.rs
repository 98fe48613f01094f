use std::cell::UnsafeCell;

use parking_lot::Mutex;
use rosalloc::{
    dedicated_full_run,
    defs::{PageReleaseMode, DEFAULT_PAGE_RELEASE_THRESHOLD, NUM_THREAD_LOCAL_SIZE_BRACKETS},
    Rosalloc, Run,
};

use crate::{
    header::HeapObjectHeader,
    mmap::Mmap,
    space::{ContinuousSpace, GcRetentionPolicy},
    space_bitmap::ContinuousSpaceBitmap,
};

/// Rosalloc-backed space objects are copied into when the to-space runs
/// dry. Objects here never move; liveness is tracked in the mark bitmap and
/// dead objects are swept.
pub struct NonMovingSpace {
    space: ContinuousSpace,
    mem_map: Mmap,
    rosalloc: *mut Rosalloc,
    runs: UnsafeCell<[*mut Run; NUM_THREAD_LOCAL_SIZE_BRACKETS]>,
    lock: Mutex<()>,
    live_bitmap: Box<ContinuousSpaceBitmap>,
    mark_bitmap: Box<ContinuousSpaceBitmap>,
}

impl NonMovingSpace {
    pub fn create(name: &'static str, initial_size: usize, capacity: usize) -> Box<Self> {
        assert!(initial_size <= capacity);
        let mem_map = Mmap::new(capacity);
        let begin = mem_map.start();
        let rosalloc = unsafe {
            Rosalloc::new(
                begin,
                initial_size,
                capacity,
                PageReleaseMode::SizeAndEnd,
                DEFAULT_PAGE_RELEASE_THRESHOLD,
            )
        };
        let live_bitmap = Box::new(ContinuousSpaceBitmap::create(
            "non moving live bitmap",
            begin,
            capacity,
        ));
        let mark_bitmap = Box::new(ContinuousSpaceBitmap::create(
            "non moving mark bitmap",
            begin,
            capacity,
        ));
        let end = (begin as usize + initial_size) as *mut u8;
        let mut this = Box::new(Self {
            space: ContinuousSpace::new(
                name,
                begin,
                end,
                mem_map.end(),
                GcRetentionPolicy::AlwaysCollect,
            ),
            mem_map,
            rosalloc,
            runs: UnsafeCell::new([dedicated_full_run(); NUM_THREAD_LOCAL_SIZE_BRACKETS]),
            lock: Mutex::new(()),
            live_bitmap,
            mark_bitmap,
        });
        unsafe {
            (*rosalloc).set_footprint_limit(initial_size);
            (*rosalloc).set_morecore(morecore, (&mut *this as *mut Self).cast());
        }
        this
    }

    pub fn space(&self) -> &ContinuousSpace {
        &self.space
    }

    pub fn has_address(&self, obj: *const HeapObjectHeader) -> bool {
        self.space.has_address(obj)
    }

    pub fn live_bitmap(&self) -> &ContinuousSpaceBitmap {
        &self.live_bitmap
    }

    pub fn mark_bitmap(&self) -> &ContinuousSpaceBitmap {
        &self.mark_bitmap
    }

    pub fn live_bitmap_ptr(&mut self) -> *mut ContinuousSpaceBitmap {
        &mut *self.live_bitmap
    }

    pub fn mark_bitmap_ptr(&mut self) -> *mut ContinuousSpaceBitmap {
        &mut *self.mark_bitmap
    }

    fn morecore(&self, increment: isize) {
        let end = self.space.end() as isize + increment;
        debug_assert!(end as usize <= self.space.limit() as usize);
        self.space.set_end(end as *mut u8);
    }

    /// Allocate raw bytes, growing the footprint up to capacity. Returns
    /// (ptr, bytes_allocated); null when the space itself is exhausted.
    pub fn alloc(&self, size: usize) -> (*mut HeapObjectHeader, usize) {
        let _guard = self.lock.lock();
        let mut bytes_allocated = 0;
        let mut usable_size = 0;
        let mut bytes_tl_bulk_allocated = 0;
        unsafe {
            (*self.rosalloc).set_footprint_limit(self.space.capacity());
            let ptr = (*self.rosalloc).alloc::<true>(
                &mut *self.runs.get(),
                size,
                &mut bytes_allocated,
                &mut usable_size,
                &mut bytes_tl_bulk_allocated,
            );
            let footprint = (*self.rosalloc).footprint();
            (*self.rosalloc).set_footprint_limit(footprint);
            if ptr.is_null() {
                return (std::ptr::null_mut(), 0);
            }
            // No live bit yet: liveness comes from the mark bit the caller
            // sets (fall-back copies) or from alloc-stack marking.
            (ptr.cast(), bytes_allocated)
        }
    }

    /// Free one object (a lost to-space copy).
    pub fn free(&self, obj: *mut HeapObjectHeader) {
        let _guard = self.lock.lock();
        self.live_bitmap.clear(obj.cast());
        self.mark_bitmap.clear(obj.cast());
        unsafe {
            (*self.rosalloc).bulk_free(&[obj.cast()]);
        }
    }

    /// Free everything live but unmarked. Returns (objects, bytes) freed.
    pub fn sweep(&self, swap_bitmaps: bool) -> (usize, usize) {
        let (live, mark): (&ContinuousSpaceBitmap, &ContinuousSpaceBitmap) = if swap_bitmaps {
            (&self.mark_bitmap, &self.live_bitmap)
        } else {
            (&self.live_bitmap, &self.mark_bitmap)
        };
        let mut dead: Vec<*mut u8> = Vec::new();
        live.visit_marked_range(
            self.space.begin() as usize,
            self.space.end() as usize,
            |obj| {
                if !mark.test(obj.cast()) {
                    dead.push(obj.cast());
                }
            },
        );
        if dead.is_empty() {
            return (0, 0);
        }
        let _guard = self.lock.lock();
        for &ptr in dead.iter() {
            live.clear(ptr);
        }
        let bytes = unsafe { (*self.rosalloc).bulk_free(&dead) };
        (dead.len(), bytes)
    }

    /// The marked set becomes the live set and vice versa (word-wise
    /// exchange; the stale mark bits are cleared at the end of collection).
    pub fn swap_bitmaps(&self) {
        self.live_bitmap.swap_contents_with(&self.mark_bitmap);
    }

    pub fn revoke_thread_local_runs(&self) {
        let _guard = self.lock.lock();
        unsafe {
            (*self.rosalloc).revoke_thread_local_runs(&mut *self.runs.get());
        }
    }
}

extern "C" fn morecore(_rosalloc: *mut Rosalloc, increment: isize, data: *mut u8) {
    unsafe {
        (*data.cast::<NonMovingSpace>()).morecore(increment);
    }
}

unsafe impl Send for NonMovingSpace {}
unsafe impl Sync for NonMovingSpace {}
