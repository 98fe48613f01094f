use std::{
    cell::Cell,
    ptr::null_mut,
    sync::atomic::AtomicUsize,
};

use atomic::{Atomic, Ordering};
use parking_lot::Mutex;

use crate::{
    header::{HeapObjectHeader, ALLOCATION_GRANULARITY},
    mmap::Mmap,
    thread::Thread,
    utils::{align_usize, formatted_size},
};

pub const REGION_SIZE: usize = 256 * 1024;
pub const REGION_SHIFT: usize = 18;

/// Allocation alignment inside regions; every allocation size is a multiple
/// of this.
pub const K_REGION_ALIGNMENT: usize = ALLOCATION_GRANULARITY;

const NO_REGION: usize = usize::MAX;
const LIVE_BYTES_UNSET: usize = usize::MAX;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionState {
    Free,
    Allocated,
    Large,
    LargeTail,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionType {
    /// Not in the region space, or a free region.
    None,
    ToSpace,
    FromSpace,
    UnevacFromSpace,
}

/// One fixed-size slice of the region space. State transitions happen under
/// the region lock or inside the flip pause; `top` moves by CAS so mutators
/// can bump-allocate without the lock.
pub struct Region {
    idx: usize,
    begin: *mut u8,
    top: Atomic<*mut u8>,
    end: *mut u8,
    state: Cell<RegionState>,
    rtype: Atomic<RegionType>,
    objects_allocated: AtomicUsize,
    live_bytes: AtomicUsize,
    is_newly_allocated: Cell<bool>,
    is_a_tlab: Cell<bool>,
}

impl Region {
    fn new(idx: usize, begin: *mut u8) -> Self {
        Self {
            idx,
            begin,
            top: Atomic::new(begin),
            end: (begin as usize + REGION_SIZE) as *mut u8,
            state: Cell::new(RegionState::Free),
            rtype: Atomic::new(RegionType::None),
            objects_allocated: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(LIVE_BYTES_UNSET),
            is_newly_allocated: Cell::new(false),
            is_a_tlab: Cell::new(false),
        }
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn begin(&self) -> *mut u8 {
        self.begin
    }

    pub fn top(&self) -> *mut u8 {
        self.top.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> RegionState {
        self.state.get()
    }

    pub fn rtype(&self) -> RegionType {
        self.rtype.load(Ordering::Relaxed)
    }

    pub fn is_free(&self) -> bool {
        self.state.get() == RegionState::Free
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    fn unfree(&self, state: RegionState) {
        debug_assert!(self.is_free());
        self.state.set(state);
        self.rtype.store(RegionType::ToSpace, Ordering::Relaxed);
        self.is_newly_allocated.set(true);
    }

    fn clear(&self) {
        self.state.set(RegionState::Free);
        self.rtype.store(RegionType::None, Ordering::Relaxed);
        self.top.store(self.begin, Ordering::Relaxed);
        self.objects_allocated.store(0, Ordering::Relaxed);
        self.live_bytes.store(LIVE_BYTES_UNSET, Ordering::Relaxed);
        self.is_newly_allocated.set(false);
        self.is_a_tlab.set(false);
    }

    /// Lock-free bump allocation within the region.
    fn alloc(&self, size: usize) -> *mut u8 {
        debug_assert!(size % K_REGION_ALIGNMENT == 0);
        let mut old = self.top.load(Ordering::Relaxed);
        loop {
            let new = (old as usize + size) as *mut u8;
            if new > self.end {
                return null_mut();
            }
            match self
                .top
                .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.objects_allocated.fetch_add(1, Ordering::Relaxed);
                    return old;
                }
                Err(cur) => old = cur,
            }
        }
    }

    fn allocated_bytes(&self) -> usize {
        self.top() as usize - self.begin as usize
    }
}

/// Region-based allocation space: the evacuation unit is a whole region.
/// At flip time non-free regions are classified from-space (will be
/// evacuated) or unevac-from-space (live objects marked in place); fresh
/// allocations go to to-space regions.
pub struct RegionSpace {
    mem_map: Mmap,
    begin: *mut u8,
    limit: *mut u8,
    num_regions: usize,
    regions: Box<[Region]>,
    region_lock: Mutex<()>,
    current_region: AtomicUsize,
}

impl RegionSpace {
    pub fn new(capacity: usize) -> Box<Self> {
        let capacity = align_usize(capacity, REGION_SIZE);
        let mem_map = Mmap::new(capacity);
        let begin = mem_map.start();
        let num_regions = capacity / REGION_SIZE;
        let regions = (0..num_regions)
            .map(|i| Region::new(i, (begin as usize + i * REGION_SIZE) as *mut u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self {
            limit: mem_map.end(),
            mem_map,
            begin,
            num_regions,
            regions,
            region_lock: Mutex::new(()),
            current_region: AtomicUsize::new(NO_REGION),
        })
    }

    pub fn begin(&self) -> *mut u8 {
        self.begin
    }

    pub fn limit(&self) -> *mut u8 {
        self.limit
    }

    pub fn capacity(&self) -> usize {
        self.mem_map.size()
    }

    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    #[inline]
    pub fn has_address(&self, obj: *const HeapObjectHeader) -> bool {
        (obj as usize) >= self.begin as usize && (obj as usize) < self.limit as usize
    }

    #[inline]
    fn region_for(&self, obj: *const HeapObjectHeader) -> &Region {
        debug_assert!(self.has_address(obj));
        &self.regions[(obj as usize - self.begin as usize) >> REGION_SHIFT]
    }

    /// O(1) classification; `None` for addresses outside the space and for
    /// free regions.
    #[inline]
    pub fn get_region_type(&self, obj: *const HeapObjectHeader) -> RegionType {
        if !self.has_address(obj) {
            return RegionType::None;
        }
        self.region_for(obj).rtype()
    }

    #[inline]
    pub fn is_in_to_space(&self, obj: *const HeapObjectHeader) -> bool {
        self.get_region_type(obj) == RegionType::ToSpace
    }

    #[inline]
    pub fn is_in_from_space(&self, obj: *const HeapObjectHeader) -> bool {
        self.get_region_type(obj) == RegionType::FromSpace
    }

    #[inline]
    pub fn is_in_unevac_from_space(&self, obj: *const HeapObjectHeader) -> bool {
        self.get_region_type(obj) == RegionType::UnevacFromSpace
    }

    /// TLAB-independent allocation. Never takes a TLAB region's memory.
    pub fn alloc_nonvirtual(&self, size: usize) -> *mut HeapObjectHeader {
        debug_assert!(size % K_REGION_ALIGNMENT == 0);
        if size > REGION_SIZE {
            return self.alloc_large(size);
        }
        loop {
            let cur = self.current_region.load(Ordering::Acquire);
            if cur != NO_REGION {
                let ptr = self.regions[cur].alloc(size);
                if !ptr.is_null() {
                    return ptr.cast();
                }
            }
            let guard = self.region_lock.lock();
            // Another thread may have installed a fresh region already.
            if self.current_region.load(Ordering::Relaxed) != cur {
                drop(guard);
                continue;
            }
            match self.regions.iter().position(|r| r.is_free()) {
                Some(idx) => {
                    self.regions[idx].unfree(RegionState::Allocated);
                    self.current_region.store(idx, Ordering::Release);
                }
                None => return null_mut(),
            }
        }
    }

    /// Contiguous multi-region allocation for objects larger than a region.
    fn alloc_large(&self, size: usize) -> *mut HeapObjectHeader {
        let needed = (size + REGION_SIZE - 1) / REGION_SIZE;
        let _guard = self.region_lock.lock();
        let mut run = 0;
        for idx in 0..self.num_regions {
            if self.regions[idx].is_free() {
                run += 1;
                if run == needed {
                    let first = idx + 1 - needed;
                    let mut remaining = size;
                    for (i, r) in self.regions[first..=idx].iter().enumerate() {
                        r.unfree(if i == 0 {
                            RegionState::Large
                        } else {
                            RegionState::LargeTail
                        });
                        let used = remaining.min(REGION_SIZE);
                        r.top
                            .store((r.begin as usize + used) as *mut u8, Ordering::Relaxed);
                        remaining -= used;
                    }
                    self.regions[first]
                        .objects_allocated
                        .store(1, Ordering::Relaxed);
                    return self.regions[first].begin.cast();
                }
            } else {
                run = 0;
            }
        }
        null_mut()
    }

    /// Hand out a whole region as a thread-local allocation buffer.
    pub fn alloc_new_tlab(&self) -> (*mut u8, usize) {
        let _guard = self.region_lock.lock();
        match self.regions.iter().position(|r| r.is_free()) {
            Some(idx) => {
                let r = &self.regions[idx];
                r.unfree(RegionState::Allocated);
                r.is_a_tlab.set(true);
                // The whole region is accounted to the thread up front.
                r.top.store(r.end, Ordering::Relaxed);
                (r.begin, REGION_SIZE)
            }
            None => (null_mut(), 0),
        }
    }

    /// Fold the thread's TLAB allocation counts into the owning region.
    /// The whole region stays accounted as allocated, unused tail included;
    /// the tail is zero and parses as free granules.
    pub fn revoke_thread_local_buffers(&self, thread: &Thread) {
        let (start, _cur, _end) = thread.tlab();
        if start.is_null() {
            return;
        }
        debug_assert!(self.has_address(start.cast()));
        let r = self.region_for(start.cast());
        r.objects_allocated
            .fetch_add(thread.tlab_objects(), Ordering::Relaxed);
        r.is_a_tlab.set(false);
        thread.reset_tlab();
    }

    /// Account an allocation that bypassed the bump pointer (skipped-block
    /// reuse).
    pub fn record_alloc(&self, obj: *mut HeapObjectHeader) {
        self.region_for(obj)
            .objects_allocated
            .fetch_add(1, Ordering::Relaxed);
    }

    /// The flip: classify every non-free region. With `force_evacuate_all`
    /// every non-free region is evacuated; otherwise only regions allocated
    /// since the previous collection are, and older regions are marked in
    /// place as unevac-from-space.
    pub fn set_from_space(&self, force_evacuate_all: bool) {
        let _guard = self.region_lock.lock();
        let mut large_head_evac = false;
        for r in self.regions.iter() {
            match r.state() {
                RegionState::Free => {}
                RegionState::Allocated | RegionState::Large => {
                    let evac = force_evacuate_all || r.is_newly_allocated.get();
                    if r.state() == RegionState::Large {
                        large_head_evac = evac;
                    }
                    self.classify(r, evac);
                }
                RegionState::LargeTail => {
                    self.classify(r, large_head_evac);
                }
            }
        }
        self.current_region.store(NO_REGION, Ordering::Release);
    }

    fn classify(&self, r: &Region, evac: bool) {
        if evac {
            r.rtype.store(RegionType::FromSpace, Ordering::Relaxed);
            r.live_bytes.store(LIVE_BYTES_UNSET, Ordering::Relaxed);
        } else {
            r.rtype.store(RegionType::UnevacFromSpace, Ordering::Relaxed);
            r.live_bytes.store(0, Ordering::Relaxed);
        }
        r.is_newly_allocated.set(false);
    }

    /// Release every evacuated region; surviving unevac regions rejoin the
    /// to-space. Returns (bytes, objects) cleared.
    pub fn clear_from_space(&self) -> (usize, usize) {
        let _guard = self.region_lock.lock();
        let mut bytes = 0;
        let mut objects = 0;
        for r in self.regions.iter() {
            match r.rtype() {
                RegionType::FromSpace => {
                    bytes += r.allocated_bytes();
                    objects += r.objects_allocated.load(Ordering::Relaxed);
                    r.clear();
                    self.mem_map.dontneed(r.begin, REGION_SIZE);
                }
                RegionType::UnevacFromSpace => {
                    r.rtype.store(RegionType::ToSpace, Ordering::Relaxed);
                }
                _ => {}
            }
            // Every surviving region has now been through a cycle; the next
            // non-forcing flip marks it in place.
            if !r.is_free() {
                r.is_newly_allocated.set(false);
            }
        }
        (bytes, objects)
    }

    /// Unevac live-byte accounting; always run by the GC thread.
    pub fn add_live_bytes(&self, obj: *const HeapObjectHeader, bytes: usize) {
        let r = self.region_for(obj);
        debug_assert_eq!(r.rtype(), RegionType::UnevacFromSpace);
        r.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Free a multi-region allocation that lost the copy race.
    pub fn free_large(&self, ptr: *mut HeapObjectHeader, bytes: usize) {
        debug_assert!(bytes > REGION_SIZE);
        let _guard = self.region_lock.lock();
        let first = (ptr as usize - self.begin as usize) >> REGION_SHIFT;
        let count = (bytes + REGION_SIZE - 1) / REGION_SIZE;
        for r in self.regions[first..first + count].iter() {
            r.clear();
            self.mem_map.dontneed(r.begin, REGION_SIZE);
        }
    }

    /// Walk every object in to-space regions. Only sound while the world is
    /// stopped (TLAB tails are unparseable otherwise).
    pub fn walk_to_space(&self, mut visitor: impl FnMut(*mut HeapObjectHeader)) {
        for r in self.regions.iter() {
            if r.rtype() != RegionType::ToSpace {
                continue;
            }
            if r.state() == RegionState::LargeTail {
                continue;
            }
            let mut p = r.begin as usize;
            // A large head's object size spans into the tail regions; the
            // size step below moves p past top after one visit.
            let top = r.top() as usize;
            while p < top {
                let obj = p as *mut HeapObjectHeader;
                let header = unsafe { &*obj };
                if header.is_allocated() {
                    visitor(obj);
                    let size = header.size().max(ALLOCATION_GRANULARITY);
                    p += align_usize(size, K_REGION_ALIGNMENT);
                } else {
                    p += ALLOCATION_GRANULARITY;
                }
            }
        }
    }

    fn sum_over(&self, rtype: RegionType) -> (usize, usize) {
        let mut bytes = 0;
        let mut objects = 0;
        for r in self.regions.iter() {
            if r.rtype() == rtype {
                bytes += r.allocated_bytes();
                objects += r.objects_allocated.load(Ordering::Relaxed);
            }
        }
        (bytes, objects)
    }

    pub fn bytes_allocated_in_from_space(&self) -> usize {
        self.sum_over(RegionType::FromSpace).0
    }

    pub fn objects_allocated_in_from_space(&self) -> usize {
        self.sum_over(RegionType::FromSpace).1
    }

    pub fn bytes_allocated_in_unevac_from_space(&self) -> usize {
        self.sum_over(RegionType::UnevacFromSpace).0
    }

    pub fn objects_allocated_in_unevac_from_space(&self) -> usize {
        self.sum_over(RegionType::UnevacFromSpace).1
    }

    /// Total objects allocated in non-free regions.
    pub fn objects_allocated(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| !r.is_free())
            .map(|r| r.objects_allocated.load(Ordering::Relaxed))
            .sum()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| !r.is_free())
            .map(|r| r.allocated_bytes())
            .sum()
    }

    pub fn from_space_size(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.rtype() == RegionType::FromSpace)
            .count()
            * REGION_SIZE
    }

    pub fn unevac_from_space_size(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.rtype() == RegionType::UnevacFromSpace)
            .count()
            * REGION_SIZE
    }

    pub fn to_space_size(&self) -> usize {
        self.regions
            .iter()
            .filter(|r| r.rtype() == RegionType::ToSpace)
            .count()
            * REGION_SIZE
    }

    pub fn dump_non_free_regions(&self) {
        for r in self.regions.iter().filter(|r| !r.is_free()) {
            log::error!(
                "region {}: state={:?} type={:?} used={} objects={} live={}",
                r.idx,
                r.state(),
                r.rtype(),
                formatted_size(r.allocated_bytes()),
                r.objects_allocated.load(Ordering::Relaxed),
                match r.live_bytes() {
                    LIVE_BYTES_UNSET => "-".to_string(),
                    n => formatted_size(n).to_string(),
                }
            );
        }
    }
}

unsafe impl Send for RegionSpace {}
// Cell fields of Region are only mutated under the region lock or inside
// the flip pause.
unsafe impl Sync for RegionSpace {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocation_and_classification() {
        let space = RegionSpace::new(4 * REGION_SIZE);
        let a = space.alloc_nonvirtual(64);
        let b = space.alloc_nonvirtual(128);
        assert!(!a.is_null() && !b.is_null());
        assert_eq!(b as usize - a as usize, 64);
        assert_eq!(space.get_region_type(a), RegionType::ToSpace);
        assert_eq!(space.objects_allocated(), 2);
        assert_eq!(space.get_region_type(space.limit() as _), RegionType::None);
    }

    #[test]
    fn flip_marks_new_regions_as_from_space() {
        let space = RegionSpace::new(4 * REGION_SIZE);
        let a = space.alloc_nonvirtual(64);
        space.set_from_space(false);
        assert_eq!(space.get_region_type(a), RegionType::FromSpace);
        // Fresh allocations after the flip land in to-space regions.
        let c = space.alloc_nonvirtual(64);
        assert_eq!(space.get_region_type(c), RegionType::ToSpace);
        let (bytes, objects) = space.clear_from_space();
        assert_eq!(objects, 1);
        assert_eq!(bytes, 64);
        assert_eq!(space.get_region_type(a), RegionType::None);
    }

    #[test]
    fn unevac_regions_survive_and_account_live_bytes() {
        let space = RegionSpace::new(4 * REGION_SIZE);
        let a = space.alloc_nonvirtual(64);
        // First flip evacuates (newly allocated), second one sees an old
        // region: simulate survival by re-allocating after a cleared cycle.
        space.set_from_space(false);
        space.clear_from_space();
        let b = space.alloc_nonvirtual(64);
        // Age the region: clear the newly-allocated flag via a flip cycle.
        space.set_from_space(false);
        assert_eq!(space.get_region_type(b), RegionType::FromSpace);
        space.clear_from_space();
        let c = space.alloc_nonvirtual(64);
        let r = space.region_for(c);
        r.is_newly_allocated.set(false);
        space.set_from_space(false);
        assert_eq!(space.get_region_type(c), RegionType::UnevacFromSpace);
        space.add_live_bytes(c, 64);
        assert_eq!(space.bytes_allocated_in_unevac_from_space(), 64);
        space.clear_from_space();
        assert_eq!(space.get_region_type(c), RegionType::ToSpace);
        let _ = a;
    }

    #[test]
    fn large_allocation_spans_regions() {
        let space = RegionSpace::new(8 * REGION_SIZE);
        let size = align_usize(REGION_SIZE * 2 + 1024, K_REGION_ALIGNMENT);
        let obj = space.alloc_nonvirtual(size);
        assert!(!obj.is_null());
        assert_eq!(space.get_region_type(obj), RegionType::ToSpace);
        assert_eq!(space.bytes_allocated(), size);
        space.free_large(obj, size);
        assert_eq!(space.bytes_allocated(), 0);
    }

    #[test]
    fn runs_out_of_regions() {
        let space = RegionSpace::new(2 * REGION_SIZE);
        assert!(!space.alloc_nonvirtual(REGION_SIZE).is_null());
        assert!(!space.alloc_nonvirtual(REGION_SIZE).is_null());
        assert!(space.alloc_nonvirtual(64).is_null());
    }
}
