use atomic::{Atomic, Ordering};

use crate::{
    api::{allocation_size_of, vtable_of, Collectable, Gc},
    header::HeapObjectHeader,
    mmap::Mmap,
    space_bitmap::ContinuousSpaceBitmap,
    utils::align_usize,
};

/// How a space behaves across collections.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcRetentionPolicy {
    /// Never collected; becomes immune to the copying collector.
    NeverCollect,
    /// Swept but never moved.
    AlwaysCollect,
}

#[repr(C)]
pub struct ContinuousSpace {
    name: &'static str,
    begin: *mut u8,
    end: Atomic<*mut u8>,
    limit: *mut u8,
    policy: GcRetentionPolicy,
}

impl ContinuousSpace {
    pub fn new(
        name: &'static str,
        begin: *mut u8,
        end: *mut u8,
        limit: *mut u8,
        policy: GcRetentionPolicy,
    ) -> Self {
        Self {
            name,
            begin,
            end: Atomic::new(end),
            limit,
            policy,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn begin(&self) -> *mut u8 {
        self.begin
    }

    pub fn end(&self) -> *mut u8 {
        self.end.load(Ordering::Relaxed)
    }

    pub fn set_end(&self, end: *mut u8) {
        self.end.store(end, Ordering::Relaxed);
    }

    pub fn limit(&self) -> *mut u8 {
        self.limit
    }

    pub fn capacity(&self) -> usize {
        self.limit as usize - self.begin as usize
    }

    pub fn policy(&self) -> GcRetentionPolicy {
        self.policy
    }

    pub fn has_address(&self, obj: *const HeapObjectHeader) -> bool {
        (obj as usize) >= self.begin as usize && (obj as usize) < self.limit as usize
    }
}

unsafe impl Send for ContinuousSpace {}
unsafe impl Sync for ContinuousSpace {}

/// Never-collected bump space holding boot objects; the immune-space
/// prototype. Populated single-threaded before mutators start.
pub struct BootImageSpace {
    space: ContinuousSpace,
    mem_map: Mmap,
    live_bitmap: Box<ContinuousSpaceBitmap>,
}

impl BootImageSpace {
    pub fn create(name: &'static str, capacity: usize) -> Box<Self> {
        let mem_map = Mmap::new(capacity);
        let begin = mem_map.start();
        let limit = mem_map.end();
        let live_bitmap = Box::new(ContinuousSpaceBitmap::create(
            "boot image live bitmap",
            begin,
            capacity,
        ));
        Box::new(Self {
            space: ContinuousSpace::new(name, begin, begin, limit, GcRetentionPolicy::NeverCollect),
            mem_map,
            live_bitmap,
        })
    }

    pub fn space(&self) -> &ContinuousSpace {
        &self.space
    }

    pub fn live_bitmap(&self) -> &ContinuousSpaceBitmap {
        &self.live_bitmap
    }

    pub fn live_bitmap_ptr(&mut self) -> *mut ContinuousSpaceBitmap {
        &mut *self.live_bitmap
    }

    pub fn has_address(&self, obj: *const HeapObjectHeader) -> bool {
        self.space.has_address(obj)
    }

    /// Bump-allocate a boot object. Not thread safe; boot objects are laid
    /// down before the runtime goes multi-threaded.
    pub fn alloc<T: Collectable + 'static>(&mut self, value: T) -> Option<Gc<T>> {
        let size = allocation_size_of(&value);
        let cur = self.space.end();
        let new = (cur as usize + size) as *mut u8;
        if new > self.space.limit() {
            return None;
        }
        self.space.set_end(new);
        unsafe {
            let header = cur.cast::<HeapObjectHeader>();
            header.write(HeapObjectHeader::new(vtable_of::<T>(), size));
            ((*header).data() as *mut T).write(value);
            self.live_bitmap.set(cur);
            Some(Gc::from_header(header))
        }
    }

    pub fn walk(&self, mut visitor: impl FnMut(*mut HeapObjectHeader)) {
        let mut p = self.space.begin() as usize;
        let end = self.space.end() as usize;
        while p < end {
            let obj = p as *mut HeapObjectHeader;
            visitor(obj);
            p += align_usize(
                unsafe { (*obj).size() },
                crate::header::ALLOCATION_GRANULARITY,
            );
        }
    }

    pub fn mem_map(&self) -> &Mmap {
        &self.mem_map
    }
}

unsafe impl Send for BootImageSpace {}
unsafe impl Sync for BootImageSpace {}
