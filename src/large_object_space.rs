use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::{
    header::HeapObjectHeader,
    mmap::Mmap,
    space::{ContinuousSpace, GcRetentionPolicy},
    space_bitmap::LargeObjectBitmap,
    utils::align_usize,
};

pub const LARGE_OBJECT_ALIGNMENT: usize = 4096;

struct LosChunks {
    /// addr -> size of free chunks.
    free: BTreeMap<usize, usize>,
    /// addr -> size of live allocations.
    allocations: BTreeMap<usize, usize>,
    bytes_allocated: usize,
}

/// Page-granular space for objects above the large-object threshold. One
/// mapped extent so the page-aligned mark bitmap covers all of it. Objects
/// here never move.
pub struct LargeObjectSpace {
    space: ContinuousSpace,
    mem_map: Mmap,
    chunks: Mutex<LosChunks>,
    live_bitmap: Box<LargeObjectBitmap>,
    mark_bitmap: Box<LargeObjectBitmap>,
}

impl LargeObjectSpace {
    pub fn create(name: &'static str, capacity: usize) -> Box<Self> {
        let capacity = align_usize(capacity, LARGE_OBJECT_ALIGNMENT);
        let mem_map = Mmap::new(capacity);
        let begin = mem_map.start();
        let mut free = BTreeMap::new();
        free.insert(begin as usize, capacity);
        let live_bitmap = Box::new(LargeObjectBitmap::create("los live bitmap", begin, capacity));
        let mark_bitmap = Box::new(LargeObjectBitmap::create("los mark bitmap", begin, capacity));
        Box::new(Self {
            space: ContinuousSpace::new(
                name,
                begin,
                mem_map.end(),
                mem_map.end(),
                GcRetentionPolicy::AlwaysCollect,
            ),
            mem_map,
            chunks: Mutex::new(LosChunks {
                free,
                allocations: BTreeMap::new(),
                bytes_allocated: 0,
            }),
            live_bitmap,
            mark_bitmap,
        })
    }

    pub fn space(&self) -> &ContinuousSpace {
        &self.space
    }

    pub fn has_address(&self, obj: *const HeapObjectHeader) -> bool {
        self.space.has_address(obj)
    }

    pub fn live_bitmap(&self) -> &LargeObjectBitmap {
        &self.live_bitmap
    }

    pub fn mark_bitmap(&self) -> &LargeObjectBitmap {
        &self.mark_bitmap
    }

    pub fn live_bitmap_ptr(&mut self) -> *mut LargeObjectBitmap {
        &mut *self.live_bitmap
    }

    pub fn mark_bitmap_ptr(&mut self) -> *mut LargeObjectBitmap {
        &mut *self.mark_bitmap
    }

    pub fn bytes_allocated(&self) -> usize {
        self.chunks.lock().bytes_allocated
    }

    pub fn alloc(&self, size: usize) -> *mut HeapObjectHeader {
        let size = align_usize(size, LARGE_OBJECT_ALIGNMENT);
        let mut chunks = self.chunks.lock();
        let found = chunks
            .free
            .iter()
            .find(|(_, &chunk_size)| chunk_size >= size)
            .map(|(&addr, &chunk_size)| (addr, chunk_size));
        let (addr, chunk_size) = match found {
            Some(pair) => pair,
            None => return std::ptr::null_mut(),
        };
        chunks.free.remove(&addr);
        if chunk_size > size {
            chunks.free.insert(addr + size, chunk_size - size);
        }
        chunks.allocations.insert(addr, size);
        chunks.bytes_allocated += size;
        // The live bit is set later, when the allocation stack entry is
        // marked live at the next flip; until then the object is invisible
        // to the sweep.
        addr as *mut HeapObjectHeader
    }

    pub fn object_size(&self, obj: *const HeapObjectHeader) -> usize {
        *self
            .chunks
            .lock()
            .allocations
            .get(&(obj as usize))
            .expect("not a large object")
    }

    pub fn free(&self, obj: *mut HeapObjectHeader) -> usize {
        let mut chunks = self.chunks.lock();
        let addr = obj as usize;
        let size = chunks.allocations.remove(&addr).expect("not a large object");
        chunks.bytes_allocated -= size;
        chunks.free.insert(addr, size);
        self.live_bitmap.clear(obj.cast());
        self.mark_bitmap.clear(obj.cast());
        self.mem_map.dontneed(obj.cast(), size);
        size
    }

    /// Free everything live but unmarked. Returns (objects, bytes) freed.
    pub fn sweep(&self, swap_bitmaps: bool) -> (usize, usize) {
        let (live, mark): (&LargeObjectBitmap, &LargeObjectBitmap) = if swap_bitmaps {
            (&self.mark_bitmap, &self.live_bitmap)
        } else {
            (&self.live_bitmap, &self.mark_bitmap)
        };
        let mut dead = Vec::new();
        live.visit_marked_range(
            self.space.begin() as usize,
            self.space.limit() as usize,
            |obj| {
                if !mark.test(obj.cast()) {
                    dead.push(obj);
                }
            },
        );
        let mut bytes = 0;
        let objects = dead.len();
        for obj in dead {
            bytes += self.free(obj);
        }
        (objects, bytes)
    }

    pub fn swap_bitmaps(&self) {
        self.live_bitmap.swap_contents_with(&self.mark_bitmap);
    }
}

unsafe impl Send for LargeObjectSpace {}
unsafe impl Sync for LargeObjectSpace {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_reuse() {
        let los = LargeObjectSpace::create("los", 1 << 20);
        let a = los.alloc(5000);
        assert!(!a.is_null());
        assert_eq!(los.object_size(a), align_usize(5000, LARGE_OBJECT_ALIGNMENT));
        let freed = los.free(a);
        assert_eq!(freed, align_usize(5000, LARGE_OBJECT_ALIGNMENT));
        assert_eq!(los.bytes_allocated(), 0);
        let b = los.alloc(4096);
        assert_eq!(b, a);
    }

    #[test]
    fn sweep_frees_live_unmarked_only() {
        let los = LargeObjectSpace::create("los", 1 << 20);
        let a = los.alloc(4096);
        let b = los.alloc(4096);
        let fresh = los.alloc(4096);
        // a and b went through a flip (alloc-stack marking); fresh did not.
        los.live_bitmap().set(a.cast());
        los.live_bitmap().set(b.cast());
        los.mark_bitmap().set(b.cast());
        let (objects, bytes) = los.sweep(false);
        assert_eq!(objects, 1);
        assert_eq!(bytes, 4096);
        assert!(!los.live_bitmap().test(a.cast()));
        assert!(los.live_bitmap().test(b.cast()));
        // The un-flipped allocation was invisible to the sweep.
        assert_eq!(los.object_size(fresh), 4096);
    }
}
