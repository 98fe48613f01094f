use std::{fmt, mem::size_of};

use atomic::{Atomic, Ordering};
use memmap2::MmapMut;

use crate::header::{HeapObjectHeader, ALLOCATION_GRANULARITY};

const BITS_PER_WORD: usize = size_of::<usize>() * 8;

/// One mark bit per `ALIGN` bytes of a space, memmap-backed.
pub struct SpaceBitmap<const ALIGN: usize> {
    mem_map: MmapMut,
    bitmap_begin: *mut Atomic<usize>,
    bitmap_size: usize,
    heap_begin: usize,
    heap_limit: usize,
    name: &'static str,
}

pub type ContinuousSpaceBitmap = SpaceBitmap<ALLOCATION_GRANULARITY>;
pub type LargeObjectBitmap = SpaceBitmap<4096>;

impl<const ALIGN: usize> SpaceBitmap<ALIGN> {
    pub fn create(name: &'static str, heap_begin: *mut u8, heap_capacity: usize) -> Self {
        let bitmap_size = Self::compute_bitmap_size(heap_capacity);
        let mem_map = MmapMut::map_anon(bitmap_size).expect("failed to map bitmap");
        let bitmap_begin = mem_map.as_ptr() as *mut Atomic<usize>;
        Self {
            mem_map,
            bitmap_begin,
            bitmap_size,
            heap_begin: heap_begin as usize,
            heap_limit: heap_begin as usize + heap_capacity,
            name,
        }
    }

    pub fn compute_bitmap_size(capacity: usize) -> usize {
        let bytes_covered_per_word = ALIGN * BITS_PER_WORD;
        crate::utils::round_up(capacity as u64, bytes_covered_per_word as u64) as usize
            / bytes_covered_per_word
            * size_of::<usize>()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }

    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }

    #[inline]
    pub fn has_address(&self, obj: *const u8) -> bool {
        (obj as usize) >= self.heap_begin && (obj as usize) < self.heap_limit
    }

    #[inline(always)]
    const fn offset_to_index(offset: usize) -> usize {
        offset / ALIGN / BITS_PER_WORD
    }

    #[inline(always)]
    const fn index_to_offset(index: usize) -> usize {
        index * ALIGN * BITS_PER_WORD
    }

    #[inline(always)]
    const fn offset_to_mask(offset: usize) -> usize {
        1 << ((offset / ALIGN) % BITS_PER_WORD)
    }

    #[inline]
    fn word(&self, index: usize) -> &Atomic<usize> {
        debug_assert!(
            index < self.bitmap_size / size_of::<usize>(),
            "bitmap {}: index {} out of bounds",
            self.name,
            index
        );
        unsafe { &*self.bitmap_begin.add(index) }
    }

    #[inline]
    pub fn test(&self, obj: *const u8) -> bool {
        debug_assert!(self.has_address(obj), "{}: bad address {:p}", self.name, obj);
        let offset = obj as usize - self.heap_begin;
        self.word(Self::offset_to_index(offset)).load(Ordering::Relaxed)
            & Self::offset_to_mask(offset)
            != 0
    }

    #[inline]
    fn modify(&self, obj: *const u8, set: bool) -> bool {
        debug_assert!(self.has_address(obj), "{}: bad address {:p}", self.name, obj);
        let offset = obj as usize - self.heap_begin;
        let mask = Self::offset_to_mask(offset);
        let word = self.word(Self::offset_to_index(offset));
        let old = word.load(Ordering::Relaxed);
        if set {
            if old & mask == 0 {
                word.store(old | mask, Ordering::Relaxed);
            }
        } else {
            word.store(old & !mask, Ordering::Relaxed);
        }
        old & mask != 0
    }

    /// Returns the previous state of the bit.
    #[inline(always)]
    pub fn set(&self, obj: *const u8) -> bool {
        self.modify(obj, true)
    }

    #[inline(always)]
    pub fn clear(&self, obj: *const u8) -> bool {
        self.modify(obj, false)
    }

    /// Returns true iff the bit was already set; exactly one concurrent
    /// caller observes false.
    #[inline]
    pub fn atomic_test_and_set(&self, obj: *const u8) -> bool {
        debug_assert!(self.has_address(obj), "{}: bad address {:p}", self.name, obj);
        let offset = obj as usize - self.heap_begin;
        let mask = Self::offset_to_mask(offset);
        let word = self.word(Self::offset_to_index(offset));
        let mut old = word.load(Ordering::Relaxed);
        loop {
            if old & mask != 0 {
                return true;
            }
            match word.compare_exchange_weak(
                old,
                old | mask,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return false,
                Err(cur) => old = cur,
            }
        }
    }

    /// Word-wise exchange of two bitmaps over the same range. Only sound
    /// while nobody is marking (sweep time).
    pub fn swap_contents_with(&self, other: &SpaceBitmap<ALIGN>) {
        debug_assert_eq!(self.heap_begin, other.heap_begin);
        debug_assert_eq!(self.bitmap_size, other.bitmap_size);
        for i in 0..self.bitmap_size / size_of::<usize>() {
            let a = self.word(i).load(Ordering::Relaxed);
            let b = other.word(i).load(Ordering::Relaxed);
            self.word(i).store(b, Ordering::Relaxed);
            other.word(i).store(a, Ordering::Relaxed);
        }
    }

    pub fn clear_all(&self) {
        unsafe {
            std::ptr::write_bytes(self.bitmap_begin as *mut u8, 0, self.bitmap_size);
        }
    }

    /// Visit every set bit whose address lies in `[visit_begin, visit_end)`.
    /// Bits may be flipped during the walk; each word is loaded once.
    pub fn visit_marked_range(
        &self,
        visit_begin: usize,
        visit_end: usize,
        mut visitor: impl FnMut(*mut HeapObjectHeader),
    ) {
        debug_assert!(visit_begin >= self.heap_begin && visit_end <= self.heap_limit);
        if visit_begin >= visit_end {
            return;
        }
        let offset_start = visit_begin - self.heap_begin;
        let offset_end = visit_end - 1 - self.heap_begin;
        let index_start = Self::offset_to_index(offset_start);
        let index_end = Self::offset_to_index(offset_end);
        for index in index_start..=index_end {
            let mut w = self.word(index).load(Ordering::Relaxed);
            if w == 0 {
                continue;
            }
            let base = self.heap_begin + Self::index_to_offset(index);
            while w != 0 {
                let shift = w.trailing_zeros() as usize;
                let addr = base + shift * ALIGN;
                if addr >= visit_begin && addr < visit_end {
                    visitor(addr as *mut HeapObjectHeader);
                }
                w &= w - 1;
            }
        }
    }
}

impl<const ALIGN: usize> fmt::Debug for SpaceBitmap<ALIGN> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [begin={:#x},end={:#x}]",
            self.name, self.heap_begin, self.heap_limit
        )
    }
}

unsafe impl<const ALIGN: usize> Send for SpaceBitmap<ALIGN> {}
unsafe impl<const ALIGN: usize> Sync for SpaceBitmap<ALIGN> {}

/// Heap-wide registry dispatching an address to the bitmap that covers it:
/// continuous-space bitmaps for the granule-aligned spaces, a page-aligned
/// bitmap for the large object space. Every non-region object belongs to
/// exactly one of the two.
pub struct HeapBitmap {
    continuous: Vec<*mut ContinuousSpaceBitmap>,
    large: Vec<*mut LargeObjectBitmap>,
}

impl HeapBitmap {
    pub fn new() -> Self {
        Self {
            continuous: Vec::new(),
            large: Vec::new(),
        }
    }

    pub fn add_continuous_space_bitmap(&mut self, bitmap: *mut ContinuousSpaceBitmap) {
        self.continuous.push(bitmap);
    }

    pub fn add_large_object_bitmap(&mut self, bitmap: *mut LargeObjectBitmap) {
        self.large.push(bitmap);
    }

    pub fn get_continuous_space_bitmap(
        &self,
        obj: *const HeapObjectHeader,
    ) -> Option<&ContinuousSpaceBitmap> {
        for &bitmap in self.continuous.iter() {
            let bitmap = unsafe { &*bitmap };
            if bitmap.has_address(obj.cast()) {
                return Some(bitmap);
            }
        }
        None
    }

    pub fn get_large_object_bitmap(
        &self,
        obj: *const HeapObjectHeader,
    ) -> Option<&LargeObjectBitmap> {
        for &bitmap in self.large.iter() {
            let bitmap = unsafe { &*bitmap };
            if bitmap.has_address(obj.cast()) {
                return Some(bitmap);
            }
        }
        None
    }

    /// Visit every marked object in every registered bitmap.
    pub fn visit(&self, mut visitor: impl FnMut(*mut HeapObjectHeader)) {
        for &bitmap in self.continuous.iter() {
            let bitmap = unsafe { &*bitmap };
            bitmap.visit_marked_range(bitmap.heap_begin(), bitmap.heap_limit(), &mut visitor);
        }
        for &bitmap in self.large.iter() {
            let bitmap = unsafe { &*bitmap };
            bitmap.visit_marked_range(bitmap.heap_begin(), bitmap.heap_limit(), &mut visitor);
        }
    }
}

unsafe impl Send for HeapBitmap {}
unsafe impl Sync for HeapBitmap {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_test_clear() {
        let base = 0x10000000 as *mut u8;
        let bitmap = ContinuousSpaceBitmap::create("test bitmap", base, 64 * 1024);
        let obj = 0x10000040 as *const u8;
        assert!(!bitmap.test(obj));
        assert!(!bitmap.set(obj));
        assert!(bitmap.test(obj));
        assert!(bitmap.set(obj));
        assert!(bitmap.clear(obj));
        assert!(!bitmap.test(obj));
    }

    #[test]
    fn atomic_test_and_set_reports_prior_state() {
        let base = 0x10000000 as *mut u8;
        let bitmap = ContinuousSpaceBitmap::create("test bitmap", base, 4096);
        let obj = 0x10000010 as *const u8;
        assert!(!bitmap.atomic_test_and_set(obj));
        assert!(bitmap.atomic_test_and_set(obj));
    }

    #[test]
    fn visit_marked_range_walks_exactly_the_set_bits() {
        let base = 0x10000000usize;
        let bitmap = ContinuousSpaceBitmap::create("test bitmap", base as *mut u8, 1 << 20);
        let offsets = [0usize, 8, 1024, 4096, 65528, (1 << 20) - 8];
        for &off in offsets.iter() {
            bitmap.set((base + off) as *const u8);
        }
        let mut seen = Vec::new();
        bitmap.visit_marked_range(base, base + (1 << 20), |obj| {
            seen.push(obj as usize - base);
        });
        assert_eq!(seen, offsets);

        // Restricted range only sees what it covers.
        let mut seen = Vec::new();
        bitmap.visit_marked_range(base + 8, base + 4096, |obj| {
            seen.push(obj as usize - base);
        });
        assert_eq!(seen, vec![8, 1024]);
    }

    #[test]
    fn heap_bitmap_dispatch() {
        let a = Box::into_raw(Box::new(ContinuousSpaceBitmap::create(
            "space a",
            0x20000000 as *mut u8,
            4096,
        )));
        let b = Box::into_raw(Box::new(LargeObjectBitmap::create(
            "los",
            0x30000000 as *mut u8,
            1 << 20,
        )));
        let mut heap_bitmap = HeapBitmap::new();
        heap_bitmap.add_continuous_space_bitmap(a);
        heap_bitmap.add_large_object_bitmap(b);

        let in_a = 0x20000100 as *const HeapObjectHeader;
        let in_b = 0x30001000 as *const HeapObjectHeader;
        assert!(heap_bitmap.get_continuous_space_bitmap(in_a).is_some());
        assert!(heap_bitmap.get_continuous_space_bitmap(in_b).is_none());
        assert!(heap_bitmap.get_large_object_bitmap(in_b).is_some());
        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }
}
