use std::sync::atomic::{AtomicU8, Ordering};

use memmap2::MmapMut;

use crate::{
    header::HeapObjectHeader,
    space_bitmap::ContinuousSpaceBitmap,
};

/// Card table for the write barrier. All reference stores into non-region
/// spaces dirty the holder's card; GC harvests dirty cards to find
/// inter-space pointers without scanning whole spaces.
pub struct CardTable {
    mem_map: MmapMut,
    /// Value such that `biased_begin + (addr >> CARD_SHIFT)` addresses the
    /// card for `addr`.
    biased_begin: *mut u8,
    heap_begin: usize,
    heap_limit: usize,
}

impl CardTable {
    pub const CARD_SHIFT: usize = 10;
    pub const CARD_SIZE: usize = 1 << Self::CARD_SHIFT;
    pub const CARD_CLEAN: u8 = 0x0;
    pub const CARD_DIRTY: u8 = 0x70;

    pub fn create(heap_begin: *mut u8, heap_capacity: usize) -> Self {
        let cards = (heap_capacity >> Self::CARD_SHIFT) + 1;
        let mem_map = MmapMut::map_anon(cards).expect("failed to map card table");
        let biased_begin =
            (mem_map.as_ptr() as usize).wrapping_sub((heap_begin as usize) >> Self::CARD_SHIFT)
                as *mut u8;
        Self {
            mem_map,
            biased_begin,
            heap_begin: heap_begin as usize,
            heap_limit: heap_begin as usize + heap_capacity,
        }
    }

    pub fn covers(&self, addr: *const u8) -> bool {
        (addr as usize) >= self.heap_begin && (addr as usize) < self.heap_limit
    }

    #[inline]
    pub fn card_from_addr(&self, addr: *const u8) -> *mut u8 {
        debug_assert!(self.covers(addr), "address {:p} outside card table", addr);
        (self.biased_begin as usize + ((addr as usize) >> Self::CARD_SHIFT)) as *mut u8
    }

    #[inline]
    pub fn addr_from_card(&self, card: *const u8) -> *mut u8 {
        ((card as usize - self.biased_begin as usize) << Self::CARD_SHIFT) as *mut u8
    }

    #[inline]
    fn card_atomic(card: *mut u8) -> &'static AtomicU8 {
        unsafe { &*(card as *const AtomicU8) }
    }

    #[inline]
    pub fn mark_card(&self, addr: *const u8) {
        Self::card_atomic(self.card_from_addr(addr)).store(Self::CARD_DIRTY, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_dirty(&self, addr: *const u8) -> bool {
        Self::card_atomic(self.card_from_addr(addr)).load(Ordering::Relaxed) == Self::CARD_DIRTY
    }

    /// Visit objects on dirty cards in `[scan_begin, scan_end)` through the
    /// space's live bitmap. Returns the number of dirty cards seen.
    pub fn scan(
        &self,
        bitmap: &ContinuousSpaceBitmap,
        scan_begin: usize,
        scan_end: usize,
        mut visitor: impl FnMut(*mut HeapObjectHeader),
    ) -> usize {
        let mut cards = 0;
        let mut addr = crate::utils::align_down(scan_begin, Self::CARD_SIZE);
        while addr < scan_end {
            if Self::card_atomic(self.card_from_addr(addr as *const u8)).load(Ordering::Relaxed)
                == Self::CARD_DIRTY
            {
                cards += 1;
                let begin = addr.max(scan_begin);
                let end = (addr + Self::CARD_SIZE).min(scan_end);
                bitmap.visit_marked_range(begin, end, &mut visitor);
            }
            addr += Self::CARD_SIZE;
        }
        cards
    }

    /// Atomically rewrite every card in `[scan_begin, scan_end)` with
    /// `visitor(old)`, reporting changed cards to `modified`.
    pub fn modify_cards_atomic(
        &self,
        scan_begin: usize,
        scan_end: usize,
        mut visitor: impl FnMut(u8) -> u8,
        mut modified: impl FnMut(*mut u8, u8, u8),
    ) {
        let mut addr = crate::utils::align_down(scan_begin, Self::CARD_SIZE);
        while addr < scan_end {
            let card = self.card_from_addr(addr as *const u8);
            let atomic = Self::card_atomic(card);
            let mut expected = atomic.load(Ordering::Relaxed);
            loop {
                let new = visitor(expected);
                if new == expected {
                    break;
                }
                match atomic.compare_exchange_weak(
                    expected,
                    new,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        modified(card, expected, new);
                        break;
                    }
                    Err(cur) => expected = cur,
                }
            }
            addr += Self::CARD_SIZE;
        }
    }

    pub fn clear_card_range(&self, begin: usize, end: usize) {
        let mut addr = crate::utils::align_down(begin, Self::CARD_SIZE);
        while addr < end {
            Self::card_atomic(self.card_from_addr(addr as *const u8))
                .store(Self::CARD_CLEAN, Ordering::Relaxed);
            addr += Self::CARD_SIZE;
        }
    }

    pub fn mem_map_size(&self) -> usize {
        self.mem_map.len()
    }
}

unsafe impl Send for CardTable {}
unsafe impl Sync for CardTable {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_and_scan() {
        let heap_begin = 0x40000000usize;
        let table = CardTable::create(heap_begin as *mut u8, 1 << 20);
        let bitmap =
            ContinuousSpaceBitmap::create("cards test", heap_begin as *mut u8, 1 << 20);

        // Two objects on one card, one on another, one on a clean card.
        bitmap.set((heap_begin + 8) as *const u8);
        bitmap.set((heap_begin + 64) as *const u8);
        bitmap.set((heap_begin + 8 * CardTable::CARD_SIZE) as *const u8);
        bitmap.set((heap_begin + 20 * CardTable::CARD_SIZE) as *const u8);

        table.mark_card((heap_begin + 16) as *const u8);
        table.mark_card((heap_begin + 8 * CardTable::CARD_SIZE + 100) as *const u8);

        let mut seen = Vec::new();
        let cards = table.scan(&bitmap, heap_begin, heap_begin + (1 << 20), |obj| {
            seen.push(obj as usize - heap_begin)
        });
        assert_eq!(cards, 2);
        assert_eq!(seen, vec![8, 64, 8 * CardTable::CARD_SIZE]);
    }

    #[test]
    fn modify_cards_reports_changes() {
        let heap_begin = 0x40000000usize;
        let table = CardTable::create(heap_begin as *mut u8, 64 * 1024);
        table.mark_card((heap_begin + 2048) as *const u8);

        let mut changed = Vec::new();
        table.modify_cards_atomic(
            heap_begin,
            heap_begin + 64 * 1024,
            |card| {
                if card == CardTable::CARD_DIRTY {
                    CardTable::CARD_CLEAN
                } else {
                    card
                }
            },
            |card, old, new| changed.push((card as usize, old, new)),
        );
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].1, CardTable::CARD_DIRTY);
        assert_eq!(changed[0].2, CardTable::CARD_CLEAN);
        assert!(!table.is_dirty((heap_begin + 2048) as *const u8));
    }
}
