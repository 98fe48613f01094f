use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::{
    card_table::CardTable,
    header::HeapObjectHeader,
    space_bitmap::ContinuousSpaceBitmap,
};

/// Card-cache mod-union table for an immune space. Dirty cards are pulled
/// out of the card table at each flip and remembered here, so writes into
/// the immune space stay visible to later cycles even though the card table
/// itself is cleaned.
pub struct ModUnionTable {
    name: &'static str,
    space_begin: usize,
    space_end: usize,
    cleared_cards: Mutex<BTreeSet<usize>>,
}

impl ModUnionTable {
    pub fn new(name: &'static str, space_begin: usize, space_end: usize) -> Self {
        Self {
            name,
            space_begin,
            space_end,
            cleared_cards: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn covers(&self, addr: *const u8) -> bool {
        (addr as usize) >= self.space_begin && (addr as usize) < self.space_end
    }

    /// Harvest dirty cards from the card table into this table.
    pub fn clear_cards(&self, card_table: &CardTable) {
        let mut cards = self.cleared_cards.lock();
        card_table.modify_cards_atomic(
            self.space_begin,
            self.space_end,
            |card| {
                if card == CardTable::CARD_DIRTY {
                    CardTable::CARD_CLEAN
                } else {
                    card
                }
            },
            |card, _old, _new| {
                cards.insert(card_table.addr_from_card(card) as usize);
            },
        );
    }

    /// Visit every live object on a remembered card.
    pub fn visit_objects(
        &self,
        live_bitmap: &ContinuousSpaceBitmap,
        mut visitor: impl FnMut(*mut HeapObjectHeader),
    ) {
        let cards = self.cleared_cards.lock();
        for &card_begin in cards.iter() {
            let end = (card_begin + CardTable::CARD_SIZE).min(self.space_end);
            live_bitmap.visit_marked_range(card_begin.max(self.space_begin), end, &mut visitor);
        }
    }

    pub fn num_cards(&self) -> usize {
        self.cleared_cards.lock().len()
    }

    /// Drop remembered cards none of whose objects still satisfies `keep`
    /// (i.e. no object on the card references another space any more).
    pub fn filter_cards(
        &self,
        live_bitmap: &ContinuousSpaceBitmap,
        mut keep: impl FnMut(*mut HeapObjectHeader) -> bool,
    ) {
        let mut cards = self.cleared_cards.lock();
        cards.retain(|&card_begin| {
            let end = (card_begin + CardTable::CARD_SIZE).min(self.space_end);
            let mut keep_card = false;
            live_bitmap.visit_marked_range(card_begin.max(self.space_begin), end, |obj| {
                if keep(obj) {
                    keep_card = true;
                }
            });
            keep_card
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harvests_dirty_cards_and_remembers_them() {
        let begin = 0x50000000usize;
        let card_table = CardTable::create(begin as *mut u8, 1 << 20);
        let live = ContinuousSpaceBitmap::create("mut test", begin as *mut u8, 1 << 20);
        let table = ModUnionTable::new("test mod-union", begin, begin + (1 << 20));

        live.set((begin + 32) as *const u8);
        card_table.mark_card((begin + 32) as *const u8);

        table.clear_cards(&card_table);
        assert_eq!(table.num_cards(), 1);
        assert!(!card_table.is_dirty((begin + 32) as *const u8));

        let mut seen = 0;
        table.visit_objects(&live, |_| seen += 1);
        assert_eq!(seen, 1);

        // Filtering with an always-false predicate empties the table.
        table.filter_cards(&live, |_| false);
        assert_eq!(table.num_cards(), 0);
    }
}
