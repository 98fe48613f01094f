use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use modular_bitfield::prelude::*;

use crate::api::Collectable;

/// Granule all allocations are aligned to. Region-space allocation sizes are
/// multiples of this, and the lock word encodes forwarding addresses shifted
/// by its log2.
pub const ALLOCATION_GRANULARITY: usize = 8;

/// Read-barrier colors. The collector drives every object WHITE -> GRAY ->
/// WHITE across one cycle; no object stays gray once marking is done.
pub const RB_WHITE: u32 = 0;
pub const RB_GRAY: u32 = 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum LockState {
    Unlocked = 0,
    ThinLocked = 1,
    FatLocked = 2,
    Forwarded = 3,
}

/// Tagged view over the object's synchronization word.
///
/// +---------+----------+-----------------------------------------------+
/// | bits    | field    |                                               |
/// +---------+----------+-----------------------------------------------+
/// | 63..62  | state    | unlocked / thin / fat / forwarded             |
/// | 61      | mark bit | orthogonal to the state, cleared each cycle   |
/// | 60..0   | payload  | hash, (tid,count), monitor id, or to-address  |
/// +---------+----------+-----------------------------------------------+
///
/// The forwarded payload is the to-space address divided by the allocation
/// granularity. Once a word is in the forwarded state it never changes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LockWord(usize);

impl LockWord {
    const STATE_SHIFT: u32 = 62;
    const STATE_MASK: usize = 0b11 << Self::STATE_SHIFT;
    const MARK_BIT_SHIFT: u32 = 61;
    const MARK_BIT: usize = 1 << Self::MARK_BIT_SHIFT;
    const PAYLOAD_MASK: usize = (1 << Self::MARK_BIT_SHIFT) - 1;
    const THIN_COUNT_SHIFT: u32 = 16;

    #[inline(always)]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn state(self) -> LockState {
        match (self.0 & Self::STATE_MASK) >> Self::STATE_SHIFT {
            0 => LockState::Unlocked,
            1 => LockState::ThinLocked,
            2 => LockState::FatLocked,
            _ => LockState::Forwarded,
        }
    }

    #[inline(always)]
    pub fn from_hash(hash: u32) -> Self {
        Self(hash as usize)
    }

    #[inline(always)]
    pub fn hash(self) -> u32 {
        debug_assert_eq!(self.state(), LockState::Unlocked);
        (self.0 & Self::PAYLOAD_MASK) as u32
    }

    #[inline(always)]
    pub fn from_thin_lock(owner: u16, count: u16) -> Self {
        let payload = (count as usize) << Self::THIN_COUNT_SHIFT | owner as usize;
        Self(payload | (LockState::ThinLocked as usize) << Self::STATE_SHIFT)
    }

    #[inline(always)]
    pub fn thin_lock_owner(self) -> u16 {
        debug_assert_eq!(self.state(), LockState::ThinLocked);
        self.0 as u16
    }

    #[inline(always)]
    pub fn from_forwarding_address(addr: usize) -> Self {
        debug_assert!(addr % ALLOCATION_GRANULARITY == 0);
        Self(
            (addr / ALLOCATION_GRANULARITY)
                | (LockState::Forwarded as usize) << Self::STATE_SHIFT,
        )
    }

    #[inline(always)]
    pub fn forwarding_address(self) -> usize {
        debug_assert_eq!(self.state(), LockState::Forwarded);
        (self.0 & Self::PAYLOAD_MASK) * ALLOCATION_GRANULARITY
    }

    #[inline(always)]
    pub fn mark_bit(self) -> bool {
        self.0 & Self::MARK_BIT != 0
    }

    #[inline(always)]
    pub fn with_mark_bit(self, bit: bool) -> Self {
        if bit {
            Self(self.0 | Self::MARK_BIT)
        } else {
            Self(self.0 & !Self::MARK_BIT)
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ReferenceKind {
    Regular = 0,
    Soft = 1,
    Weak = 2,
    Finalizer = 3,
    Phantom = 4,
}

impl ReferenceKind {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Regular,
            1 => Self::Soft,
            2 => Self::Weak,
            3 => Self::Finalizer,
            _ => Self::Phantom,
        }
    }
}

#[bitfield(bits = 32)]
#[derive(Clone, Copy)]
struct ObjectProps {
    size_granules: B27,
    reference_kind: B3,
    large: bool,
    #[skip]
    __: B1,
}

/// Header prepended to every managed allocation.
///
/// The lock word doubles as the forwarding slot during evacuation and the
/// rb word carries the Baker color; both are accessed atomically. The vtable
/// and props words are written once at allocation (or when a lost copy is
/// turned into a filler object) and read without synchronization.
#[repr(C)]
pub struct HeapObjectHeader {
    lock_word: AtomicUsize,
    vtable: usize,
    rb_word: AtomicU32,
    props: ObjectProps,
}

pub const OBJECT_HEADER_SIZE: usize = std::mem::size_of::<HeapObjectHeader>();

impl HeapObjectHeader {
    pub fn new(vtable: usize, size: usize) -> Self {
        let mut this = Self {
            lock_word: AtomicUsize::new(0),
            vtable,
            rb_word: AtomicU32::new(RB_WHITE),
            props: ObjectProps::new(),
        };
        this.set_size(size);
        this
    }

    #[inline(always)]
    pub fn vtable(&self) -> usize {
        self.vtable
    }

    #[inline(always)]
    pub fn set_vtable(&mut self, vtable: usize) {
        self.vtable = vtable;
    }

    #[inline(always)]
    pub fn is_allocated(&self) -> bool {
        self.vtable != 0
    }

    /// Allocation size in bytes, header included. Zero for large objects
    /// whose size lives in the large-object space's chunk map.
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.props.size_granules() as usize * ALLOCATION_GRANULARITY
    }

    #[inline(always)]
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size % ALLOCATION_GRANULARITY == 0);
        self.props
            .set_size_granules((size / ALLOCATION_GRANULARITY) as u32);
    }

    #[inline(always)]
    pub fn is_large(&self) -> bool {
        self.props.large()
    }

    #[inline(always)]
    pub fn set_large(&mut self) {
        self.props.set_large(true);
        self.props.set_size_granules(0);
    }

    #[inline(always)]
    pub fn reference_kind(&self) -> ReferenceKind {
        ReferenceKind::from_bits(self.props.reference_kind())
    }

    #[inline(always)]
    pub fn set_reference_kind(&mut self, kind: ReferenceKind) {
        self.props.set_reference_kind(kind as u8);
    }

    #[inline(always)]
    pub fn data(&self) -> *const u8 {
        (self as *const Self as usize + OBJECT_HEADER_SIZE) as *const u8
    }

    #[inline(always)]
    pub unsafe fn from_data(data: *const u8) -> *mut HeapObjectHeader {
        (data as usize - OBJECT_HEADER_SIZE) as *mut HeapObjectHeader
    }

    #[inline(always)]
    pub fn get_dyn(&mut self) -> &mut dyn Collectable {
        unsafe {
            std::mem::transmute(mopa::TraitObject {
                data: self.data() as *mut (),
                vtable: self.vtable as _,
            })
        }
    }

    // Lock word.

    #[inline(always)]
    pub fn lock_word(&self, ordering: Ordering) -> LockWord {
        LockWord::from_raw(self.lock_word.load(ordering))
    }

    #[inline(always)]
    pub fn set_lock_word(&self, lw: LockWord, ordering: Ordering) {
        self.lock_word.store(lw.raw(), ordering);
    }

    /// Weak CAS; callers loop. Sequentially consistent so the forwarding
    /// install is ordered against the copy that precedes it.
    #[inline(always)]
    pub fn cas_lock_word_weak(&self, old: LockWord, new: LockWord) -> bool {
        self.lock_word
            .compare_exchange_weak(old.raw(), new.raw(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[inline(always)]
    pub fn is_forwarded(&self) -> bool {
        self.lock_word(Ordering::Relaxed).state() == LockState::Forwarded
    }

    /// Flip the lock-word mark bit `expected` -> `new`, preserving the rest
    /// of the word. Fails if another thread already flipped it.
    pub fn atomic_set_mark_bit(&self, expected: bool, new: bool) -> bool {
        let mut old = self.lock_word.load(Ordering::Relaxed);
        loop {
            let lw = LockWord::from_raw(old);
            if lw.mark_bit() != expected {
                return false;
            }
            let new_lw = lw.with_mark_bit(new);
            match self.lock_word.compare_exchange_weak(
                old,
                new_lw.raw(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(cur) => old = cur,
            }
        }
    }

    // Read-barrier word.

    #[inline(always)]
    pub fn rb_state(&self) -> u32 {
        self.rb_word.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn set_rb_state(&self, state: u32) {
        self.rb_word.store(state, Ordering::Relaxed);
    }

    /// Release on success so a gray object's payload is published before the
    /// color, and an observer whitening later orders after us.
    #[inline(always)]
    pub fn cas_rb_state(&self, old: u32, new: u32) -> bool {
        self.rb_word
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_word_states() {
        let lw = LockWord::from_hash(0xdead);
        assert_eq!(lw.state(), LockState::Unlocked);
        assert_eq!(lw.hash(), 0xdead);

        let lw = LockWord::from_thin_lock(7, 3);
        assert_eq!(lw.state(), LockState::ThinLocked);
        assert_eq!(lw.thin_lock_owner(), 7);

        let addr = 0x7f00_0000_1000usize;
        let lw = LockWord::from_forwarding_address(addr);
        assert_eq!(lw.state(), LockState::Forwarded);
        assert_eq!(lw.forwarding_address(), addr);
    }

    #[test]
    fn mark_bit_is_orthogonal() {
        let addr = 0x1000usize;
        let lw = LockWord::from_forwarding_address(addr).with_mark_bit(true);
        assert_eq!(lw.state(), LockState::Forwarded);
        assert!(lw.mark_bit());
        assert_eq!(lw.forwarding_address(), addr);
        assert!(!lw.with_mark_bit(false).mark_bit());
    }

    #[test]
    fn header_props() {
        let mut h = HeapObjectHeader::new(0x1234, 48);
        assert_eq!(h.size(), 48);
        assert_eq!(h.reference_kind(), ReferenceKind::Regular);
        h.set_reference_kind(ReferenceKind::Soft);
        assert_eq!(h.reference_kind(), ReferenceKind::Soft);
        assert_eq!(h.size(), 48);
        h.set_large();
        assert!(h.is_large());
        assert_eq!(h.size(), 0);
    }

    #[test]
    fn forwarding_cas() {
        let h = HeapObjectHeader::new(0x1234, 16);
        let old = h.lock_word(Ordering::Relaxed);
        let new = LockWord::from_forwarding_address(0x2000);
        while !h.cas_lock_word_weak(old, new) {}
        assert!(h.is_forwarded());
        assert_eq!(h.lock_word(Ordering::Relaxed).forwarding_address(), 0x2000);
    }
}
