use std::{
    marker::PhantomData,
    mem::size_of,
    ops::{Deref, DerefMut},
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use mopa::mopafy;

use crate::{
    header::{HeapObjectHeader, ALLOCATION_GRANULARITY, OBJECT_HEADER_SIZE},
    utils::align_usize,
};

/// Types that can report their outgoing references to a [Visitor].
pub unsafe trait Trace {
    fn trace(&mut self, _vis: &mut dyn Visitor) {}
}

pub unsafe trait Finalize {
    unsafe fn finalize(&mut self) {
        std::ptr::drop_in_place(self)
    }
}

pub trait Collectable: Trace + Finalize + mopa::Any {
    #[inline(always)]
    fn allocation_size(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

mopafy!(Collectable);

/// Visits reference slots. `root` is the slot itself so the collector can
/// rewrite (or CAS) it in place.
pub trait Visitor {
    fn mark_object(&mut self, root: &mut NonNull<HeapObjectHeader>);
}

pub(crate) fn vtable_of<T: Collectable>() -> usize {
    let x = null_mut::<T>();
    unsafe { std::mem::transmute::<_, mopa::TraitObject>(x as *mut dyn Collectable).vtable as _ }
}

/// Total allocation size for a value: header plus payload, granule aligned.
#[inline(always)]
pub(crate) fn allocation_size_of<T: Collectable>(value: &T) -> usize {
    align_usize(
        value.allocation_size() + OBJECT_HEADER_SIZE,
        ALLOCATION_GRANULARITY,
    )
}

/// Unbarriered handle to a managed object. GC internals and rooted values
/// use this directly; object fields should live in [Field] so loads go
/// through the read barrier.
pub struct Gc<T: Collectable + ?Sized> {
    pub(crate) base: NonNull<HeapObjectHeader>,
    pub(crate) marker: PhantomData<T>,
}

impl<T: Collectable + ?Sized> Gc<T> {
    #[inline(always)]
    pub(crate) fn from_header(base: *mut HeapObjectHeader) -> Self {
        unsafe {
            Self {
                base: NonNull::new_unchecked(base),
                marker: PhantomData,
            }
        }
    }

    #[inline(always)]
    pub fn header(&self) -> *mut HeapObjectHeader {
        self.base.as_ptr()
    }

    pub fn to_dyn(self) -> Gc<dyn Collectable> {
        Gc {
            base: self.base,
            marker: PhantomData,
        }
    }

    pub fn to_field(self) -> Field<T> {
        Field { base: self }
    }

    #[inline(always)]
    pub fn is<U: Collectable>(&self) -> bool {
        unsafe { (*self.base.as_ptr()).get_dyn().is::<U>() }
    }

    pub fn downcast<U: Collectable>(&self) -> Option<Gc<U>> {
        if self.is::<U>() {
            Some(Gc {
                base: self.base,
                marker: PhantomData,
            })
        } else {
            None
        }
    }
}

impl<T: Collectable + ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Collectable + ?Sized> Copy for Gc<T> {}

impl<T: Collectable> Deref for Gc<T> {
    type Target = T;
    #[inline(always)]
    fn deref(&self) -> &Self::Target {
        unsafe { &*(*self.base.as_ptr()).data().cast::<T>() }
    }
}

impl<T: Collectable> DerefMut for Gc<T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *((*self.base.as_ptr()).data().cast::<T>() as *mut T) }
    }
}

impl<T: Collectable + ?Sized> std::fmt::Pointer for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:p}", self.base)
    }
}

unsafe impl<T: Collectable + ?Sized> Trace for Gc<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        vis.mark_object(&mut self.base);
    }
}
unsafe impl<T: Collectable + ?Sized> Finalize for Gc<T> {}
impl<T: Collectable + ?Sized> Collectable for Gc<T> {}

/// A reference-holding object field. Loads run the read barrier, so after a
/// flip a mutator only ever observes to-space (or immune) pointers through
/// here.
#[repr(transparent)]
pub struct Field<T: Collectable + ?Sized> {
    base: Gc<T>,
}

impl<T: Collectable + ?Sized> Field<T> {
    #[inline(always)]
    pub fn load(&self) -> Gc<T> {
        let fixed = crate::heap::read_barrier(self.base.base.as_ptr());
        unsafe {
            Gc {
                base: NonNull::new_unchecked(fixed),
                marker: PhantomData,
            }
        }
    }

    /// Plain store; callers dirty the holder's card via
    /// [Heap::write_barrier](crate::heap::Heap::write_barrier).
    #[inline(always)]
    pub fn store(&mut self, value: Gc<T>) {
        self.base = value;
    }

    pub fn to_gc(&self) -> Gc<T> {
        self.base
    }
}

unsafe impl<T: Collectable + ?Sized> Trace for Field<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        vis.mark_object(&mut self.base.base);
    }
}
unsafe impl<T: Collectable + ?Sized> Finalize for Field<T> {}
impl<T: Collectable> Collectable for Field<T> {}

/// System-weak handle. The slot lives outside the heap and is swept by the
/// collector: dead referents are nulled, moved referents forwarded.
pub struct Weak<T: Collectable + ?Sized> {
    pub(crate) slot: NonNull<AtomicPtr<HeapObjectHeader>>,
    pub(crate) marker: PhantomData<T>,
}

impl<T: Collectable + ?Sized> Weak<T> {
    pub fn upgrade(&self) -> Option<Gc<T>> {
        let ptr = unsafe { self.slot.as_ref().load(Ordering::Acquire) };
        if ptr.is_null() {
            return None;
        }
        let ptr = crate::heap::read_barrier(ptr);
        Some(Gc {
            base: unsafe { NonNull::new_unchecked(ptr) },
            marker: PhantomData,
        })
    }
}

impl<T: Collectable + ?Sized> Clone for Weak<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot,
            marker: PhantomData,
        }
    }
}

unsafe impl<T: Collectable + ?Sized> Trace for Weak<T> {}
unsafe impl<T: Collectable + ?Sized> Finalize for Weak<T> {}

/// Soft/weak/finalizer/phantom reference object. The two pointer words sit
/// at fixed payload offsets so the reference processor can work on them
/// type-erased; see [referent_slot] and [pending_next_slot].
#[repr(C)]
pub struct Reference<T: Collectable> {
    pub(crate) referent: AtomicPtr<HeapObjectHeader>,
    pub(crate) pending_next: AtomicPtr<HeapObjectHeader>,
    pub(crate) marker: PhantomData<T>,
}

impl<T: Collectable> Reference<T> {
    pub fn new(referent: Option<Gc<T>>) -> Self {
        Self {
            referent: AtomicPtr::new(
                referent.map_or(null_mut(), |r| r.base.as_ptr()),
            ),
            pending_next: AtomicPtr::new(null_mut()),
            marker: PhantomData,
        }
    }
}

// The referent is deliberately not traced: the scanner recognizes reference
// objects by their header kind and routes the referent through the reference
// processor instead.
unsafe impl<T: Collectable> Trace for Reference<T> {}
unsafe impl<T: Collectable> Finalize for Reference<T> {}
impl<T: Collectable> Collectable for Reference<T> {}

impl<T: Collectable> Gc<Reference<T>> {
    /// Read the referent. Blocks while the collector has weak-reference
    /// access disabled, then goes through the read barrier.
    pub fn get_referent(&self) -> Option<Gc<T>> {
        let ptr = crate::heap::referent_slow_path(self.base.as_ptr());
        if ptr.is_null() {
            None
        } else {
            Some(Gc {
                base: unsafe { NonNull::new_unchecked(ptr) },
                marker: PhantomData,
            })
        }
    }
}

#[inline(always)]
pub(crate) unsafe fn referent_slot(
    reference: *mut HeapObjectHeader,
) -> &'static AtomicPtr<HeapObjectHeader> {
    &*((*reference).data() as *const AtomicPtr<HeapObjectHeader>)
}

#[inline(always)]
pub(crate) unsafe fn pending_next_slot(
    reference: *mut HeapObjectHeader,
) -> &'static AtomicPtr<HeapObjectHeader> {
    &*((*reference).data().add(size_of::<AtomicPtr<HeapObjectHeader>>())
        as *const AtomicPtr<HeapObjectHeader>)
}

/// Header-only filler for dead blocks too small to hold an array.
pub struct Filler;

unsafe impl Trace for Filler {}
unsafe impl Finalize for Filler {}
impl Collectable for Filler {
    fn allocation_size(&self) -> usize {
        0
    }
}

/// Int-array filler written over lost to-space copies to keep the heap
/// parseable. `length` is chosen so header + length word + elements equals
/// the block size exactly.
#[repr(C)]
pub struct FillerArray {
    pub(crate) length: usize,
}

impl FillerArray {
    pub const DATA_OFFSET: usize = OBJECT_HEADER_SIZE + size_of::<usize>();
    pub const COMPONENT_SIZE: usize = size_of::<i32>();
}

unsafe impl Trace for FillerArray {}
unsafe impl Finalize for FillerArray {}
impl Collectable for FillerArray {
    fn allocation_size(&self) -> usize {
        size_of::<usize>() + self.length * Self::COMPONENT_SIZE
    }
}

macro_rules! impl_prim {
    ($($t: ty)*) => {
        $(
            unsafe impl Trace for $t {}
            unsafe impl Finalize for $t {}
            impl Collectable for $t {}
        )*
    };
}

impl_prim!(
    u8 u16 u32 u64 u128
    i8 i16 i32 i64 i128
    f32 f64
    bool String
);

unsafe impl Trace for () {}
unsafe impl Finalize for () {}
impl Collectable for () {}

unsafe impl<T: Trace> Trace for Option<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        if let Some(val) = self {
            val.trace(vis);
        }
    }
}
unsafe impl<T: Collectable> Finalize for Option<T> {}
impl<T: Collectable> Collectable for Option<T> {}

unsafe impl<T: Trace> Trace for Vec<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        for entry in self.iter_mut() {
            entry.trace(vis);
        }
    }
}

unsafe impl<T: Trace> Trace for Box<T> {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        (&mut **self).trace(vis);
    }
}

unsafe impl<T: Trace> Trace for [T] {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        for x in self.iter_mut() {
            x.trace(vis);
        }
    }
}

unsafe impl<T: Trace, const N: usize> Trace for [T; N] {
    fn trace(&mut self, vis: &mut dyn Visitor) {
        for x in self.iter_mut() {
            x.trace(vis);
        }
    }
}

unsafe impl<T: Collectable, const N: usize> Finalize for [T; N] {}
impl<T: Collectable, const N: usize> Collectable for [T; N] {}

