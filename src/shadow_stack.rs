use std::cell::Cell;

use crate::api::Trace;

/// Per-thread chain of precisely-rooted stack values. Entries are linked
/// through the mutator's stack frames; [letroot!](crate::letroot) pushes and
/// the guard's drop pops.
pub struct ShadowStack {
    #[doc(hidden)]
    pub head: Cell<*mut RawShadowStackEntry>,
}

impl ShadowStack {
    pub fn new() -> Self {
        Self {
            head: Cell::new(core::ptr::null_mut()),
        }
    }

    /// Walk every rooted value. The visitor may rewrite the rooted handles
    /// (the thread flip does).
    pub unsafe fn walk(&self, mut visitor: impl FnMut(&mut dyn Trace)) {
        let mut head = self.head.get();
        while !head.is_null() {
            let next = (*head).prev;
            visitor((*head).get_dyn());
            head = next;
        }
    }
}

impl Default for ShadowStack {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
pub struct RawShadowStackEntry {
    stack: *mut ShadowStack,
    prev: *mut RawShadowStackEntry,
    vtable: usize,
    data_start: [u8; 0],
}

impl RawShadowStackEntry {
    pub unsafe fn get_dyn(&self) -> &mut dyn Trace {
        core::mem::transmute(mopa::TraitObject {
            vtable: self.vtable as _,
            data: self.data_start.as_ptr() as *mut (),
        })
    }
}

#[repr(C)]
pub struct ShadowStackInternal<'a, T: Trace> {
    pub stack: &'a ShadowStack,
    pub prev: *mut RawShadowStackEntry,
    pub vtable: usize,
    pub value: T,
}

impl<'a, T: Trace> ShadowStackInternal<'a, T> {
    #[doc(hidden)]
    #[inline]
    pub unsafe fn construct(
        stack: &'a ShadowStack,
        prev: *mut RawShadowStackEntry,
        vtable: usize,
        value: T,
    ) -> Self {
        Self {
            stack,
            prev,
            vtable,
            value,
        }
    }
}

impl<T: Trace> Drop for ShadowStackInternal<'_, T> {
    #[inline(always)]
    fn drop(&mut self) {
        self.stack.head.set(self.prev);
    }
}

/// A value rooted for its lexical scope.
pub struct Rooted<'a, T: Trace> {
    value: &'a mut T,
}

impl<'a, T: Trace> Rooted<'a, T> {
    #[doc(hidden)]
    pub unsafe fn construct(value: &'a mut T) -> Self {
        Self { value }
    }
}

impl<'a, T: Trace> core::ops::Deref for Rooted<'a, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.value
    }
}

impl<'a, T: Trace> core::ops::DerefMut for Rooted<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.value
    }
}

/// Root a value on the shadow stack for the rest of the scope. Allocates
/// nothing; the entry lives in the current stack frame.
#[macro_export]
macro_rules! letroot {
    ($var_name: ident = $stack: expr, $value: expr) => {
        let stack: &$crate::shadow_stack::ShadowStack = &$stack;
        let value = $value;
        let mut $var_name = unsafe {
            $crate::shadow_stack::ShadowStackInternal::<_>::construct(
                stack,
                stack.head.get(),
                core::mem::transmute::<_, $crate::mopa::TraitObject>(
                    &value as &dyn $crate::api::Trace,
                )
                .vtable as usize,
                value,
            )
        };
        stack
            .head
            .set(unsafe { core::mem::transmute(&mut $var_name) });
        #[allow(unused_mut)]
        let mut $var_name =
            unsafe { $crate::shadow_stack::Rooted::construct(&mut $var_name.value) };
    };
}
