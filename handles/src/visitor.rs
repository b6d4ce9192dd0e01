use std::{cell::Cell, marker::PhantomData, ptr::NonNull};

use crate::HandleKind;

/// Receives every live slot so a collector can read the stored reference
/// and, when relocating, overwrite it in place.
///
/// Slots come as `&Cell<T>`: typed [`Handle`](crate::Handle)s point at the
/// same words and stay usable while the visitor runs.
pub trait ObjectPointerVisitor<T> {
    fn visit_pointer(&mut self, slot: &Cell<T>);
}

impl<T, F> ObjectPointerVisitor<T> for F
where
    F: FnMut(&Cell<T>) + ?Sized,
{
    #[inline]
    fn visit_pointer(&mut self, slot: &Cell<T>) {
        self(slot)
    }
}

/// Receives a [`HandleRef`] per live slot, for callers that care about more
/// than the raw word.
pub trait HandleVisitor<T> {
    fn visit_handle(&mut self, handle: HandleRef<'_, T>);
}

impl<T, F> HandleVisitor<T> for F
where
    F: FnMut(HandleRef<'_, T>) + ?Sized,
{
    #[inline]
    fn visit_handle(&mut self, handle: HandleRef<'_, T>) {
        self(handle)
    }
}

/// Supplies the roots of one mutator to a collector.
pub trait RootProvider<T> {
    fn visit_roots(&self, visitor: &mut dyn FnMut(&Cell<T>));
}

/// A borrowed view of one live handle slot during visitation.
pub struct HandleRef<'a, T> {
    slot: NonNull<T>,
    kind: HandleKind,
    _marker: PhantomData<&'a mut T>,
}

impl<'a, T: Copy> HandleRef<'a, T> {
    #[inline(always)]
    pub(crate) fn new(slot: NonNull<T>, kind: HandleKind) -> Self {
        Self {
            slot,
            kind,
            _marker: PhantomData,
        }
    }

    #[inline(always)]
    pub fn value(&self) -> T {
        // SAFETY: the slot is live for the duration of the visit
        unsafe { *self.slot.as_ptr() }
    }

    #[inline(always)]
    pub fn set(&mut self, value: T) {
        // SAFETY: the slot is live for the duration of the visit
        unsafe { *self.slot.as_ptr() = value };
    }

    #[inline(always)]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    #[inline(always)]
    pub fn address(&self) -> NonNull<T> {
        self.slot
    }
}

impl<T: Copy + std::fmt::Debug> std::fmt::Debug for HandleRef<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRef")
            .field("slot", &self.slot)
            .field("kind", &self.kind)
            .field("value", &self.value())
            .finish()
    }
}
