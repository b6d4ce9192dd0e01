//! Fixed-capacity blocks of handle slots.
//!
//! A block is a bump region of `N` slots plus a link to the next block in its
//! chain. Blocks never move once created, so a slot address handed out by
//! [`HandleBlock::allocate_slot`] stays valid until the block is truncated
//! below it or released.

use std::{
    cell::{Cell, UnsafeCell},
    ptr::NonNull,
};

use crate::{ObjectPointerVisitor, SlotValue};

/// Which chain a handle was allocated from.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandleKind {
    Zone,
    Scoped,
}

/// One handle slot. The reference comes first so a slot address is also the
/// address of the stored word.
#[repr(C)]
pub(crate) struct Slot<T> {
    pub(crate) value: T,
    #[cfg(debug_assertions)]
    pub(crate) kind: HandleKind,
}

impl<T: SlotValue> Slot<T> {
    #[inline(always)]
    fn new(value: T, kind: HandleKind) -> Self {
        #[cfg(not(debug_assertions))]
        let _ = kind;
        Self {
            value,
            #[cfg(debug_assertions)]
            kind,
        }
    }
}

pub struct HandleBlock<T, const N: usize> {
    next: Cell<Option<NonNull<HandleBlock<T, N>>>>,
    /// Next free slot index.
    top: Cell<usize>,
    kind: HandleKind,
    slots: [UnsafeCell<Slot<T>>; N],
}

impl<T: SlotValue, const N: usize> HandleBlock<T, N> {
    /// Size of a single slot in bytes.
    pub const SLOT_SIZE: usize = size_of::<Slot<T>>();

    pub fn new(kind: HandleKind, next: Option<NonNull<Self>>) -> Self {
        Self {
            next: Cell::new(next),
            top: Cell::new(0),
            kind,
            slots: std::array::from_fn(|_| UnsafeCell::new(Slot::new(T::ZAP, kind))),
        }
    }

    #[inline(always)]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    #[inline(always)]
    pub fn next(&self) -> Option<NonNull<Self>> {
        self.next.get()
    }

    /// Number of allocated slots.
    #[inline(always)]
    pub fn handle_count(&self) -> usize {
        self.top.get()
    }

    #[inline(always)]
    pub(crate) fn set_handle_count(&self, top: usize) {
        debug_assert!(top <= N, "handle block cursor out of range: {top}");
        self.top.set(top);
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.top.get() >= N
    }

    /// Hands out the next free slot, initialised to [`SlotValue::NULL`].
    ///
    /// Panics when the block is full; callers grow the chain first.
    #[inline]
    pub fn allocate_slot(&self) -> NonNull<T> {
        let top = self.top.get();
        assert!(top < N, "handle block full");
        let cell = &self.slots[top];
        // SAFETY: slots at or above `top` are not reachable through any handle
        unsafe { cell.get().write(Slot::new(T::NULL, self.kind)) };
        self.top.set(top + 1);
        // SAFETY: UnsafeCell::get is never null and `value` is at offset 0
        unsafe { NonNull::new_unchecked(cell.get().cast::<T>()) }
    }

    /// Address of the first slot.
    #[inline(always)]
    fn start(&self) -> usize {
        self.slots.as_ptr() as usize
    }

    /// True if `addr` is the address of a currently allocated slot.
    pub fn is_valid_handle(&self, addr: usize) -> bool {
        let start = self.start();
        let end = start + self.top.get() * Self::SLOT_SIZE;
        start <= addr && addr < end && (addr - start) % Self::SLOT_SIZE == 0
    }

    /// True if `addr` lies anywhere in this block's slot area.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.start();
        start <= addr && addr < start + N * Self::SLOT_SIZE
    }

    /// Visits slots `[0, top)` in allocation order.
    pub fn visit_occupied_slots<V>(&self, visitor: &mut V)
    where
        V: ObjectPointerVisitor<T> + ?Sized,
    {
        self.visit_slots_from(0, visitor);
    }

    /// Visits slots `[from, top)` in allocation order.
    pub(crate) fn visit_slots_from<V>(&self, from: usize, visitor: &mut V)
    where
        V: ObjectPointerVisitor<T> + ?Sized,
    {
        let top = self.top.get();
        for cell in &self.slots[from.min(top)..top] {
            // SAFETY: the payload is the first field of the repr(C) slot and
            // Cell<T> has T's layout; shared mutation goes through the
            // UnsafeCell, so live Handles to the slot stay valid
            let slot = unsafe { &*cell.get().cast::<Cell<T>>() };
            visitor.visit_pointer(slot);
        }
    }

    /// Raw slot pointers of `[0, top)`, for visitors that want more than
    /// the stored word.
    pub(crate) fn occupied_slots(&self) -> impl Iterator<Item = NonNull<T>> + '_ {
        self.slots[..self.top.get()]
            .iter()
            // SAFETY: UnsafeCell::get is never null
            .map(|cell| unsafe { NonNull::new_unchecked(cell.get().cast::<T>()) })
    }

    /// Overwrites every free slot with [`SlotValue::ZAP`].
    #[cfg(debug_assertions)]
    pub fn zap_unused_tail(&self) {
        for cell in &self.slots[self.top.get()..] {
            // SAFETY: free slots are not reachable through live handles
            unsafe { (*cell.get()).value = T::ZAP };
        }
    }

    /// Resets the cursor so the block can be reused without reallocation.
    pub fn reinitialize(&self) {
        self.top.set(0);
        #[cfg(debug_assertions)]
        self.zap_unused_tail();
    }
}

impl<T, const N: usize> std::fmt::Debug for HandleBlock<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleBlock")
            .field("kind", &self.kind)
            .field("top", &self.top.get())
            .field("capacity", &N)
            .finish()
    }
}

/// Reads the chain tag of an allocated slot.
///
/// # Safety
///
/// `slot` must have been returned by [`HandleBlock::allocate_slot`] and the
/// block must still be alive.
#[cfg(debug_assertions)]
pub(crate) unsafe fn slot_kind<T>(slot: NonNull<T>) -> HandleKind {
    // SAFETY: by contract `slot` points at the first field of a `Slot<T>`
    unsafe { (*slot.cast::<Slot<T>>().as_ptr()).kind }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    type Block = HandleBlock<Value, 4>;

    #[test]
    fn new_block_is_empty_and_unlinked() {
        let block = Block::new(HandleKind::Zone, None);
        assert_eq!(block.handle_count(), 0);
        assert!(!block.is_full());
        assert!(block.next().is_none());
        assert_eq!(block.kind(), HandleKind::Zone);
    }

    #[test]
    fn allocate_hands_out_consecutive_slots() {
        let block = Block::new(HandleKind::Scoped, None);
        let a = block.allocate_slot();
        let b = block.allocate_slot();
        assert_eq!(
            b.as_ptr() as usize - a.as_ptr() as usize,
            Block::SLOT_SIZE
        );
        assert_eq!(unsafe { *a.as_ptr() }, Value::NULL);
        assert_eq!(block.handle_count(), 2);
    }

    #[test]
    fn block_is_full_after_capacity_allocations() {
        let block = Block::new(HandleKind::Zone, None);
        for i in 0..4 {
            assert!(!block.is_full(), "full after {i} allocations");
            block.allocate_slot();
        }
        assert!(block.is_full());
    }

    #[test]
    #[should_panic(expected = "handle block full")]
    fn allocating_from_full_block_panics() {
        let block = Block::new(HandleKind::Zone, None);
        for _ in 0..5 {
            block.allocate_slot();
        }
    }

    #[test]
    fn valid_handle_only_covers_allocated_slots() {
        let block = Block::new(HandleKind::Zone, None);
        let a = block.allocate_slot().as_ptr() as usize;
        assert!(block.is_valid_handle(a));
        assert!(!block.is_valid_handle(a + 1));
        assert!(!block.is_valid_handle(a + Block::SLOT_SIZE));
        assert!(block.contains(a + Block::SLOT_SIZE));
        assert!(!block.is_valid_handle(a - Block::SLOT_SIZE));
    }

    #[test]
    fn visit_sees_occupied_slots_in_order() {
        let block = Block::new(HandleKind::Zone, None);
        for i in 0..3 {
            let slot = block.allocate_slot();
            unsafe { *slot.as_ptr() = Value::from_i64(i) };
        }
        let mut seen = Vec::new();
        block.visit_occupied_slots(&mut |slot: &Cell<Value>| seen.push(slot.get()));
        assert_eq!(
            seen,
            vec![Value::from_i64(0), Value::from_i64(1), Value::from_i64(2)]
        );
    }

    #[test]
    fn visitor_rewrites_slots_in_place() {
        let block = Block::new(HandleKind::Zone, None);
        let slot = block.allocate_slot();
        unsafe { *slot.as_ptr() = Value::from_i64(7) };
        block.visit_occupied_slots(&mut |slot: &Cell<Value>| {
            slot.set(Value::from_i64(8));
        });
        assert_eq!(unsafe { *slot.as_ptr() }, Value::from_i64(8));
    }

    #[test]
    fn reinitialize_rewinds_cursor() {
        let block = Block::new(HandleKind::Scoped, None);
        let first = block.allocate_slot();
        block.allocate_slot();
        block.reinitialize();
        assert_eq!(block.handle_count(), 0);
        assert_eq!(block.allocate_slot(), first);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn zap_marks_tail_and_slots_carry_kind() {
        let block = Block::new(HandleKind::Scoped, None);
        let a = block.allocate_slot();
        let b = block.allocate_slot();
        unsafe { *b.as_ptr() = Value::from_i64(3) };
        block.set_handle_count(1);
        block.zap_unused_tail();
        assert_eq!(unsafe { *b.as_ptr() }, Value::ZAPPED);
        assert_eq!(unsafe { slot_kind(a) }, HandleKind::Scoped);
    }
}
