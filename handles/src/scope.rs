use core::marker::PhantomData;
use std::ptr::NonNull;

use crate::{
    BlockArena, HandleStore, SlotValue, SystemArena,
    store::RestorePoint,
};

/// Lexical region of scoped handle allocations.
///
/// Opening a scope records the scoped chain's head block and cursor; dropping
/// it rewinds the chain to that point, releasing any blocks grown in between.
/// Scopes nest and must be dropped in reverse order of creation. Only the
/// innermost open scope may allocate: a slot taken through an outer scope
/// would sit above an inner scope's restore point and be released with it.
/// Since every [`Handle`] borrows the scope it came from, a handle cannot
/// outlive the slot it points to.
pub struct HandleScope<'s, T: SlotValue, const N: usize, A: BlockArena = SystemArena> {
    store: &'s HandleStore<T, N, A>,
    restore: RestorePoint<T, N>,
}

/// A copyable, scope-bounded rooted slot.
///
/// The collector may rewrite the slot while the handle is alive, so always
/// go through [`Handle::value`] instead of caching the word.
pub struct Handle<'scope, T> {
    slot: NonNull<T>,
    _scope: PhantomData<&'scope T>,
}

impl<'scope, T> Clone for Handle<'scope, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'scope, T> Copy for Handle<'scope, T> {}

impl<'s, T: SlotValue, const N: usize, A: BlockArena> HandleScope<'s, T, N, A> {
    #[inline(always)]
    pub fn new(store: &'s HandleStore<T, N, A>) -> Self {
        Self {
            store,
            restore: store.open_scope(),
        }
    }

    #[inline(always)]
    pub fn store(&self) -> &'s HandleStore<T, N, A> {
        self.store
    }

    /// Nesting level of this scope, starting at 1.
    #[inline(always)]
    pub fn depth(&self) -> usize {
        self.restore.depth
    }

    /// Raw scoped slot, initialised to [`SlotValue::NULL`].
    ///
    /// # Panics
    /// If a scope opened after this one is still open.
    #[inline(always)]
    pub fn allocate(&self) -> NonNull<T> {
        assert_eq!(
            self.restore.depth,
            self.store.scope_depth(),
            "handle allocated in a scope that is not innermost"
        );
        self.store.allocate_scoped_handle()
    }

    #[inline(always)]
    pub fn handle(&self, value: T) -> Handle<'_, T> {
        let slot = self.allocate();
        // SAFETY: the slot belongs to this scope and stays allocated until it
        // drops, which the returned borrow outlives
        unsafe {
            slot.as_ptr().write(value);
            Handle::from_slot(slot)
        }
    }

    /// Opens an inner scope. Handles of `self` stay usable inside it, but new
    /// ones have to come from the inner scope until it drops.
    #[inline(always)]
    pub fn nested(&self) -> HandleScope<'_, T, N, A> {
        HandleScope::new(self.store)
    }
}

impl<T: SlotValue, const N: usize, A: BlockArena> Drop for HandleScope<'_, T, N, A> {
    fn drop(&mut self) {
        self.store.close_scope(&self.restore);
    }
}

impl<T: SlotValue, const N: usize, A: BlockArena> std::fmt::Debug for HandleScope<'_, T, N, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleScope")
            .field("depth", &self.restore.depth)
            .field("saved_top", &self.restore.top)
            .finish()
    }
}

impl<'scope, T: Copy> Handle<'scope, T> {
    /// # Safety
    /// `slot` must be an allocated handle slot that outlives `'scope`.
    #[inline(always)]
    pub(crate) unsafe fn from_slot(slot: NonNull<T>) -> Self {
        Self {
            slot,
            _scope: PhantomData,
        }
    }

    #[inline(always)]
    pub fn value(&self) -> T {
        // SAFETY: the slot stays allocated for 'scope
        unsafe { *self.slot.as_ptr() }
    }

    #[inline(always)]
    pub fn set(&self, value: T) {
        // SAFETY: the slot stays allocated for 'scope; slots are plain words
        // only touched by the owning thread and by visitors at safepoints
        unsafe { *self.slot.as_ptr() = value };
    }

    #[inline(always)]
    pub fn slot(&self) -> NonNull<T> {
        self.slot
    }
}

impl<T: Copy + std::fmt::Debug> std::fmt::Debug for Handle<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Handle").field(&self.value()).finish()
    }
}
