//! Handle storage for one mutator.
//!
//! A [`HandleStore`] owns two chains of [`HandleBlock`]s:
//!
//! ```text
//! zone chain:    head ─▶ full ─▶ full ─▶ None          (grows until reset)
//! scoped chain:  head ─▶ full ─▶ first_scoped_block    (grows and shrinks with scopes)
//! ```
//!
//! Both chains are prepend-only: the head is the block receiving
//! allocations and every block behind it is full. The first scoped block is
//! stored inline so a store that never nests deeply never touches its arena.
//! Scoped handles are reclaimed by [`HandleScope`](crate::HandleScope), zone
//! handles only by [`HandleStore::reset`] or dropping the store.

use std::{
    alloc::{Layout, handle_alloc_error},
    cell::{Cell, RefCell},
    marker::PhantomData,
    ptr::NonNull,
};

use smallvec::SmallVec;

use crate::{
    BlockArena, Handle, HandleBlock, HandleConfig, HandleKind, HandleRef, HandleScope,
    HandleVisitor, ObjectPointerVisitor, RootProvider, SlotValue, SystemArena, Value,
};

/// Slots per block of the VM's handle store.
pub const VM_HANDLES_PER_BLOCK: usize = 63;

/// Handle store used by VM threads.
pub type VmHandles<A = SystemArena> = HandleStore<Value, VM_HANDLES_PER_BLOCK, A>;

type BlockPtr<T, const N: usize> = NonNull<HandleBlock<T, N>>;

/// How far [`HandleStore::visit_unvisited_scoped_handles`] has progressed.
struct Watermark<T, const N: usize> {
    block: BlockPtr<T, N>,
    top: usize,
}

impl<T, const N: usize> Clone for Watermark<T, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const N: usize> Copy for Watermark<T, N> {}

/// Boxed so the inline first block keeps its address when the store moves.
struct StoreState<T, const N: usize> {
    zone_blocks: Cell<Option<BlockPtr<T, N>>>,
    scoped_blocks: Cell<BlockPtr<T, N>>,
    first_scoped_block: HandleBlock<T, N>,
    watermark: Cell<Option<Watermark<T, N>>>,
    /// Number of open scopes.
    scope_depth: Cell<usize>,
    visiting: Cell<bool>,
}

/// What a scope needs to undo its allocations.
pub(crate) struct RestorePoint<T, const N: usize> {
    pub(crate) block: BlockPtr<T, N>,
    pub(crate) top: usize,
    pub(crate) depth: usize,
}

/// The part of a store its owning context and pools may touch.
pub trait HandleAccounting {
    /// Drops every handle and returns to the just-constructed state.
    fn reset(&mut self);
    fn is_empty(&self) -> bool;
    fn count_zone_handles(&self) -> usize;
    fn count_scoped_handles(&self) -> usize;
    fn zone_handles_capacity_in_bytes(&self) -> usize;
    fn scoped_handles_capacity_in_bytes(&self) -> usize;
}

pub struct HandleStore<T: SlotValue, const N: usize, A: BlockArena = SystemArena> {
    state: Box<StoreState<T, N>>,
    arena: RefCell<A>,
    config: HandleConfig,
}

// SAFETY: every block reachable from the store is owned by it. Scopes and
// handles borrow the store, so it cannot change threads while any exist.
unsafe impl<T, const N: usize, A> Send for HandleStore<T, N, A>
where
    T: SlotValue + Send,
    A: BlockArena + Send,
{
}

struct Chain<'a, T, const N: usize> {
    next: Option<BlockPtr<T, N>>,
    _marker: PhantomData<&'a HandleBlock<T, N>>,
}

impl<'a, T: SlotValue, const N: usize> Iterator for Chain<'a, T, N> {
    type Item = &'a HandleBlock<T, N>;

    fn next(&mut self) -> Option<Self::Item> {
        let ptr = self.next?;
        // SAFETY: blocks on a chain stay alive while the store is borrowed
        // and are only released by scope exit, which is fatal while visiting
        let block = unsafe { &*ptr.as_ptr() };
        self.next = block.next();
        Some(block)
    }
}

/// Marks the store as being visited for the lifetime of the guard.
struct VisitGuard<'a> {
    flag: &'a Cell<bool>,
    prev: bool,
}

impl Drop for VisitGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.prev);
    }
}

impl<T: SlotValue, const N: usize> HandleStore<T, N, SystemArena> {
    pub fn new() -> Self {
        Self::with_arena(SystemArena, HandleConfig::default())
    }

    pub fn with_config(config: HandleConfig) -> Self {
        Self::with_arena(SystemArena, config)
    }
}

impl<T: SlotValue, const N: usize> Default for HandleStore<T, N, SystemArena> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SlotValue, const N: usize, A: BlockArena> HandleStore<T, N, A> {
    pub fn with_arena(arena: A, config: HandleConfig) -> Self {
        const { assert!(N > 0, "handle blocks need at least one slot") };

        let state = Box::new(StoreState {
            zone_blocks: Cell::new(None),
            scoped_blocks: Cell::new(NonNull::dangling()),
            first_scoped_block: HandleBlock::new(HandleKind::Scoped, None),
            watermark: Cell::new(None),
            scope_depth: Cell::new(0),
            visiting: Cell::new(false),
        });
        state
            .scoped_blocks
            .set(NonNull::from(&state.first_scoped_block));

        let store = Self {
            state,
            arena: RefCell::new(arena),
            config,
        };
        if store.config.trace_handles {
            log::debug!("*** starting handle store {:p}", store.id());
        }
        store
    }

    #[inline(always)]
    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    /// The arena backing this store's blocks.
    pub fn arena(&self) -> std::cell::Ref<'_, A> {
        self.arena.borrow()
    }

    #[inline(always)]
    fn id(&self) -> *const StoreState<T, N> {
        &*self.state
    }

    #[inline(always)]
    fn first_scoped_block(&self) -> BlockPtr<T, N> {
        NonNull::from(&self.state.first_scoped_block)
    }

    fn zone_chain(&self) -> Chain<'_, T, N> {
        Chain {
            next: self.state.zone_blocks.get(),
            _marker: PhantomData,
        }
    }

    fn scoped_chain(&self) -> Chain<'_, T, N> {
        Chain {
            next: Some(self.state.scoped_blocks.get()),
            _marker: PhantomData,
        }
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocates a handle that lives until [`HandleStore::reset`] or drop.
    ///
    /// The slot starts out as [`SlotValue::NULL`].
    #[inline]
    pub fn allocate_zone_handle(&self) -> NonNull<T> {
        debug_assert!(
            !self.state.visiting.get(),
            "handle allocated during root visitation"
        );
        let head = match self.state.zone_blocks.get() {
            // SAFETY: zone blocks live until reset or drop
            Some(head) if !unsafe { head.as_ref() }.is_full() => head,
            current => {
                let block = self.new_block(HandleKind::Zone, current);
                self.state.zone_blocks.set(Some(block));
                block
            }
        };
        // SAFETY: see above
        unsafe { head.as_ref() }.allocate_slot()
    }

    /// Allocates a handle in the innermost open scope. It is reclaimed when
    /// that scope closes, or on reset if no scope is open.
    #[inline]
    pub fn allocate_scoped_handle(&self) -> NonNull<T> {
        debug_assert!(
            !self.state.visiting.get(),
            "handle allocated during root visitation"
        );
        let mut head = self.state.scoped_blocks.get();
        // SAFETY: the scoped head is always alive
        if unsafe { head.as_ref() }.is_full() {
            head = self.new_block(HandleKind::Scoped, Some(head));
            self.state.scoped_blocks.set(head);
        }
        // SAFETY: see above
        unsafe { head.as_ref() }.allocate_slot()
    }

    /// Typed zone handle holding `value`.
    pub fn zone_handle(&self, value: T) -> Handle<'_, T> {
        let slot = self.allocate_zone_handle();
        // SAFETY: freshly allocated, lives as long as the store borrow since
        // reset needs `&mut self`
        unsafe {
            slot.as_ptr().write(value);
            Handle::from_slot(slot)
        }
    }

    /// Opens a scope; scoped handles allocated until it drops die with it.
    pub fn scope(&self) -> HandleScope<'_, T, N, A> {
        HandleScope::new(self)
    }

    /// Runs `f` inside a fresh scope.
    pub fn with_scope<R>(&self, f: impl FnOnce(&HandleScope<'_, T, N, A>) -> R) -> R {
        let scope = self.scope();
        f(&scope)
    }

    #[cold]
    fn new_block(&self, kind: HandleKind, next: Option<BlockPtr<T, N>>) -> BlockPtr<T, N> {
        let layout = Layout::new::<HandleBlock<T, N>>();
        let raw = match self.arena.borrow_mut().allocate(layout) {
            Ok(raw) => raw,
            Err(err) => {
                log::error!("handle store {:p}: cannot grow {kind:?} chain: {err}", self.id());
                handle_alloc_error(layout)
            }
        };
        let block = raw.cast::<HandleBlock<T, N>>();
        // SAFETY: fresh memory sized and aligned for a block
        unsafe { block.as_ptr().write(HandleBlock::new(kind, next)) };
        if self.config.trace_handles {
            log::debug!(
                "handle store {:p}: new {kind:?} block {:p}",
                self.id(),
                block.as_ptr()
            );
        }
        block
    }

    fn release_block(&self, block: BlockPtr<T, N>) {
        #[cfg(debug_assertions)]
        {
            // SAFETY: the block is unlinked but not yet released
            let block = unsafe { block.as_ref() };
            block.set_handle_count(0);
            block.zap_unused_tail();
        }
        let layout = Layout::new::<HandleBlock<T, N>>();
        // SAFETY: every non-inline block came from new_block with this layout
        // and is no longer reachable from either chain
        unsafe { self.arena.borrow_mut().release(block.cast(), layout) };
    }

    fn delete_zone_blocks(&self) {
        let mut next = self.state.zone_blocks.take();
        while let Some(block) = next {
            // SAFETY: still alive, released right after
            next = unsafe { block.as_ref() }.next();
            self.release_block(block);
        }
    }

    // ── Scopes ────────────────────────────────────────────────────────

    pub(crate) fn open_scope(&self) -> RestorePoint<T, N> {
        let block = self.state.scoped_blocks.get();
        let depth = self.state.scope_depth.get() + 1;
        self.state.scope_depth.set(depth);
        RestorePoint {
            block,
            // SAFETY: the scoped head is always alive
            top: unsafe { block.as_ref() }.handle_count(),
            depth,
        }
    }

    pub(crate) fn close_scope(&self, point: &RestorePoint<T, N>) {
        assert!(
            !self.state.visiting.get(),
            "handle scope closed during root visitation"
        );
        let depth = self.state.scope_depth.get();
        assert_eq!(
            depth, point.depth,
            "handle scopes must be closed in LIFO order"
        );
        self.state.scope_depth.set(depth - 1);
        self.truncate_scoped(point.block, point.top);
        if self.config.trace_handles {
            log::debug!(
                "handle store {:p}: closed scope at depth {depth}, {} scoped handles remain",
                self.id(),
                self.count_scoped_handles()
            );
        }
    }

    /// Pops scoped blocks down to `saved` and rewinds it to `saved_top`.
    fn truncate_scoped(&self, saved: BlockPtr<T, N>, saved_top: usize) {
        let state = &*self.state;
        let mut mark = state.watermark.get();
        let mut head = state.scoped_blocks.get();
        while head != saved {
            // SAFETY: blocks on the scoped chain are alive
            let Some(next) = (unsafe { head.as_ref() }.next()) else {
                panic!("handle scope restore point is not on the scoped chain");
            };
            if mark.is_some_and(|m| m.block == head) {
                mark = Some(Watermark {
                    block: saved,
                    top: saved_top,
                });
            }
            state.scoped_blocks.set(next);
            self.release_block(head);
            head = next;
        }

        // SAFETY: `saved` is the live scoped head now
        let block = unsafe { saved.as_ref() };
        debug_assert!(
            saved_top <= block.handle_count(),
            "handle scope restore point above the allocation cursor"
        );
        block.set_handle_count(saved_top);
        if let Some(m) = mark {
            if m.block == saved && m.top > saved_top {
                mark = Some(Watermark {
                    block: saved,
                    top: saved_top,
                });
            }
        }
        state.watermark.set(mark);

        #[cfg(debug_assertions)]
        {
            block.zap_unused_tail();
            self.verify_scoped_handle_state();
        }
    }

    /// Every scoped block behind the head must be full and the chain must
    /// end in the inline block.
    #[cfg(debug_assertions)]
    fn verify_scoped_handle_state(&self) {
        let first = self.first_scoped_block();
        let mut last = None;
        for (idx, block) in self.scoped_chain().enumerate() {
            assert!(
                idx == 0 || block.is_full(),
                "scoped handle chain has a partially filled block behind its head"
            );
            assert_eq!(block.kind(), HandleKind::Scoped, "zone block on scoped chain");
            last = Some(NonNull::from(block));
        }
        assert_eq!(last, Some(first), "scoped handle chain lost its first block");
    }

    /// Number of scopes currently open on this store.
    pub fn scope_depth(&self) -> usize {
        self.state.scope_depth.get()
    }

    // ── Reset ─────────────────────────────────────────────────────────

    /// Releases every zone block and every scoped block except the inline
    /// one, which is rewound to empty.
    pub fn reset(&mut self) {
        if self.config.trace_handles {
            log::debug!(
                "*** resetting handle store {:p}: zone = {}, scoped = {}",
                self.id(),
                self.count_zone_handles(),
                self.count_scoped_handles()
            );
        }
        // A leaked (forgotten) scope is the only way to get here with open
        // scopes; its restore point is dropped along with everything else.
        debug_assert_eq!(
            self.state.scope_depth.get(),
            0,
            "handle store reset with open scopes"
        );
        self.state.scope_depth.set(0);
        self.delete_zone_blocks();
        self.truncate_scoped(self.first_scoped_block(), 0);
        self.state.first_scoped_block.reinitialize();
        self.state.watermark.set(None);
    }

    // ── Visitation ────────────────────────────────────────────────────

    fn begin_visit(&self) -> VisitGuard<'_> {
        let flag = &self.state.visiting;
        let prev = flag.replace(true);
        VisitGuard { flag, prev }
    }

    /// Visits every zone and scoped handle exactly once. Order across blocks
    /// is unspecified.
    pub fn visit_object_pointers<V>(&self, visitor: &mut V)
    where
        V: ObjectPointerVisitor<T> + ?Sized,
    {
        let _visit = self.begin_visit();
        for block in self.zone_chain() {
            block.visit_occupied_slots(visitor);
        }
        for block in self.scoped_chain() {
            block.visit_occupied_slots(visitor);
        }
    }

    /// Visits every scoped handle exactly once.
    pub fn visit_scoped_handles<V>(&self, visitor: &mut V)
    where
        V: ObjectPointerVisitor<T> + ?Sized,
    {
        let _visit = self.begin_visit();
        for block in self.scoped_chain() {
            block.visit_occupied_slots(visitor);
        }
    }

    /// Visits the scoped handles allocated since the previous call, in
    /// allocation order, then moves the watermark to the current head.
    ///
    /// The watermark is per store. Two independent callers interleaving on
    /// one store will each see only part of the handles.
    pub fn visit_unvisited_scoped_handles<V>(&self, visitor: &mut V)
    where
        V: ObjectPointerVisitor<T> + ?Sized,
    {
        let _visit = self.begin_visit();
        let mark = self.state.watermark.get();

        // Walk back to the watermark block; the chain links newest to oldest.
        let mut pending: SmallVec<[BlockPtr<T, N>; 8]> = SmallVec::new();
        let mut start = 0;
        let mut found = mark.is_none();
        for block in self.scoped_chain() {
            let ptr = NonNull::from(block);
            pending.push(ptr);
            if let Some(m) = mark {
                if m.block == ptr {
                    start = m.top;
                    found = true;
                    break;
                }
            }
        }
        debug_assert!(found, "stale scoped handle watermark");

        let oldest = pending.len() - 1;
        for (idx, ptr) in pending.iter().enumerate().rev() {
            // SAFETY: collected from the live scoped chain above
            let block = unsafe { ptr.as_ref() };
            let from = if idx == oldest { start } else { 0 };
            block.visit_slots_from(from, visitor);
        }

        let head = self.state.scoped_blocks.get();
        self.state.watermark.set(Some(Watermark {
            block: head,
            // SAFETY: the scoped head is always alive
            top: unsafe { head.as_ref() }.handle_count(),
        }));
    }

    /// Visits every handle through a [`HandleRef`], zone chain first.
    pub fn visit_handles<V>(&self, visitor: &mut V)
    where
        V: HandleVisitor<T> + ?Sized,
    {
        let _visit = self.begin_visit();
        for block in self.zone_chain().chain(self.scoped_chain()) {
            for slot in block.occupied_slots() {
                visitor.visit_handle(HandleRef::new(slot, block.kind()));
            }
        }
    }

    // ── Introspection ─────────────────────────────────────────────────

    pub fn is_empty(&self) -> bool {
        self.state.zone_blocks.get().is_none()
            && self.state.scoped_blocks.get() == self.first_scoped_block()
            && self.state.first_scoped_block.handle_count() == 0
    }

    pub fn count_zone_handles(&self) -> usize {
        self.zone_chain().map(HandleBlock::handle_count).sum()
    }

    pub fn count_scoped_handles(&self) -> usize {
        self.scoped_chain().map(HandleBlock::handle_count).sum()
    }

    pub fn zone_block_count(&self) -> usize {
        self.zone_chain().count()
    }

    /// Includes the inline first block.
    pub fn scoped_block_count(&self) -> usize {
        self.scoped_chain().count()
    }

    pub fn zone_handles_capacity_in_bytes(&self) -> usize {
        self.zone_block_count() * size_of::<HandleBlock<T, N>>()
    }

    pub fn scoped_handles_capacity_in_bytes(&self) -> usize {
        self.scoped_block_count() * size_of::<HandleBlock<T, N>>()
    }

    pub fn is_valid_zone_handle(&self, addr: usize) -> bool {
        self.zone_chain().any(|block| block.is_valid_handle(addr))
    }

    pub fn is_valid_scoped_handle(&self, addr: usize) -> bool {
        self.scoped_chain().any(|block| block.is_valid_handle(addr))
    }

    /// Reads the chain tag stored next to the handle.
    ///
    /// Panics if `handle` is not a live handle of this store.
    #[cfg(debug_assertions)]
    pub fn is_zone_handle(&self, handle: NonNull<T>) -> bool {
        let addr = handle.as_ptr() as usize;
        let is_zone = self.is_valid_zone_handle(addr);
        assert!(
            is_zone || self.is_valid_scoped_handle(addr),
            "not a live handle of this store"
        );
        // SAFETY: validated as a live slot above
        let kind = unsafe { crate::block::slot_kind(handle) };
        assert_eq!(
            kind == HandleKind::Zone,
            is_zone,
            "handle tag disagrees with its chain"
        );
        is_zone
    }
}

impl<T: SlotValue, const N: usize, A: BlockArena> Drop for HandleStore<T, N, A> {
    fn drop(&mut self) {
        if self.config.trace_handles {
            log::debug!(
                "***   handle counts for {:p}: zone = {}, scoped = {}",
                self.id(),
                self.count_zone_handles(),
                self.count_scoped_handles()
            );
            log::debug!("*** deleting handle store {:p}", self.id());
        }
        self.delete_zone_blocks();
        let first = self.first_scoped_block();
        let mut head = self.state.scoped_blocks.replace(first);
        while head != first {
            // SAFETY: scoped blocks other than the inline one are arena owned
            let Some(next) = (unsafe { head.as_ref() }.next()) else {
                break;
            };
            self.release_block(head);
            head = next;
        }
    }
}

impl<T: SlotValue, const N: usize, A: BlockArena> HandleAccounting for HandleStore<T, N, A> {
    fn reset(&mut self) {
        HandleStore::reset(self)
    }

    fn is_empty(&self) -> bool {
        HandleStore::is_empty(self)
    }

    fn count_zone_handles(&self) -> usize {
        HandleStore::count_zone_handles(self)
    }

    fn count_scoped_handles(&self) -> usize {
        HandleStore::count_scoped_handles(self)
    }

    fn zone_handles_capacity_in_bytes(&self) -> usize {
        HandleStore::zone_handles_capacity_in_bytes(self)
    }

    fn scoped_handles_capacity_in_bytes(&self) -> usize {
        HandleStore::scoped_handles_capacity_in_bytes(self)
    }
}

impl<T: SlotValue, const N: usize, A: BlockArena> RootProvider<T> for HandleStore<T, N, A> {
    fn visit_roots(&self, visitor: &mut dyn FnMut(&Cell<T>)) {
        self.visit_object_pointers(visitor);
    }
}

impl<T: SlotValue, const N: usize, A: BlockArena> std::fmt::Debug for HandleStore<T, N, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleStore")
            .field("zone_handles", &self.count_zone_handles())
            .field("scoped_handles", &self.count_scoped_handles())
            .field("zone_blocks", &self.zone_block_count())
            .field("scoped_blocks", &self.scoped_block_count())
            .field("scope_depth", &self.scope_depth())
            .finish()
    }
}
