//! Memory sources for handle blocks.
//!
//! A [`HandleStore`](crate::HandleStore) never allocates on its own. Every
//! block it grows into comes from a [`BlockArena`] and goes back to it when a
//! scope truncates the chain, on reset, and at teardown.

use std::{alloc::Layout, ptr::NonNull};

use thiserror::Error;

use crate::system::{OS_PAGE_SIZE, map_memory, unmap_memory};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArenaError {
    #[error("zone limit exceeded: requested {requested} bytes, limit {limit} bytes")]
    Exhausted { requested: usize, limit: usize },
    #[error("out of memory while reserving {size} bytes")]
    OutOfMemory { size: usize },
    #[error("invalid zone settings: {0}")]
    InvalidSettings(&'static str),
}

/// Supplies raw memory for handle blocks.
pub trait BlockArena {
    /// Returns uninitialised memory fitting `layout`.
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, ArenaError>;

    /// Takes back memory handed out by [`BlockArena::allocate`].
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this arena with the same `layout`
    /// and must not be used afterwards.
    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout);
}

/// Blocks straight from the global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemArena;

impl BlockArena for SystemArena {
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, ArenaError> {
        // SAFETY: handle blocks are never zero sized
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(ArenaError::OutOfMemory {
            size: layout.size(),
        })
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: by contract allocated above with the same layout
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[derive(Debug, Clone)]
pub struct ZoneSettings {
    /// Bytes mapped per chunk. Must be a multiple of the OS page size.
    pub chunk_size: usize,
    /// Upper bound on mapped bytes, `None` for unbounded.
    pub limit: Option<usize>,
}

impl Default for ZoneSettings {
    fn default() -> Self {
        Self {
            chunk_size: 65_536, // 16 pages
            limit: None,
        }
    }
}

impl ZoneSettings {
    pub fn validate(&self) -> Result<(), ArenaError> {
        if self.chunk_size == 0 {
            return Err(ArenaError::InvalidSettings("chunk_size must be > 0"));
        }
        if self.chunk_size % OS_PAGE_SIZE != 0 {
            return Err(ArenaError::InvalidSettings(
                "chunk_size must match OS page alignment",
            ));
        }
        match self.limit {
            Some(limit) if limit < self.chunk_size => Err(
                ArenaError::InvalidSettings("limit must hold at least one chunk"),
            ),
            _ => Ok(()),
        }
    }
}

/// Bump arena over page mapped chunks.
///
/// Released blocks are kept on a free list and handed out again for the same
/// layout, so a scope that repeatedly overflows into a second block does not
/// map new memory each time. Nothing is unmapped before the zone is dropped.
#[derive(Debug)]
pub struct Zone {
    settings: ZoneSettings,
    chunks: Vec<(NonNull<u8>, usize)>,
    /// Bump window inside the newest chunk.
    cursor: usize,
    end: usize,
    free: Vec<(NonNull<u8>, Layout)>,
    mapped_bytes: usize,
    live_bytes: usize,
    recycled_blocks: usize,
}

// SAFETY: the zone exclusively owns its mappings; no pointer into them is
// shared with another thread by the zone itself.
unsafe impl Send for Zone {}

impl Zone {
    pub fn new(settings: ZoneSettings) -> Result<Self, ArenaError> {
        settings.validate()?;
        Ok(Self {
            settings,
            chunks: Vec::new(),
            cursor: 0,
            end: 0,
            free: Vec::new(),
            mapped_bytes: 0,
            live_bytes: 0,
            recycled_blocks: 0,
        })
    }

    pub fn settings(&self) -> &ZoneSettings {
        &self.settings
    }

    /// Bytes currently mapped from the OS.
    pub fn mapped_bytes(&self) -> usize {
        self.mapped_bytes
    }

    /// Bytes handed out and not yet released.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// How many allocations were served from the free list.
    pub fn recycled_blocks(&self) -> usize {
        self.recycled_blocks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    #[inline]
    fn bump(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        let start = self.cursor.checked_next_multiple_of(layout.align())?;
        let end = start.checked_add(layout.size())?;
        if self.cursor == 0 || end > self.end {
            return None;
        }
        self.cursor = end;
        NonNull::new(start as *mut u8)
    }

    #[cold]
    fn map_chunk(&mut self, layout: Layout) -> Result<(), ArenaError> {
        let needed = layout.size() + layout.align().saturating_sub(OS_PAGE_SIZE);
        let size = self
            .settings
            .chunk_size
            .max(needed.next_multiple_of(OS_PAGE_SIZE));
        if let Some(limit) = self.settings.limit {
            if self.mapped_bytes + size > limit {
                return Err(ArenaError::Exhausted {
                    requested: layout.size(),
                    limit,
                });
            }
        }
        let chunk = map_memory(size).ok_or(ArenaError::OutOfMemory { size })?;
        log::trace!("zone mapped chunk {:p} ({size} bytes)", chunk.as_ptr());
        self.chunks.push((chunk, size));
        self.mapped_bytes += size;
        self.cursor = chunk.as_ptr() as usize;
        self.end = self.cursor + size;
        Ok(())
    }
}

impl BlockArena for Zone {
    fn allocate(&mut self, layout: Layout) -> Result<NonNull<u8>, ArenaError> {
        if let Some(idx) = self.free.iter().rposition(|&(_, l)| l == layout) {
            let (ptr, _) = self.free.swap_remove(idx);
            self.live_bytes += layout.size();
            self.recycled_blocks += 1;
            return Ok(ptr);
        }
        let ptr = match self.bump(layout) {
            Some(ptr) => ptr,
            None => {
                self.map_chunk(layout)?;
                self.bump(layout)
                    .ok_or(ArenaError::OutOfMemory { size: layout.size() })?
            }
        };
        self.live_bytes += layout.size();
        Ok(ptr)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, layout: Layout) {
        debug_assert!(
            self.chunks.iter().any(|&(chunk, size)| {
                let start = chunk.as_ptr() as usize;
                (start..start + size).contains(&(ptr.as_ptr() as usize))
            }),
            "released memory does not belong to this zone"
        );
        self.live_bytes -= layout.size();
        self.free.push((ptr, layout));
    }
}

impl Drop for Zone {
    fn drop(&mut self) {
        for &(chunk, size) in &self.chunks {
            // SAFETY: every chunk came from map_memory with this size and the
            // zone is the last user of it
            unsafe { unmap_memory(chunk, size) };
        }
    }
}
