//! The per-page metadata that backs the buddy allocator.
//!
//! Every physical page of a pool has exactly one [`PageDescriptor`] inside
//! the descriptor table that is handed to the pool at initialization.
//! Only the descriptor at the lowest address of a chunk, the *head*,
//! carries meaningful state.

use super::MAX_POOLS;
use bitflags::bitflags;

bitflags! {
    /// State bits of a page descriptor.
    pub struct PageFlags: u8 {
        /// The chunk headed by this descriptor is handed out.
        const ALLOCATED = 1 << 0;
        /// The descriptor is a member of a free list.
        const LINKED = 1 << 1;
    }
}

/// Identifies one physical memory pool.
///
/// This is the index of the pool inside the pool registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(u8);

impl PoolId {
    /// Create a new pool id.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not below [`MAX_POOLS`].
    pub const fn new(id: u8) -> Self {
        assert!((id as usize) < MAX_POOLS, "pool id exceeds MAX_POOLS");
        Self(id)
    }

    /// The index of this pool inside the registry.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// The links of a descriptor inside its free list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    pub(super) prev: Option<usize>,
    pub(super) next: Option<usize>,
}

impl Link {
    /// A link that is not part of any list.
    pub const UNLINKED: Link = Link {
        prev: None,
        next: None,
    };
}

/// Metadata for a single physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDescriptor {
    pub(super) order: u8,
    pub(super) flags: PageFlags,
    pub(super) pool: Option<PoolId>,
    pub(super) link: Link,
}

impl PageDescriptor {
    /// A zeroed descriptor, used to create static descriptor tables.
    pub const EMPTY: PageDescriptor = PageDescriptor {
        order: 0,
        flags: PageFlags::empty(),
        pool: None,
        link: Link::UNLINKED,
    };

    /// The order of the chunk this descriptor heads.
    pub fn order(&self) -> usize {
        self.order as usize
    }

    /// Whether the chunk headed by this descriptor is allocated.
    pub fn is_allocated(&self) -> bool {
        self.flags.contains(PageFlags::ALLOCATED)
    }

    /// Whether this descriptor is currently part of a free list.
    pub fn is_linked(&self) -> bool {
        self.flags.contains(PageFlags::LINKED)
    }

    /// The pool that owns this descriptor.
    ///
    /// `None` if the descriptor was never touched by a pool.
    pub fn pool(&self) -> Option<PoolId> {
        self.pool
    }

    pub(super) fn set_allocated(&mut self, allocated: bool) {
        self.flags.set(PageFlags::ALLOCATED, allocated);
    }
}

impl Default for PageDescriptor {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A handle to the head descriptor of a chunk.
///
/// This is what the allocator hands out, and what must be given back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRef {
    pool: PoolId,
    index: usize,
}

impl PageRef {
    pub(super) fn new(pool: PoolId, index: usize) -> Self {
        Self { pool, index }
    }

    /// The pool this page belongs to.
    pub fn pool(self) -> PoolId {
        self.pool
    }

    /// The index of the page inside its pool's descriptor table.
    pub fn index(self) -> usize {
        self.index
    }
}
