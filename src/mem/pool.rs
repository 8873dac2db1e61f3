//! A physical memory pool, which is one contiguous region of memory
//! that is managed by its own, locked buddy allocator.

use super::{
    buddy::{order_for_pages, BuddyAllocator},
    page::{PageDescriptor, PageRef, PoolId},
    AllocStats, Error, Result, MAX_ORDER, PAGE_SIZE,
};
use crate::unit;
use core::slice;
use spin::Mutex;

/// One contiguous region of physical memory.
///
/// All mutation of the free lists and descriptors happens under the pool's
/// lock, so different pools never contend with each other.
pub struct PhysMemPool<'pages> {
    id: PoolId,
    start: usize,
    size: usize,
    buddy: Mutex<BuddyAllocator<'pages>>,
}

impl<'pages> PhysMemPool<'pages> {
    /// Create a pool that manages `page_count` pages starting at `start`,
    /// using the first `page_count` descriptors of `table` as metadata.
    ///
    /// # Panics
    ///
    /// Panics if `table` has less than `page_count` descriptors,
    /// or `start` is not page aligned.
    pub fn new(
        id: PoolId,
        table: &'pages mut [PageDescriptor],
        start: usize,
        page_count: usize,
    ) -> Self {
        assert!(
            table.len() >= page_count,
            "descriptor table holds {} entries, but the pool has {} pages",
            table.len(),
            page_count
        );

        let buddy = BuddyAllocator::new(id, &mut table[..page_count], start);
        let size = buddy.size();

        log::info!(
            "Made {} at {:#x} available in pool {}",
            unit::bytes(size),
            start,
            id.index()
        );

        Self {
            id,
            start,
            size,
            buddy: Mutex::new(buddy),
        }
    }

    /// Create a pool from a raw descriptor table.
    ///
    /// # Safety
    ///
    /// `table` must point to `page_count` descriptors that are valid to write
    /// and not used by anything else for the lifetime `'pages`.
    pub unsafe fn from_raw_parts(
        id: PoolId,
        table: *mut PageDescriptor,
        start: usize,
        page_count: usize,
    ) -> Self {
        assert!(!table.is_null(), "descriptor table pointer is NULL");
        let table = slice::from_raw_parts_mut(table, page_count);
        Self::new(id, table, start, page_count)
    }

    /// The id of this pool.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// The first address that is managed by this pool.
    pub fn start(&self) -> usize {
        self.start
    }

    /// The number of bytes that are managed by this pool.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The number of pages that are managed by this pool.
    pub fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// Check whether `addr` is inside this pool.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr - self.start < self.size
    }

    /// Check whether this pool and `other` share any address.
    pub fn overlaps(&self, other: &PhysMemPool<'_>) -> bool {
        self.size != 0
            && other.size != 0
            && self.start < other.start + other.size
            && other.start < self.start + self.size
    }

    /// Allocate a chunk of `2^order` contiguous pages.
    ///
    /// An order that is not below [`MAX_ORDER`] is rejected
    /// without touching the pool.
    pub fn get_pages(&self, order: usize) -> Result<PageRef> {
        if order >= MAX_ORDER {
            log::warn!(
                "tried to allocate order {}, but the largest order is {}",
                order,
                MAX_ORDER - 1
            );
            return Err(Error::OrderTooLarge);
        }

        let idx = self.buddy.lock().allocate(order).map_err(|err| {
            log::debug!("pool {} has no free chunk of order {}", self.id.index(), order);
            err
        })?;

        Ok(PageRef::new(self.id, idx))
    }

    /// Allocate at least `count` contiguous pages.
    ///
    /// The number of pages is rounded up to the next power of two.
    pub fn alloc_pages(&self, count: usize) -> Result<PageRef> {
        if count == 0 {
            return Err(Error::AllocateZeroPages);
        }

        self.get_pages(order_for_pages(count))
    }

    /// Give a chunk that was allocated by [`get_pages`](Self::get_pages) back to this pool.
    ///
    /// # Panics
    ///
    /// Panics if the page belongs to another pool, or is not the head
    /// of an allocated chunk.
    pub fn free_pages(&self, page: PageRef) {
        assert_eq!(
            page.pool(),
            self.id,
            "tried to free a page of another pool"
        );
        self.buddy.lock().free(page.index());
    }

    /// Return the address of the first byte covered by `page`.
    ///
    /// # Panics
    ///
    /// Panics if the page does not belong to this pool.
    pub fn page_to_virt(&self, page: PageRef) -> usize {
        assert_eq!(page.pool(), self.id, "page belongs to another pool");
        assert!(
            page.index() < self.page_count(),
            "page {} is out of bounds for pool {}",
            page.index(),
            self.id.index()
        );

        self.start + page.index() * PAGE_SIZE
    }

    /// Return the page of this pool that covers `addr`.
    pub fn virt_to_page(&self, addr: usize) -> Option<PageRef> {
        if self.contains(addr) {
            Some(PageRef::new(self.id, (addr - self.start) / PAGE_SIZE))
        } else {
            None
        }
    }

    /// Return a copy of the descriptor for the given page.
    pub fn descriptor(&self, page: PageRef) -> Option<PageDescriptor> {
        if page.pool() != self.id {
            return None;
        }
        self.buddy.lock().descriptor(page.index())
    }

    /// The number of bytes that are left for allocation.
    pub fn free_bytes(&self) -> usize {
        self.buddy.lock().free_bytes()
    }

    /// The number of free chunks with the given order.
    pub fn free_count(&self, order: usize) -> usize {
        self.buddy.lock().free_count(order)
    }

    /// The number of free chunks for every order.
    pub fn free_area(&self) -> [usize; MAX_ORDER] {
        self.buddy.lock().free_area()
    }

    /// Return the statistics for this pool.
    pub fn stats(&self) -> AllocStats {
        let free = self.free_bytes();
        AllocStats {
            free,
            allocated: self.size - free,
            total: self.size,
            ..AllocStats::with_name("Buddy Allocator")
        }
    }
}
