//! Implementation of a Buddy Allocator that is responsible for allocating
//! the physical pages that will then be used by either the slab allocator
//! to allocate objects, or directly by the kernel.
//!
//! Chunks are identified by the index of their head descriptor inside the
//! descriptor table of the pool. The buddy of a chunk is found by flipping
//! the bit of its address that corresponds to the chunk size, so two buddies
//! always form the next larger, naturally aligned chunk.

use super::{
    free_list::FreeList,
    page::{Link, PageDescriptor, PageFlags, PoolId},
    Error, Result, MAX_ORDER, PAGE_SIZE,
};
use core::cmp;

/// Traces a single split or merge step, if the `logging` feature is enabled.
macro_rules! trace_step {
    ($($args:tt)+) => {
        #[cfg(feature = "logging")]
        log::trace!($($args)+);
    };
}

/// Calculates the size in bytes for the given order.
pub const fn size_for_order(order: usize) -> usize {
    PAGE_SIZE << order
}

/// Calculates the first order where the given `size` would fit in.
///
/// This function may return an order that is not below [`MAX_ORDER`].
pub fn order_for_size(size: usize) -> usize {
    let size = cmp::max(size, PAGE_SIZE);
    let pages = size.next_power_of_two() / PAGE_SIZE;
    pages.trailing_zeros() as usize
}

/// Calculates the smallest order that holds `count` pages.
///
/// This function may return an order that is not below [`MAX_ORDER`].
pub fn order_for_pages(count: usize) -> usize {
    cmp::max(count, 1).next_power_of_two().trailing_zeros() as usize
}

/// The central structure that is responsible for allocating
/// pages of a single pool using the buddy allocation algorithm.
///
/// The allocator does no locking on its own, see [`PhysMemPool`](super::PhysMemPool)
/// for the synchronized version.
pub struct BuddyAllocator<'pages> {
    id: PoolId,
    start: usize,
    size: usize,
    pages: &'pages mut [PageDescriptor],
    free_lists: [FreeList; MAX_ORDER],
}

impl<'pages> BuddyAllocator<'pages> {
    /// Create a buddy allocator that manages one page per descriptor in `pages`,
    /// starting at the address `start`.
    ///
    /// Every page is first marked as an allocated order-0 chunk and then freed,
    /// which coalesces the whole region into the largest chunks possible.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not page aligned, or the region does not
    /// fit into the address space.
    pub fn new(id: PoolId, pages: &'pages mut [PageDescriptor], start: usize) -> Self {
        assert!(
            start % PAGE_SIZE == 0,
            "pool start {:#x} is not page aligned",
            start
        );

        let size = pages
            .len()
            .checked_mul(PAGE_SIZE)
            .filter(|size| start.checked_add(*size).is_some())
            .expect("pool exceeds the address space");

        for page in pages.iter_mut() {
            *page = PageDescriptor {
                order: 0,
                flags: PageFlags::ALLOCATED,
                pool: Some(id),
                link: Link::UNLINKED,
            };
        }

        let mut this = Self {
            id,
            start,
            size,
            pages,
            free_lists: [FreeList::EMPTY; MAX_ORDER],
        };

        for idx in 0..this.pages.len() {
            this.free(idx);
        }

        this
    }

    /// The id of the pool this allocator belongs to.
    pub fn id(&self) -> PoolId {
        self.id
    }

    /// The first address managed by this allocator.
    pub fn start(&self) -> usize {
        self.start
    }

    /// The number of bytes managed by this allocator.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The number of pages managed by this allocator.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Return a copy of the descriptor at the given index.
    pub fn descriptor(&self, idx: usize) -> Option<PageDescriptor> {
        self.pages.get(idx).copied()
    }

    /// Return the address of the page at `idx`.
    pub fn addr_of(&self, idx: usize) -> usize {
        self.start + idx * PAGE_SIZE
    }

    /// Return the index of the page that covers `addr`.
    pub fn index_of(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.start)?;
        if offset < self.size {
            Some(offset / PAGE_SIZE)
        } else {
            None
        }
    }

    /// Calculate the index of the buddy for the chunk headed by `idx`.
    ///
    /// Returns `None` if the buddy is not completely inside this pool.
    fn buddy_of(&self, idx: usize) -> Option<usize> {
        let size = size_for_order(self.pages[idx].order());

        // the addresses of two buddies only differ in the bit that
        // corresponds to their size.
        let buddy = self.addr_of(idx) ^ size;

        let end = buddy.checked_add(size)?;
        if buddy < self.start || end > self.start + self.size {
            return None;
        }

        self.index_of(buddy)
    }

    /// Allocates a chunk of `2^order` pages and returns the index of its head.
    ///
    /// # Panics
    ///
    /// Panics if `order` is not below [`MAX_ORDER`].
    pub fn allocate(&mut self, order: usize) -> Result<usize> {
        assert!(order < MAX_ORDER, "order {} is out of range", order);

        // find the smallest order that has a free chunk available
        let (found, idx) = (order..MAX_ORDER)
            .find_map(|order| self.free_lists[order].first().map(|idx| (order, idx)))
            .ok_or(Error::NoMemoryAvailable)?;

        let page = &self.pages[idx];
        assert_eq!(page.order(), found, "page {} is on the wrong free list", idx);
        assert!(!page.is_allocated(), "page {} is free and allocated", idx);

        let idx = self.split(order, idx);
        self.free_lists[order].remove(self.pages, idx);

        let page = &mut self.pages[idx];
        page.set_allocated(true);
        page.pool = Some(self.id);

        Ok(idx)
    }

    /// Deallocates the chunk headed by `idx` and merges it with its buddies.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is not the head of an allocated chunk of this pool.
    pub fn free(&mut self, idx: usize) {
        assert!(
            idx < self.pages.len(),
            "page {} is out of bounds for this pool",
            idx
        );

        let page = &self.pages[idx];
        let order = page.order();
        assert_eq!(
            page.pool,
            Some(self.id),
            "page {} belongs to another pool",
            idx
        );
        assert!(
            page.is_allocated(),
            "page {} is not an allocated chunk head",
            idx
        );
        assert!(!page.is_linked(), "page {} is already free", idx);
        assert!(
            self.addr_of(idx) % size_for_order(order) == 0,
            "page {} is not aligned to its order {}",
            idx,
            order
        );

        self.pages[idx].set_allocated(false);
        self.free_lists[order].push(self.pages, idx);
        self.merge(idx);
    }

    /// Split the free chunk at `idx` until it has the `target` order.
    ///
    /// Returns the index of the resulting chunk, which is still on the free list.
    fn split(&mut self, target: usize, idx: usize) -> usize {
        loop {
            let order = self.pages[idx].order();
            if order == target {
                return idx;
            }

            assert!(
                order > target,
                "tried to split order {} into {}",
                order,
                target
            );
            assert!(!self.pages[idx].is_allocated());

            self.free_lists[order].remove(self.pages, idx);

            // the lower half keeps the head, the upper half is the new buddy
            let lower = order - 1;
            self.pages[idx].order = lower as u8;
            self.free_lists[lower].push(self.pages, idx);

            let buddy = self
                .buddy_of(idx)
                .expect("upper half of a split chunk must be inside the pool");

            let page = &mut self.pages[buddy];
            page.order = lower as u8;
            page.pool = Some(self.id);
            page.set_allocated(false);
            self.free_lists[lower].push(self.pages, buddy);

            trace_step!("split page {} into order {} buddies {} and {}", idx, lower, idx, buddy);
        }
    }

    /// Merge the free chunk at `idx` with its buddy as long as possible.
    fn merge(&mut self, mut idx: usize) {
        self.pages[idx].set_allocated(false);

        loop {
            let order = self.pages[idx].order();
            if order == MAX_ORDER - 1 {
                break;
            }

            let buddy = match self.buddy_of(idx) {
                Some(buddy) => buddy,
                None => break,
            };

            let other = &self.pages[buddy];
            if other.order() != order || other.is_allocated() {
                break;
            }

            self.free_lists[order].remove(self.pages, idx);
            self.free_lists[order].remove(self.pages, buddy);

            // the buddy with the lower address is the head of the merged chunk
            let head = cmp::min(idx, buddy);
            self.pages[head].order = (order + 1) as u8;
            self.free_lists[order + 1].push(self.pages, head);

            trace_step!("merged pages {} and {} into order {}", idx, buddy, order + 1);
            idx = head;
        }
    }

    /// The number of free chunks with the given order.
    pub fn free_count(&self, order: usize) -> usize {
        self.free_lists.get(order).map_or(0, FreeList::len)
    }

    /// The number of free chunks for every order.
    pub fn free_area(&self) -> [usize; MAX_ORDER] {
        let mut area = [0; MAX_ORDER];
        for (count, list) in area.iter_mut().zip(self.free_lists.iter()) {
            *count = list.len();
        }
        area
    }

    /// The number of bytes that are left for allocation.
    pub fn free_bytes(&self) -> usize {
        self.free_lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.len() * size_for_order(order))
            .sum()
    }

    /// Returns an iterator over the head indices of all free chunks with the given order.
    pub fn free_chunks(&self, order: usize) -> impl Iterator<Item = usize> + '_ {
        self.free_lists[order].iter(&*self.pages)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeSet;

    pub(crate) const POOL: PoolId = PoolId::new(0);

    pub(crate) fn table(count: usize) -> Vec<PageDescriptor> {
        vec![PageDescriptor::EMPTY; count]
    }

    /// Free chunk heads per order, sorted by index.
    fn free_sets(alloc: &BuddyAllocator<'_>) -> Vec<BTreeSet<usize>> {
        (0..MAX_ORDER)
            .map(|order| alloc.free_chunks(order).collect())
            .collect()
    }

    /// Check every invariant of the allocator, given the chunks that are
    /// currently allocated.
    pub(crate) fn check_invariants(alloc: &BuddyAllocator<'_>, allocated: &[usize]) {
        let mut pages = 0;

        for order in 0..MAX_ORDER {
            let chunks = alloc.free_chunks(order).collect::<Vec<_>>();
            assert_eq!(chunks.len(), alloc.free_count(order));

            for idx in chunks {
                let page = alloc.descriptor(idx).unwrap();
                assert_eq!(page.order(), order);
                assert!(!page.is_allocated());
                assert!(page.is_linked());
                assert_eq!(alloc.addr_of(idx) % size_for_order(order), 0);

                if order < MAX_ORDER - 1 {
                    if let Some(buddy) = alloc.buddy_of(idx) {
                        let buddy = alloc.descriptor(buddy).unwrap();
                        assert!(
                            buddy.is_allocated() || buddy.order() != order,
                            "free buddies {} and {:?} were not merged",
                            idx,
                            buddy
                        );
                    }
                }

                pages += 1 << order;
            }
        }

        for &idx in allocated {
            let page = alloc.descriptor(idx).unwrap();
            assert!(page.is_allocated());
            assert!(!page.is_linked());
            assert_eq!(page.pool(), Some(alloc.id()));
            pages += 1 << page.order();
        }

        assert_eq!(pages, alloc.page_count(), "pages were lost or duplicated");
    }

    #[test]
    fn size_and_order() {
        assert_eq!(size_for_order(0), PAGE_SIZE);
        assert_eq!(size_for_order(3), 8 * PAGE_SIZE);

        assert_eq!(order_for_size(0), 0);
        assert_eq!(order_for_size(PAGE_SIZE), 0);
        assert_eq!(order_for_size(PAGE_SIZE + 1), 1);
        assert_eq!(order_for_size(5 * PAGE_SIZE), 3);

        assert_eq!(order_for_pages(0), 0);
        assert_eq!(order_for_pages(1), 0);
        assert_eq!(order_for_pages(2), 1);
        assert_eq!(order_for_pages(3), 2);
        assert_eq!(order_for_pages(8), 3);
    }

    #[test]
    fn buddy_addresses() {
        let mut pages = table(16);
        let mut alloc = BuddyAllocator::new(POOL, &mut pages, 0x10_0000);

        let mut check = |order: u8, idx: usize, buddy: Option<usize>| {
            alloc.pages[idx].order = order;
            assert_eq!(alloc.buddy_of(idx), buddy, "order {}, page {}", order, idx);
        };

        check(0, 0, Some(1));
        check(0, 1, Some(0));
        check(0, 6, Some(7));
        check(1, 2, Some(0));
        check(1, 4, Some(6));
        check(2, 4, Some(0));
        check(3, 8, Some(0));
        // the buddy of the whole pool is outside of it
        check(4, 0, None);
    }

    #[test]
    fn init_power_of_two() {
        let mut pages = table(64);
        let alloc = BuddyAllocator::new(POOL, &mut pages, 0x8000_0000);

        let mut expected = [0; MAX_ORDER];
        expected[6] = 1;
        assert_eq!(alloc.free_area(), expected);
        assert_eq!(alloc.free_bytes(), 64 * PAGE_SIZE);
        check_invariants(&alloc, &[]);
    }

    #[test]
    fn init_binary_decomposition() {
        let mut pages = table(6);
        let alloc = BuddyAllocator::new(POOL, &mut pages, 0x8000_0000);

        let mut expected = [0; MAX_ORDER];
        expected[2] = 1;
        expected[1] = 1;
        assert_eq!(alloc.free_area(), expected);
        assert_eq!(alloc.free_chunks(2).collect::<Vec<_>>(), [0]);
        assert_eq!(alloc.free_chunks(1).collect::<Vec<_>>(), [4]);
        check_invariants(&alloc, &[]);
    }

    #[test]
    fn init_caps_at_max_order() {
        let count = 2 << (MAX_ORDER - 1);
        let mut pages = table(count + 1);
        let alloc = BuddyAllocator::new(POOL, &mut pages, 0);

        let mut expected = [0; MAX_ORDER];
        expected[MAX_ORDER - 1] = 2;
        expected[0] = 1;
        assert_eq!(alloc.free_area(), expected);
        check_invariants(&alloc, &[]);
    }

    #[test]
    fn init_unaligned_start() {
        // pages 1..=4 of the address space: page 1 and 4 have no buddy
        // inside the pool, only 2 and 3 can be merged
        let mut pages = table(4);
        let alloc = BuddyAllocator::new(POOL, &mut pages, PAGE_SIZE);

        let mut expected = [0; MAX_ORDER];
        expected[0] = 2;
        expected[1] = 1;
        assert_eq!(alloc.free_area(), expected);
        assert_eq!(alloc.free_chunks(1).collect::<Vec<_>>(), [1]);
        check_invariants(&alloc, &[]);
    }

    #[test]
    fn empty_pool() {
        let mut pages = table(0);
        let mut alloc = BuddyAllocator::new(POOL, &mut pages, 0x1000);

        assert_eq!(alloc.free_bytes(), 0);
        assert_eq!(alloc.allocate(0), Err(Error::NoMemoryAvailable));
    }

    #[test]
    fn split_and_merge() {
        let mut pages = table(8);
        let mut alloc = BuddyAllocator::new(POOL, &mut pages, 0);

        let idx = alloc.allocate(0).unwrap();
        assert_eq!(idx, 0);
        assert_eq!(&alloc.free_area()[..4], [1, 1, 1, 0]);
        assert_eq!(alloc.free_chunks(0).collect::<Vec<_>>(), [1]);
        assert_eq!(alloc.free_chunks(1).collect::<Vec<_>>(), [2]);
        assert_eq!(alloc.free_chunks(2).collect::<Vec<_>>(), [4]);
        check_invariants(&alloc, &[idx]);

        alloc.free(idx);
        assert_eq!(&alloc.free_area()[..4], [0, 0, 0, 1]);
        check_invariants(&alloc, &[]);
    }

    #[test]
    fn allocation_round_trip_restores_state() {
        let mut pages = table(48);
        let mut alloc = BuddyAllocator::new(POOL, &mut pages, 0);

        // create some fragmentation first
        let a = alloc.allocate(1).unwrap();
        let b = alloc.allocate(0).unwrap();
        let c = alloc.allocate(3).unwrap();
        alloc.free(a);

        for order in 0..6 {
            let before = free_sets(&alloc);
            let idx = alloc.allocate(order).unwrap();
            check_invariants(&alloc, &[b, c, idx]);
            alloc.free(idx);
            assert_eq!(free_sets(&alloc), before, "order {}", order);
        }

        alloc.free(b);
        alloc.free(c);
        check_invariants(&alloc, &[]);
        assert_eq!(alloc.free_bytes(), 48 * PAGE_SIZE);
    }

    #[test]
    fn exhaustion_does_not_mutate() {
        let mut pages = table(6);
        let mut alloc = BuddyAllocator::new(POOL, &mut pages, 0);

        let before = free_sets(&alloc);
        assert_eq!(alloc.allocate(3), Err(Error::NoMemoryAvailable));
        assert_eq!(free_sets(&alloc), before);

        let a = alloc.allocate(2).unwrap();
        let b = alloc.allocate(1).unwrap();
        assert_eq!(alloc.allocate(0), Err(Error::NoMemoryAvailable));
        assert_eq!(alloc.free_bytes(), 0);
        check_invariants(&alloc, &[a, b]);
    }

    #[test]
    fn chunks_are_naturally_aligned() {
        let mut pages = table(32);
        let mut alloc = BuddyAllocator::new(POOL, &mut pages, 0x4000_0000);

        let mut allocated = Vec::new();
        for &order in &[0, 2, 1, 0, 3, 1] {
            let idx = alloc.allocate(order).unwrap();
            assert_eq!(alloc.addr_of(idx) % size_for_order(order), 0);
            assert_eq!(alloc.descriptor(idx).unwrap().order(), order);
            allocated.push(idx);
            check_invariants(&alloc, &allocated);
        }

        for idx in allocated.drain(..).rev() {
            alloc.free(idx);
        }
        assert_eq!(&alloc.free_area()[..6], [0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn random_sequence_keeps_invariants() {
        let mut pages = table(100);
        let mut alloc = BuddyAllocator::new(POOL, &mut pages, 0);
        let mut allocated = Vec::new();

        // xorshift, so the sequence is the same on every run
        let mut state = 0x2545_f491_u32;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as usize
        };

        for _ in 0..2_000 {
            if allocated.is_empty() || next() % 3 != 0 {
                if let Ok(idx) = alloc.allocate(next() % 4) {
                    allocated.push(idx);
                }
            } else {
                let idx = allocated.swap_remove(next() % allocated.len());
                alloc.free(idx);
            }
            check_invariants(&alloc, &allocated);
        }

        for idx in allocated.drain(..) {
            alloc.free(idx);
        }
        check_invariants(&alloc, &[]);
        assert_eq!(alloc.free_bytes(), 100 * PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "not an allocated chunk head")]
    fn double_free() {
        let mut pages = table(4);
        let mut alloc = BuddyAllocator::new(POOL, &mut pages, 0);

        let idx = alloc.allocate(0).unwrap();
        alloc.free(idx);
        alloc.free(idx);
    }

    #[test]
    #[should_panic(expected = "not an allocated chunk head")]
    fn free_interior_page() {
        let mut pages = table(4);
        let mut alloc = BuddyAllocator::new(POOL, &mut pages, 0);

        let idx = alloc.allocate(2).unwrap();
        alloc.free(idx + 1);
    }

    #[test]
    #[should_panic(expected = "not page aligned")]
    fn unaligned_start() {
        let mut pages = table(4);
        BuddyAllocator::new(POOL, &mut pages, 0x123);
    }

    #[test]
    #[should_panic]
    fn allocate_invalid_order() {
        let mut pages = table(4);
        let mut alloc = BuddyAllocator::new(POOL, &mut pages, 0);
        let _ = alloc.allocate(MAX_ORDER);
    }
}
