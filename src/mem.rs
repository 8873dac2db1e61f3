//! Physical memory management using the buddy allocation algorithm.
//!
//! Every contiguous region of physical memory is managed by one
//! [`PhysMemPool`]. The pools are registered once at boot using [`init`],
//! after which the free functions of this module can be used to translate
//! addresses and to give pages back to the pool they came from.

pub mod buddy;
pub mod free_list;
pub mod page;
pub mod pool;
pub mod registry;

pub use buddy::{order_for_pages, order_for_size, size_for_order};
pub use page::{PageDescriptor, PageFlags, PageRef, PoolId};
pub use pool::PhysMemPool;

use crate::unit;
use core::fmt;
use displaydoc_lite::displaydoc;

/// The size of a single memory page is 4KiB,
/// this is also the size of order-0 in the buddy
/// allocator.
pub const PAGE_SIZE: usize = 4 * unit::KIB;

/// The number of orders the buddy allocator manages.
///
/// Valid orders are `0..MAX_ORDER`, so the largest chunk is
/// `2^(MAX_ORDER - 1)` pages.
pub const MAX_ORDER: usize = 14;

/// The maximum number of pools that can be registered.
pub const MAX_POOLS: usize = 8;

/// Result for every fallible memory operation.
pub type Result<T, E = Error> = core::result::Result<T, E>;

displaydoc! {
    /// Any error that can happen while allocating memory or registering pools.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Error {
        /// tried to allocate an order that exceeded the maximum order.
        OrderTooLarge,
        /// tried to allocate, but there was no free chunk large enough.
        NoMemoryAvailable,
        /// tried to allocate zero pages using `alloc_pages`.
        AllocateZeroPages,
        /// there is no registered pool with the given id.
        UnknownPool,
        /// the pool registry was already initialized.
        AlreadyInitialized,
        /// more pools were registered than the registry can hold.
        TooManyPools,
        /// a pool was registered at a slot that does not match its id.
        MisplacedPool,
        /// two registered pools cover the same addresses.
        OverlappingPools,
    }
}

/// Statistics for a memory allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocStats {
    /// The name of the allocator that collected these stats.
    pub name: &'static str,
    /// The number of bytes that are currently handed out.
    pub allocated: usize,
    /// The number of bytes that are left for allocation.
    pub free: usize,
    /// The total number of bytes that this allocator manages.
    pub total: usize,
}

impl AllocStats {
    /// Create a new [`AllocStats`] instance for the given allocator name.
    pub const fn with_name(name: &'static str) -> Self {
        Self {
            name,
            allocated: 0,
            free: 0,
            total: 0,
        }
    }

    /// Add the numbers of `other` to these stats.
    pub fn merge(&mut self, other: &AllocStats) {
        self.allocated += other.allocated;
        self.free += other.free;
        self.total += other.total;
    }
}

impl fmt::Display for AllocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        self.name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f, "\nAllocated: {}", unit::bytes(self.allocated))?;
        writeln!(f, "Free: {}", unit::bytes(self.free))?;
        writeln!(f, "Total: {}", unit::bytes(self.total))?;
        self.name.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f)?;
        Ok(())
    }
}

/// Register all physical memory pools.
///
/// This must be called exactly once at boot, after every region was
/// turned into a [`PhysMemPool`]. The pool at index `i` must have the id `i`.
pub fn init(pools: &'static [PhysMemPool<'static>]) -> Result<()> {
    registry::global().install(pools)?;

    log::info!(
        "Registered {} physical memory pools with {} of free memory",
        pools.len(),
        unit::bytes(free_bytes())
    );
    Ok(())
}

/// Return the pool with the given id.
///
/// Returns `None` if the registry is not initialized or there's no such pool.
pub fn pool(id: PoolId) -> Option<&'static PhysMemPool<'static>> {
    registry::global().get(id)
}

/// Return all registered pools.
pub fn pools() -> &'static [PhysMemPool<'static>] {
    registry::global().pools()
}

/// Allocate `2^order` contiguous pages from the given pool.
pub fn get_pages(id: PoolId, order: usize) -> Result<PageRef> {
    pool(id).ok_or(Error::UnknownPool)?.get_pages(order)
}

/// Give the chunk back to the pool it was allocated from.
///
/// # Panics
///
/// Panics if the pool of the page was never registered, or if the
/// page is not an allocated chunk head.
pub fn free_pages(page: PageRef) {
    let pool = pool(page.pool()).expect("tried to free a page of an unregistered pool");
    pool.free_pages(page);
}

/// Return the address of the first byte covered by the given page.
///
/// # Panics
///
/// Panics if the pool of the page was never registered.
pub fn page_to_virt(page: PageRef) -> usize {
    registry::global().page_to_virt(page)
}

/// Find the page that covers the given address.
pub fn virt_to_page(addr: usize) -> Option<PageRef> {
    registry::global().virt_to_page(addr)
}

/// Return the number of free bytes across all registered pools.
pub fn free_bytes() -> usize {
    pools().iter().map(|pool| pool.free_bytes()).sum()
}

/// Return the combined statistics of all registered pools.
pub fn stats() -> AllocStats {
    pools()
        .iter()
        .fold(AllocStats::with_name("Physical Memory"), |mut acc, pool| {
            acc.merge(&pool.stats());
            acc
        })
}
