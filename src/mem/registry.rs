//! The set of all physical memory pools.
//!
//! Pools are registered once at boot and are read-only afterwards, which
//! makes it possible to find the pool of any physical address without
//! taking a lock.

use super::{
    page::{PageRef, PoolId},
    pool::PhysMemPool,
    Error, Result, MAX_POOLS,
};
use spin::Once;

static REGISTRY: Registry = Registry::new();

/// Return a reference to the global pool registry.
pub fn global() -> &'static Registry {
    &REGISTRY
}

/// A write-once list of memory pools.
pub struct Registry {
    pools: Once<&'static [PhysMemPool<'static>]>,
}

impl Registry {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self { pools: Once::new() }
    }

    /// Install the given pools into this registry.
    ///
    /// The pool at index `i` must have the id `i`, and no two pools
    /// may overlap.
    pub fn install(&self, pools: &'static [PhysMemPool<'static>]) -> Result<()> {
        if self.pools.get().is_some() {
            return Err(Error::AlreadyInitialized);
        }

        if pools.len() > MAX_POOLS {
            return Err(Error::TooManyPools);
        }

        if pools
            .iter()
            .enumerate()
            .any(|(idx, pool)| pool.id().index() != idx)
        {
            return Err(Error::MisplacedPool);
        }

        for (idx, pool) in pools.iter().enumerate() {
            if pools[idx + 1..].iter().any(|other| pool.overlaps(other)) {
                return Err(Error::OverlappingPools);
            }
        }

        // another hart may have won the race since we checked above
        let mut installed = false;
        self.pools.call_once(|| {
            installed = true;
            pools
        });

        if installed {
            Ok(())
        } else {
            Err(Error::AlreadyInitialized)
        }
    }

    /// Return all registered pools.
    ///
    /// The slice is empty if the registry is not initialized yet.
    pub fn pools(&self) -> &'static [PhysMemPool<'static>] {
        self.pools.get().copied().unwrap_or_default()
    }

    /// Return the pool with the given id.
    pub fn get(&self, id: PoolId) -> Option<&'static PhysMemPool<'static>> {
        self.pools().get(id.index())
    }

    /// Return the address of the first byte covered by `page`.
    ///
    /// # Panics
    ///
    /// Panics if the pool of `page` is not registered.
    pub fn page_to_virt(&self, page: PageRef) -> usize {
        self.get(page.pool())
            .expect("page belongs to an unregistered pool")
            .page_to_virt(page)
    }

    /// Find the page that covers `addr` by searching every pool.
    pub fn virt_to_page(&self, addr: usize) -> Option<PageRef> {
        let page = self.pools().iter().find_map(|pool| pool.virt_to_page(addr));

        if page.is_none() {
            log::debug!("address {:#x} is not part of any pool", addr);
        }
        page
    }
}
