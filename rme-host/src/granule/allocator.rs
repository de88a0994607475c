use super::{AllocationContext, Holder, HostMemory, Ownership};
use crate::rmi::error::{Error, InternalError};
use crate::rmi::Monitor;

use alloc::collections::btree_map::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Per-realm source of delegated granules.
///
/// Keeps at most one delegated, unused granule as a spare so that a table
/// split under a spinning lock can always make progress, and records the
/// ownership of every granule it has delegated.
pub struct GranuleAllocator {
    monitor: Arc<dyn Monitor>,
    host: Arc<dyn HostMemory>,
    spare: Option<usize>,
    ledger: BTreeMap<usize, Ownership>,
}

impl GranuleAllocator {
    pub fn new(monitor: Arc<dyn Monitor>, host: Arc<dyn HostMemory>) -> Self {
        Self {
            monitor,
            host,
            spare: None,
            ledger: BTreeMap::new(),
        }
    }

    pub fn monitor(&self) -> &dyn Monitor {
        self.monitor.as_ref()
    }

    pub fn host(&self) -> &dyn HostMemory {
        self.host.as_ref()
    }

    /// Hands out a delegated granule, preferring the cached spare.
    pub fn acquire(&mut self, ctx: AllocationContext, holder: Holder) -> Result<usize, Error> {
        if let Some(addr) = self.spare.take() {
            self.ledger.insert(addr, Ownership::DelegatedOwned(holder));
            return Ok(addr);
        }

        let addr = self
            .host
            .alloc_pages(1, ctx)
            .ok_or(Error::RmiErrorOthers(InternalError::OutOfMemory))?;

        if let Err(e) = self.monitor.granule_delegate(addr) {
            warn!("granule {:#X} could not be delegated: {:?}", addr, e);
            self.host.free_pages(addr, 1);
            return Err(Error::RmiErrorOthers(InternalError::OutOfMemory));
        }
        self.ledger.insert(addr, Ownership::DelegatedOwned(holder));
        Ok(addr)
    }

    /// Gives back a granule obtained from `acquire`. Never fails: a granule
    /// that cannot be undelegated stays out of the host's reach.
    pub fn release(&mut self, addr: usize) {
        if self.spare.is_none() {
            self.spare = Some(addr);
            self.ledger.insert(addr, Ownership::DelegatedOwned(Holder::Spare));
            return;
        }
        let _ = self.reclaim(addr);
    }

    /// Tops up the spare. Failing here is not fatal to the caller.
    pub fn ensure_spare(&mut self, ctx: AllocationContext) -> bool {
        if self.spare.is_some() {
            return true;
        }
        match self.acquire(ctx, Holder::Spare) {
            Ok(addr) => {
                self.spare = Some(addr);
                true
            }
            Err(_) => false,
        }
    }

    /// Delegates a page the allocator did not allocate itself.
    pub fn delegate(&mut self, addr: usize, holder: Holder) -> Result<(), Error> {
        self.monitor.granule_delegate(addr)?;
        self.ledger.insert(addr, Ownership::DelegatedOwned(holder));
        Ok(())
    }

    pub fn undelegate(&mut self, addr: usize) -> Result<(), Error> {
        match self.monitor.granule_undelegate(addr) {
            Ok(()) => {
                self.ledger.remove(&addr);
                Ok(())
            }
            Err(e) => {
                self.leak(addr);
                Err(e)
            }
        }
    }

    /// Undelegates and returns the page to the host.
    pub fn reclaim(&mut self, addr: usize) -> Result<(), Error> {
        self.undelegate(addr)?;
        self.host.free_pages(addr, 1);
        Ok(())
    }

    /// Gives up on a granule whose monitor-side state is unknown.
    pub fn leak(&mut self, addr: usize) {
        error!("granule {:#X} is leaked", addr);
        self.ledger.insert(addr, Ownership::Leaked);
    }

    pub fn drain_spare(&mut self) -> Result<(), Error> {
        match self.spare.take() {
            Some(addr) => self.reclaim(addr),
            None => Ok(()),
        }
    }

    pub fn spare(&self) -> Option<usize> {
        self.spare
    }

    pub fn ownership(&self, addr: usize) -> Ownership {
        self.ledger.get(&addr).copied().unwrap_or(Ownership::Free)
    }

    /// Number of granules currently delegated through this allocator.
    pub fn delegated(&self) -> usize {
        self.ledger
            .values()
            .filter(|o| matches!(o, Ownership::DelegatedOwned(_)))
            .count()
    }

    pub fn delegated_as(&self, holder: Holder) -> usize {
        self.ledger
            .values()
            .filter(|o| **o == Ownership::DelegatedOwned(holder))
            .count()
    }

    pub fn leaked(&self) -> Vec<usize> {
        self.ledger
            .iter()
            .filter(|(_, o)| **o == Ownership::Leaked)
            .map(|(addr, _)| *addr)
            .collect()
    }
}
