pub mod allocator;

pub use self::allocator::GranuleAllocator;

use crate::config::PAGE_SIZE;

pub const GRANULE_SIZE: usize = PAGE_SIZE;
pub const GRANULE_SHIFT: usize = 12;
pub const GRANULE_MASK: usize = !((1 << GRANULE_SHIFT) - 1);

/// The locking regime a caller runs under.
///
/// Realm and REC creation run under a sleeping lock and may wait for memory.
/// Fault handling and RIPAS changes run under a spinning lock, so every
/// allocation there must fail instead of blocking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationContext {
    MayBlock,
    MustNotBlock,
}

/// Page provider of the hosting hypervisor.
pub trait HostMemory: Send + Sync {
    /// Returns the physical address of `count` contiguous, zeroed pages.
    fn alloc_pages(&self, count: usize, ctx: AllocationContext) -> Option<usize>;
    fn free_pages(&self, addr: usize, count: usize);
    fn copy_page(&self, dst: usize, src: usize);
}

/// What a delegated granule is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Holder {
    Rd,
    Pgd,
    Rtt,
    Data,
    Rec,
    RecAux,
    Spare,
}

/// Ownership of a physical granule, seen from the host.
///
/// `Leaked` is terminal: it is entered only when an undelegate fails,
/// and such a granule is never handed back to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    Free,
    DelegatedOwned(Holder),
    Leaked,
}

pub fn is_granule_aligned(addr: usize) -> bool {
    addr & (GRANULE_SIZE - 1) == 0
}
