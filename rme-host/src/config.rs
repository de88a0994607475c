pub const PAGE_BITS: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

pub const RTT_STRIDE: usize = PAGE_BITS - 3;
pub const RTT_BLOCK_LEVEL: usize = 2;
pub const RTT_MAX_LEVEL: usize = 3;

pub const LARGE_PAGE_SIZE: usize = 1 << (PAGE_BITS + RTT_STRIDE); // 2MiB

pub const MIN_IPA_BITS: usize = 32;

pub const VMID_BITS: usize = 16;

/// Tunables of the mapping engine, held per realm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policy {
    /// Collapse emptied tables back into their parents after every unmap.
    pub fold_after_unmap: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            fold_after_unmap: false,
        }
    }
}
