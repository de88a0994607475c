pub mod mapping;
pub mod ripas;
pub mod rtt;
pub mod stage2_tte;

use crate::config::{PAGE_BITS, RTT_MAX_LEVEL, RTT_STRIDE};

/// Number of input-address bits resolved below `level`.
pub fn level_shift(level: usize) -> usize {
    RTT_STRIDE * (RTT_MAX_LEVEL + 1 - level) + 3
}

/// Size of the region mapped by one entry at `level`.
pub fn map_size(level: usize) -> usize {
    1 << level_shift(level)
}

pub fn align_down(addr: usize, size: usize) -> usize {
    addr & !(size - 1)
}

pub fn align_up(addr: usize, size: usize) -> usize {
    align_down(addr + size - 1, size)
}

pub fn is_aligned(addr: usize, size: usize) -> bool {
    addr & (size - 1) == 0
}

/// First level of the stage 2 walk for an IPA space of `ipa_bits`.
pub fn start_level(ipa_bits: usize) -> usize {
    let levels = (ipa_bits - 4 - 4) / RTT_STRIDE;
    RTT_MAX_LEVEL + 1 - levels
}

/// Number of concatenated tables making up the start level.
pub fn pgd_pages(ipa_bits: usize, start_level: usize) -> usize {
    // shift of the (virtual) level above the start level
    let shift = RTT_STRIDE * (RTT_MAX_LEVEL + 2 - start_level) + PAGE_BITS - RTT_STRIDE;
    if shift >= ipa_bits {
        1
    } else {
        1 << (ipa_bits - shift)
    }
}
