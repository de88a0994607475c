use crate::define_bits;

define_bits!(
    S2TTE,
    ADDR[47 - 12],
    AF[10 - 10],
    SH[9 - 8],   // pgtable::SHAREABLE_*
    S2AP[7 - 6], // pgtable::PERM_*
    MEMATTR[5 - 2]
);

const MEMATTR_FWB_NORMAL_WB: u64 = 0b0110;
const SH_INNER: u64 = 0b11;
const S2AP_RW: u64 = 0b11;

/// Leaf descriptor for a host-owned page shared with a realm.
pub fn unprotected_desc(pa: usize) -> usize {
    let mut desc = S2TTE::new(0);
    desc.set_masked_value(S2TTE::ADDR, (pa >> 12) as u64)
        .set_masked_value(S2TTE::MEMATTR, MEMATTR_FWB_NORMAL_WB)
        .set_masked_value(S2TTE::SH, SH_INNER)
        .set_masked_value(S2TTE::S2AP, S2AP_RW);
    desc.get() as usize
}
