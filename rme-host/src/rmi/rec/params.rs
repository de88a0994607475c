use crate::define_bits;
use crate::rmi::MAX_REC_AUX_GRANULES;

pub const NR_GPRS: usize = 8;

define_bits!(RmiRecFlags, Reserved[63 - 1], Runnable[0 - 0]);

#[derive(Clone, Copy, Debug, Default)]
pub struct Params {
    pub flags: u64,
    pub mpidr: u64,
    pub pc: u64,
    pub gprs: [u64; NR_GPRS],
    pub num_aux: u64,
    pub aux: [u64; MAX_REC_AUX_GRANULES],
}

impl Params {
    pub fn runnable(&self) -> bool {
        RmiRecFlags::new(self.flags).get_masked_value(RmiRecFlags::Runnable) != 0
    }

    pub fn aux(&self) -> &[u64] {
        &self.aux[..self.num_aux as usize]
    }
}
