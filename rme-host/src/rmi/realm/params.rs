use crate::define_bits;
use crate::rmi::HASH_ALGO_SHA256;

pub const RPV_SIZE: usize = 64;

define_bits!(
    RmiRealmFlags,
    Reserved[63 - 3],
    Pmu[2 - 2],
    Sve[1 - 1],
    Lpa2[0 - 0]
);

/// Arguments of REALM_CREATE. Filled in two phases: the configuration
/// items before creation, then the placement fields during creation.
#[derive(Clone, Copy)]
pub struct Params {
    pub flags: u64,
    pub s2sz: u8,
    pub sve_vl: u8,
    pub num_bps: u8,
    pub num_wps: u8,
    pub pmu_num_ctrs: u8,
    pub hash_algo: u8,
    pub rpv: [u8; RPV_SIZE],
    pub vmid: u16,
    pub rtt_base: u64,
    pub rtt_level_start: i64,
    pub rtt_num_start: u32,
}

impl Params {
    pub fn new(s2sz: u8) -> Self {
        Self {
            flags: 0,
            s2sz,
            sve_vl: 0,
            num_bps: 0,
            num_wps: 0,
            pmu_num_ctrs: 0,
            hash_algo: HASH_ALGO_SHA256,
            rpv: [0; RPV_SIZE],
            vmid: 0,
            rtt_base: 0,
            rtt_level_start: 0,
            rtt_num_start: 0,
        }
    }

    pub fn ipa_bits(&self) -> usize {
        self.s2sz as usize
    }

    pub fn set_flag(&mut self, flag: u64) {
        let mut flags = RmiRealmFlags::new(self.flags);
        flags.set_bits(flag);
        self.flags = flags.get();
    }

    pub fn has_flag(&self, flag: u64) -> bool {
        RmiRealmFlags::new(self.flags).get_masked_value(flag) != 0
    }
}

impl core::fmt::Debug for Params {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Params")
            .field(
                "flags",
                &format_args!(
                    "lpa2: {:?} sve: {:?} pmu: {:?}",
                    self.has_flag(RmiRealmFlags::Lpa2),
                    self.has_flag(RmiRealmFlags::Sve),
                    self.has_flag(RmiRealmFlags::Pmu)
                ),
            )
            .field("s2sz", &self.s2sz)
            .field("sve_vl", &self.sve_vl)
            .field("num_bps", &self.num_bps)
            .field("num_wps", &self.num_wps)
            .field("pmu_num_ctrs", &self.pmu_num_ctrs)
            .field("hash_algo", &self.hash_algo)
            .field("vmid", &self.vmid)
            .field("rtt_base", &format_args!("{:#X}", &self.rtt_base))
            .field("rtt_level_start", &self.rtt_level_start)
            .field("rtt_num_start", &self.rtt_num_start)
            .finish()
    }
}
