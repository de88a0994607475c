use crate::config::MIN_IPA_BITS;
use crate::define_bits;
use crate::rmi::error::{Error, InternalError};
use crate::rmi::Monitor;

use spin::mutex::Mutex;

define_bits!(
    FeatureReg0,
    HASH_SHA_512[29 - 29],
    HASH_SHA_256[28 - 28],
    PMU_NUM_CTRS[27 - 23],
    PMU_EN[22 - 22],
    NUM_WPS[21 - 18],
    NUM_BPS[17 - 14],
    SVE_VL[13 - 10],
    SVE_EN[9 - 9],
    LPA2[8 - 8],
    S2SZ[7 - 0]
);

const FEATURE_REGISTER_0_INDEX: usize = 0;
const SUPPORTED: u64 = 1;

lazy_static! {
    static ref FEAT_REG0: Mutex<Option<FeatureReg0>> = Mutex::new(None);
}

impl FeatureReg0 {
    pub fn supports(&self, feature: u64) -> bool {
        self.get_masked_value(feature) == SUPPORTED
    }

    pub fn ipa_limit(&self) -> usize {
        self.get_masked_value(Self::S2SZ) as usize
    }

    pub fn num_bps(&self) -> usize {
        self.get_masked_value(Self::NUM_BPS) as usize
    }

    pub fn num_wps(&self) -> usize {
        self.get_masked_value(Self::NUM_WPS) as usize
    }

    pub fn max_sve_vl(&self) -> usize {
        self.get_masked_value(Self::SVE_VL) as usize
    }

    pub fn pmu_num_ctrs(&self) -> usize {
        self.get_masked_value(Self::PMU_NUM_CTRS) as usize
    }

    /// Whether a realm may use an IPA space of `s2sz` bits.
    pub fn validate(&self, s2sz: usize) -> bool {
        (MIN_IPA_BITS..=self.ipa_limit()).contains(&s2sz)
    }
}

pub fn init(monitor: &dyn Monitor) -> Result<(), Error> {
    let value = monitor.features(FEATURE_REGISTER_0_INDEX)?;
    debug!("rmi::FEATURES reg0:{:X}", value);
    *FEAT_REG0.lock() = Some(FeatureReg0::new(value));
    Ok(())
}

pub fn get() -> Result<FeatureReg0, Error> {
    (*FEAT_REG0.lock()).ok_or(Error::RmiErrorOthers(InternalError::NotInitialized))
}
