use crate::rmi::error::Error;
use crate::rmi::features::FeatureReg0;
use crate::rmi::realm::params::RPV_SIZE;
use crate::rmi::realm::{Params, RmiRealmFlags};
use crate::rmi::{HASH_ALGO_SHA256, HASH_ALGO_SHA512};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgo {
    Sha256,
    Sha512,
}

/// One realm configuration request, accepted only before the realm exists.
#[derive(Clone, Copy, Debug)]
pub enum ConfigItem {
    /// Realm personalization value
    Rpv([u8; RPV_SIZE]),
    HashAlgo(HashAlgo),
    Sve { vq: usize },
    Debug { num_bps: usize, num_wps: usize },
    Pmu { num_ctrs: usize },
}

pub fn apply(params: &mut Params, item: ConfigItem, feat: &FeatureReg0) -> Result<(), Error> {
    match item {
        ConfigItem::Rpv(rpv) => params.rpv.copy_from_slice(&rpv),
        ConfigItem::HashAlgo(HashAlgo::Sha256) => {
            if !feat.supports(FeatureReg0::HASH_SHA_256) {
                return Err(Error::RmiErrorInput);
            }
            params.hash_algo = HASH_ALGO_SHA256;
        }
        ConfigItem::HashAlgo(HashAlgo::Sha512) => {
            if !feat.supports(FeatureReg0::HASH_SHA_512) {
                return Err(Error::RmiErrorInput);
            }
            params.hash_algo = HASH_ALGO_SHA512;
        }
        ConfigItem::Sve { vq } => {
            if !feat.supports(FeatureReg0::SVE_EN) || vq > feat.max_sve_vl() {
                return Err(Error::RmiErrorInput);
            }
            params.sve_vl = vq as u8;
            params.set_flag(RmiRealmFlags::Sve);
        }
        ConfigItem::Debug { num_bps, num_wps } => {
            if num_bps > feat.num_bps() || num_wps > feat.num_wps() {
                return Err(Error::RmiErrorInput);
            }
            params.num_bps = num_bps as u8;
            params.num_wps = num_wps as u8;
        }
        ConfigItem::Pmu { num_ctrs } => {
            if !feat.supports(FeatureReg0::PMU_EN) || num_ctrs > feat.pmu_num_ctrs() {
                return Err(Error::RmiErrorInput);
            }
            params.pmu_num_ctrs = num_ctrs as u8;
            params.set_flag(RmiRealmFlags::Pmu);
        }
    }
    trace!("{:?}", params);
    Ok(())
}
