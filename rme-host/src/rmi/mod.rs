pub mod error;
pub mod features;
pub mod realm;
pub mod rec;
pub mod version;

use crate::define_interface;
use crate::realm::registry;
use crate::rmi::error::Error;
use crate::rmi::rec::run::Run;

define_interface! {
    command {
         VERSION                = 0xc400_0150,
         GRANULE_DELEGATE       = 0xc400_0151,
         GRANULE_UNDELEGATE     = 0xc400_0152,
         DATA_CREATE            = 0xc400_0153,
         DATA_CREATE_UNKNOWN    = 0xc400_0154,
         DATA_DESTROY           = 0xc400_0155,
         REALM_ACTIVATE         = 0xc400_0157,
         REALM_CREATE           = 0xc400_0158,
         REALM_DESTROY          = 0xc400_0159,
         REC_CREATE             = 0xc400_015a,
         REC_DESTROY            = 0xc400_015b,
         REC_ENTER              = 0xc400_015c,
         RTT_CREATE             = 0xc400_015d,
         RTT_DESTROY            = 0xc400_015e,
         RTT_MAP_UNPROTECTED    = 0xc400_015f,
         RTT_READ_ENTRY         = 0xc400_0161,
         RTT_UNMAP_UNPROTECTED  = 0xc400_0162,
         PSCI_COMPLETE          = 0xc400_0164,
         FEATURES               = 0xc400_0165,
         RTT_FOLD               = 0xc400_0166,
         REC_AUX_COUNT          = 0xc400_0167,
         RTT_INIT_RIPAS         = 0xc400_0168,
         RTT_SET_RIPAS          = 0xc400_0169,
    }
}

pub const ABI_MAJOR_VERSION: usize = 1;
pub const ABI_MINOR_VERSION: usize = 0;

pub const HASH_ALGO_SHA256: u8 = 0;
pub const HASH_ALGO_SHA512: u8 = 1;

pub const SUCCESS: usize = 0;
pub const ERROR_INPUT: usize = 1;
pub const ERROR_REALM: usize = 2;
pub const ERROR_REC: usize = 3;
pub const ERROR_RTT: usize = 4;
pub const ERROR_IN_USE: usize = 5;
pub const INCOMPLETE: usize = 6;

pub const NO_MEASURE_CONTENT: usize = 0;
pub const MEASURE_CONTENT: usize = 1;

pub const MAX_REC_AUX_GRANULES: usize = 16;

pub const EXIT_SYNC: u8 = 0;
pub const EXIT_IRQ: u8 = 1;
pub const EXIT_FIQ: u8 = 2;
pub const EXIT_PSCI: u8 = 3;
pub const EXIT_RIPAS_CHANGE: u8 = 4;
pub const EXIT_HOST_CALL: u8 = 5;
pub const EXIT_SERROR: u8 = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RttEntryState {
    Unassigned,
    Destroyed,
    Assigned,
    Table,
    ValidNs,
}

impl RttEntryState {
    /// Entries that keep a granule or a subtree alive.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            RttEntryState::Assigned | RttEntryState::Table | RttEntryState::ValidNs
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ripas {
    Empty = 0,
    Ram = 1,
    Destroyed = 2,
}

impl From<usize> for Ripas {
    fn from(value: usize) -> Self {
        match value {
            0 => Ripas::Empty,
            1 => Ripas::Ram,
            _ => Ripas::Destroyed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RttEntry {
    pub walk_level: usize,
    pub state: RttEntryState,
    pub desc: usize,
    pub ripas: Ripas,
}

impl RttEntry {
    /// Output address held by an ASSIGNED, TABLE or VALID_NS entry.
    pub fn phys(&self) -> usize {
        self.desc & 0xFFFF_FFFF_F000 // GENMASK(47, 12)
    }
}

/// A call result paired with the `top` address the monitor reports,
/// which is valid on success and on RTT walk errors.
pub type WithTop<T> = (Result<T, Error>, usize);

/// The synchronous call surface of the Realm Management Monitor.
///
/// Each method is one round trip. Implementations own the wire encoding;
/// a raw return value is turned into `Result` with `Error::decode`.
pub trait Monitor: Send + Sync {
    /// Returns the lower and higher supported revisions.
    fn version(&self, requested: usize) -> Result<(usize, usize), Error>;
    fn features(&self, index: usize) -> Result<u64, Error>;

    fn granule_delegate(&self, addr: usize) -> Result<(), Error>;
    fn granule_undelegate(&self, addr: usize) -> Result<(), Error>;

    fn realm_create(&self, rd: usize, params: &realm::Params) -> Result<(), Error>;
    fn realm_activate(&self, rd: usize) -> Result<(), Error>;
    fn realm_destroy(&self, rd: usize) -> Result<(), Error>;

    fn rec_aux_count(&self, rd: usize) -> Result<usize, Error>;
    fn rec_create(&self, rd: usize, rec: usize, params: &rec::Params) -> Result<(), Error>;
    fn rec_destroy(&self, rec: usize) -> Result<(), Error>;
    fn rec_enter(&self, rec: usize, run: &mut Run) -> Result<(), Error>;
    fn psci_complete(&self, calling: usize, target: usize, status: usize) -> Result<(), Error>;

    fn data_create(
        &self,
        rd: usize,
        data: usize,
        ipa: usize,
        src: usize,
        flags: usize,
    ) -> Result<(), Error>;
    fn data_create_unknown(&self, rd: usize, data: usize, ipa: usize) -> Result<(), Error>;
    /// Returns the destroyed data granule.
    fn data_destroy(&self, rd: usize, ipa: usize) -> WithTop<usize>;

    fn rtt_create(&self, rd: usize, rtt: usize, ipa: usize, level: usize) -> Result<(), Error>;
    /// Returns the destroyed table granule.
    fn rtt_destroy(&self, rd: usize, ipa: usize, level: usize) -> WithTop<usize>;
    /// Returns the table granule that was folded into its parent.
    fn rtt_fold(&self, rd: usize, ipa: usize, level: usize) -> Result<usize, Error>;
    fn rtt_read_entry(&self, rd: usize, ipa: usize, level: usize) -> Result<RttEntry, Error>;
    /// Returns the top of the range whose RIPAS was set.
    fn rtt_init_ripas(&self, rd: usize, base: usize, top: usize) -> Result<usize, Error>;
    fn rtt_set_ripas(&self, rd: usize, rec: usize, base: usize, top: usize)
        -> Result<usize, Error>;
    fn rtt_map_unprotected(
        &self,
        rd: usize,
        ipa: usize,
        level: usize,
        desc: usize,
    ) -> Result<(), Error>;
    fn rtt_unmap_unprotected(&self, rd: usize, ipa: usize, level: usize) -> WithTop<()>;
}

/// Brings up realm support against `monitor`: checks the ABI revision,
/// prepares the VMID registry, and caches feature register 0.
pub fn init(monitor: &dyn Monitor) -> Result<(), Error> {
    version::check(monitor)?;
    registry::init();
    features::init(monitor)?;
    info!("Realm support enabled, {:?}", features::get()?);
    Ok(())
}
