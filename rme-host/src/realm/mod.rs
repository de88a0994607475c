pub mod config;
pub mod mm;
pub mod registry;

use self::config::ConfigItem;
use self::mm::mapping;
use crate::config::{Policy, PAGE_SIZE};
use crate::granule::{AllocationContext, GranuleAllocator, Holder, HostMemory};
use crate::rmi::error::{Error, InternalError};
use crate::rmi::realm::Params;
use crate::rmi::{self, features, Monitor};

use alloc::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    None,
    New,
    Active,
    Dying,
    Dead,
}

pub struct Realm {
    state: State,
    ipa_bits: usize,
    start_level: usize,
    vmid: Option<u16>,
    rd: Option<usize>,
    pgd: Option<usize>,
    pgd_pages: usize,
    num_aux: usize,
    num_recs: usize,
    params: Option<Params>,
    policy: Policy,
    pub(crate) monitor: Arc<dyn Monitor>,
    pub(crate) granules: GranuleAllocator,
}

impl Realm {
    pub fn new(monitor: Arc<dyn Monitor>, host: Arc<dyn HostMemory>, ipa_bits: usize) -> Self {
        Self {
            state: State::None,
            ipa_bits,
            start_level: mm::start_level(ipa_bits),
            vmid: None,
            rd: None,
            pgd: None,
            pgd_pages: mm::pgd_pages(ipa_bits, mm::start_level(ipa_bits)),
            num_aux: 0,
            num_recs: 0,
            params: Some(Params::new(ipa_bits as u8)),
            policy: Policy::default(),
            granules: GranuleAllocator::new(monitor.clone(), host),
            monitor,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn at_state(&self, compared: State) -> bool {
        self.state == compared
    }

    /// Rejects the call unless the realm is in one of `allowed`.
    pub(crate) fn expect_state(&self, allowed: &[State]) -> Result<(), Error> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            debug!("realm in {:?}, expected {:?}", self.state, allowed);
            Err(Error::RmiErrorRealm(0))
        }
    }

    pub fn ipa_bits(&self) -> usize {
        self.ipa_bits
    }

    pub fn start_level(&self) -> usize {
        self.start_level
    }

    pub fn vmid(&self) -> Option<u16> {
        self.vmid
    }

    pub fn num_aux(&self) -> usize {
        self.num_aux
    }

    pub fn num_recs(&self) -> usize {
        self.num_recs
    }

    pub(crate) fn inc_recs(&mut self) -> usize {
        self.num_recs += 1;
        self.num_recs - 1
    }

    pub(crate) fn dec_recs(&mut self) {
        self.num_recs -= 1;
    }

    pub fn ipa_size(&self) -> usize {
        1 << self.ipa_bits
    }

    /// Size of the protected address range, the lower half of the IPA space.
    pub fn par_size(&self) -> usize {
        self.ipa_size() / 2
    }

    pub fn addr_in_par(&self, ipa: usize) -> bool {
        ipa < self.par_size()
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: Policy) {
        self.policy = policy;
    }

    pub fn granules(&self) -> &GranuleAllocator {
        &self.granules
    }

    pub(crate) fn rd(&self) -> Result<usize, Error> {
        self.rd.ok_or(Error::RmiErrorRealm(0))
    }

    pub fn rd_addr(&self) -> Option<usize> {
        self.rd
    }

    pub fn pgd(&self) -> Option<(usize, usize)> {
        self.pgd.map(|base| (base, self.pgd_pages))
    }

    pub fn params(&self) -> Option<&Params> {
        self.params.as_ref()
    }

    pub fn configure(&mut self, item: ConfigItem) -> Result<(), Error> {
        self.expect_state(&[State::None])?;
        let feat = features::get()?;
        let params = self.params.as_mut().ok_or(Error::RmiErrorInput)?;
        config::apply(params, item, &feat)
    }

    /// NONE -> NEW. On failure everything delegated so far is handed back
    /// and the realm stays in NONE.
    pub fn create(&mut self) -> Result<(), Error> {
        self.expect_state(&[State::None])?;
        let feat = features::get()?;
        if !feat.validate(self.ipa_bits) {
            error!("ipa_bits {} exceeds the limit {}", self.ipa_bits, feat.ipa_limit());
            return Err(Error::RmiErrorInput);
        }
        let mut params = self.params.ok_or(Error::RmiErrorInput)?;

        let vmid = registry::reserve()?;
        if let Err(e) = self.create_rd(&mut params, vmid) {
            registry::release(vmid);
            return Err(e);
        }

        self.vmid = Some(vmid);
        self.params = None;
        self.state = State::New;
        debug!("Realm vmid:{} created, {:?}", vmid, params);
        Ok(())
    }

    fn create_rd(&mut self, params: &mut Params, vmid: u16) -> Result<(), Error> {
        let ctx = AllocationContext::MayBlock;
        let pgd = self
            .granules
            .host()
            .alloc_pages(self.pgd_pages, ctx)
            .ok_or(Error::RmiErrorOthers(InternalError::OutOfMemory))?;

        let rd = match self.granules.acquire(ctx, Holder::Rd) {
            Ok(rd) => rd,
            Err(e) => {
                self.granules.host().free_pages(pgd, self.pgd_pages);
                return Err(e);
            }
        };

        for i in 0..self.pgd_pages {
            if let Err(e) = self.granules.delegate(pgd + i * PAGE_SIZE, Holder::Pgd) {
                error!("pgd page {:#X} delegation failed: {:?}", pgd + i * PAGE_SIZE, e);
                self.undo_create_rd(rd, pgd, i);
                return Err(e);
            }
        }

        params.vmid = vmid;
        params.rtt_base = pgd as u64;
        params.rtt_level_start = self.start_level as i64;
        params.rtt_num_start = self.pgd_pages as u32;

        if let Err(e) = self.monitor.realm_create(rd, params) {
            error!("{} failed: {:?}", rmi::to_str(rmi::REALM_CREATE), e);
            self.undo_create_rd(rd, pgd, self.pgd_pages);
            return Err(e);
        }

        match self.monitor.rec_aux_count(rd) {
            Ok(num_aux) if num_aux <= rmi::MAX_REC_AUX_GRANULES => self.num_aux = num_aux,
            ret => {
                error!("{} returned {:?}", rmi::to_str(rmi::REC_AUX_COUNT), ret);
                if self.monitor.realm_destroy(rd).is_err() {
                    // The descriptor and the tables stay with the monitor.
                    self.granules.leak(rd);
                    for i in 0..self.pgd_pages {
                        self.granules.leak(pgd + i * PAGE_SIZE);
                    }
                } else {
                    self.undo_create_rd(rd, pgd, self.pgd_pages);
                }
                return Err(ret.err().unwrap_or(Error::RmiErrorInput));
            }
        }

        self.rd = Some(rd);
        self.pgd = Some(pgd);
        Ok(())
    }

    fn undo_create_rd(&mut self, rd: usize, pgd: usize, delegated: usize) {
        let mut all_returned = true;
        for i in (0..delegated).rev() {
            if self.granules.undelegate(pgd + i * PAGE_SIZE).is_err() {
                all_returned = false;
            }
        }
        if all_returned {
            self.granules.host().free_pages(pgd, self.pgd_pages);
        }
        let _ = self.granules.reclaim(rd);
    }

    /// NEW -> ACTIVE. Irreversible; a failure leaves the realm in NEW.
    pub fn activate(&mut self) -> Result<(), Error> {
        self.expect_state(&[State::New])?;
        let rd = self.rd()?;
        self.monitor.realm_activate(rd)?;
        self.state = State::Active;
        debug!("Realm vmid:{:?} activated", self.vmid);
        Ok(())
    }

    /// Any state but NONE -> DYING -> DEAD.
    ///
    /// The caller must have torn down every mapping and destroyed every REC
    /// beforehand, see [`Realm::teardown`].
    pub fn destroy(&mut self) -> Result<(), Error> {
        self.params = None;
        if self.at_state(State::None) || self.at_state(State::Dead) {
            return Ok(());
        }

        self.state = State::Dying;

        if let Some(rd) = self.rd {
            self.monitor.realm_destroy(rd).map_err(|e| {
                error!("{} failed: {:?}", rmi::to_str(rmi::REALM_DESTROY), e);
                e
            })?;
            self.rd = None;
            // A descriptor that stays delegated is leaked, the rest goes on.
            let _ = self.granules.reclaim(rd);
        }

        if let Some(vmid) = self.vmid.take() {
            registry::release(vmid);
        }

        // The spare is still delegated; a failure here only leaks that page.
        let _ = self.granules.drain_spare();

        if let Some(pgd) = self.pgd.take() {
            let mut undelegated = true;
            for i in 0..self.pgd_pages {
                undelegated &= self.granules.undelegate(pgd + i * PAGE_SIZE).is_ok();
            }
            if undelegated {
                self.granules.host().free_pages(pgd, self.pgd_pages);
            } else {
                error!("pgd {:#X} stays with the monitor", pgd);
            }
        }
        self.state = State::Dead;
        debug!("Realm destroyed");
        Ok(())
    }

    /// Unmaps the whole IPA space, then destroys the realm.
    pub fn teardown(&mut self) -> Result<(), Error> {
        if matches!(self.state, State::New | State::Active) {
            self.state = State::Dying;
            let size = self.ipa_size();
            mapping::unmap_range(self, 0, size)?;
        }
        self.destroy()
    }
}
