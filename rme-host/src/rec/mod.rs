pub mod exit;

use self::exit::ExitAction;
use crate::granule::{AllocationContext, Holder};
use crate::realm::{Realm, State};
use crate::rmi::error::Error;
use crate::rmi::rec::params::NR_GPRS;
use crate::rmi::rec::{Params, RmiRecFlags, Run};
use crate::rmi::{self, MAX_REC_AUX_GRANULES};

use alloc::vec::Vec;

/// Initial register state of one vCPU.
#[derive(Clone, Copy, Debug, Default)]
pub struct VcpuInit {
    pub index: usize,
    pub mpidr: u64,
    pub pc: u64,
    pub gprs: [u64; NR_GPRS],
}

/// A realm execution context: one vCPU as the monitor sees it.
#[derive(Debug)]
pub struct Rec {
    index: usize,
    /// The REC granule, then the run page, then the auxiliary granules.
    pages: Vec<usize>,
    run: Run,
}

impl Rec {
    pub fn create(realm: &mut Realm, init: VcpuInit) -> Result<Self, Error> {
        realm.expect_state(&[State::New])?;
        let rd = realm.rd()?;
        let num_aux = realm.num_aux();
        if num_aux > MAX_REC_AUX_GRANULES {
            return Err(Error::RmiErrorInput);
        }

        let mut pages = Vec::with_capacity(2 + num_aux);
        let holders = [Holder::Rec, Holder::Rec]
            .into_iter()
            .chain(core::iter::repeat(Holder::RecAux).take(num_aux));
        for holder in holders {
            match realm.granules.acquire(AllocationContext::MayBlock, holder) {
                Ok(addr) => pages.push(addr),
                Err(e) => {
                    Self::reclaim_pages(realm, &pages);
                    return Err(e);
                }
            }
        }

        let mut flags = RmiRecFlags::new(0);
        if init.index == 0 {
            flags.set_masked_value(RmiRecFlags::Runnable, 1);
        }
        let mut params = Params {
            flags: flags.get(),
            mpidr: init.mpidr,
            pc: init.pc,
            gprs: init.gprs,
            num_aux: num_aux as u64,
            ..Default::default()
        };
        for (slot, aux) in params.aux.iter_mut().zip(&pages[2..]) {
            *slot = *aux as u64;
        }

        if let Err(e) = realm.monitor.rec_create(rd, pages[0], &params) {
            error!("{} vcpu:{} failed: {:?}", rmi::to_str(rmi::REC_CREATE), init.index, e);
            Self::reclaim_pages(realm, &pages);
            return Err(e);
        }
        realm.inc_recs();
        debug!("REC {:#X} vcpu:{} runnable:{}", pages[0], init.index, params.runnable());

        Ok(Self {
            index: init.index,
            pages,
            run: Run::default(),
        })
    }

    fn reclaim_pages(realm: &mut Realm, pages: &[usize]) {
        for addr in pages.iter().rev() {
            let _ = realm.granules.reclaim(*addr);
        }
    }

    /// Destroys the REC. If the monitor refuses, its pages are leaked: their
    /// content may still be live on the monitor side.
    pub fn destroy(self, realm: &mut Realm) -> Result<(), Error> {
        if let Err(e) = realm.monitor.rec_destroy(self.addr()) {
            error!("{} {:#X} failed: {:?}", rmi::to_str(rmi::REC_DESTROY), self.addr(), e);
            for addr in &self.pages {
                realm.granules.leak(*addr);
            }
            return Err(e);
        }
        for addr in self.pages.iter().rev() {
            realm.granules.release(*addr);
        }
        realm.dec_recs();
        Ok(())
    }

    pub fn addr(&self) -> usize {
        self.pages[0]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn aux(&self) -> &[usize] {
        &self.pages[2..]
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn run_mut(&mut self) -> &mut Run {
        &mut self.run
    }

    /// Runs the vCPU until its next exit.
    pub fn enter(&mut self, realm: &Realm) -> Result<(), Error> {
        realm.expect_state(&[State::Active])?;
        realm.monitor.rec_enter(self.addr(), &mut self.run)
    }

    /// Enters the vCPU and decodes why it came back.
    pub fn run_once(&mut self, realm: &mut Realm) -> Result<ExitAction, Error> {
        realm.expect_state(&[State::Active])?;
        let ret = self.enter(realm);
        exit::handle_exit(realm, self, ret)
    }

    /// Completes a PSCI request of this vCPU that names `target`.
    pub fn psci_complete(&self, realm: &Realm, target: &Rec, status: usize) -> Result<(), Error> {
        realm
            .monitor
            .psci_complete(self.addr(), target.addr(), status)
    }
}
