use crate::config::VMID_BITS;
use crate::rmi::error::{Error, InternalError};

use alloc::collections::btree_set::BTreeSet;
use spinning_top::Spinlock;

const VMID_COUNT: usize = 1 << VMID_BITS;

lazy_static! {
    pub static ref VMID_SET: Spinlock<BTreeSet<usize>> = Spinlock::new(BTreeSet::new());
}

/// VMID 0 belongs to the host.
pub fn init() {
    VMID_SET.lock().insert(0);
}

pub fn reserve() -> Result<u16, Error> {
    let mut set = VMID_SET.lock();
    let vmid = (1..VMID_COUNT)
        .find(|id| !set.contains(id))
        .ok_or(Error::RmiErrorOthers(InternalError::VmidExhausted))?;
    set.insert(vmid);
    Ok(vmid as u16)
}

pub fn release(vmid: u16) {
    if !VMID_SET.lock().remove(&(vmid as usize)) {
        warn!("VMID {} was not reserved", vmid);
    }
}
