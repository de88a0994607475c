use super::Rec;
use crate::realm::mm::ripas;
use crate::realm::Realm;
use crate::rmi::error::Error;
use crate::rmi::rec::run::{Exit, NR_GPRS};
use crate::rmi::{
    self, Ripas, EXIT_FIQ, EXIT_HOST_CALL, EXIT_IRQ, EXIT_PSCI, EXIT_RIPAS_CHANGE, EXIT_SERROR,
    EXIT_SYNC,
};

/// What the host has to do after a REC exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitAction {
    /// Nothing to do, enter again.
    Resume,
    /// The realm called SYSTEM_OFF; stop entering it.
    SystemOff,
    Sync { esr: u64, far: u64, hpfar: u64 },
    Psci { gprs: [u64; NR_GPRS] },
    HostCall { imm: u16, gprs: [u64; NR_GPRS] },
    SError { esr: u64 },
    Unsupported(u8),
}

pub fn handle_exit(
    realm: &mut Realm,
    rec: &mut Rec,
    ret: Result<(), Error>,
) -> Result<ExitAction, Error> {
    match ret {
        Ok(()) => {}
        Err(Error::RmiErrorRealm(1)) => return Ok(ExitAction::SystemOff),
        Err(e) => {
            error!("{} {:#X} failed: {:?}", rmi::to_str(rmi::REC_ENTER), rec.addr(), e);
            return Err(e);
        }
    }

    let exit = rec.run().exit;
    // emulation requests only hold for one entry
    rec.run_mut().entry.flags = 0;

    let action = match exit.exit_reason {
        EXIT_SYNC => ExitAction::Sync {
            esr: exit.esr,
            far: exit.far,
            hpfar: exit.hpfar,
        },
        EXIT_IRQ | EXIT_FIQ => ExitAction::Resume,
        EXIT_PSCI => ExitAction::Psci { gprs: exit.gprs },
        EXIT_RIPAS_CHANGE => {
            handle_ripas_change(realm, rec, &exit);
            ExitAction::Resume
        }
        EXIT_HOST_CALL => ExitAction::HostCall {
            imm: exit.imm,
            gprs: exit.gprs,
        },
        EXIT_SERROR => ExitAction::SError { esr: exit.esr },
        reason => {
            warn!("vcpu:{} unsupported exit reason {}", rec.index(), reason);
            ExitAction::Unsupported(reason)
        }
    };
    trace!("vcpu:{} exit {:?}", rec.index(), action);
    Ok(action)
}

fn handle_ripas_change(realm: &mut Realm, rec: &Rec, exit: &Exit) {
    let base = exit.ripas_base as usize;
    let top = exit.ripas_top as usize;
    let ripas = Ripas::from((exit.ripas_value & 1) as usize);

    if top <= base || !realm.addr_in_par(base) || !realm.addr_in_par(top - 1) {
        warn!("RIPAS change {:#X}..{:#X} outside the protected range", base, top);
        return;
    }
    if let Err(e) = ripas::set_ipa_state(realm, rec, base, top, ripas) {
        warn!(
            "RIPAS change {:#X}..{:#X} to {:?} failed: {:?}",
            base, top, ripas, e
        );
    }
}
