use super::rtt::create_level;
use super::{is_aligned, map_size};
use super::mapping;
use crate::config::{PAGE_SIZE, RTT_MAX_LEVEL};
use crate::granule::AllocationContext;
use crate::realm::{Realm, State};
use crate::rec::Rec;
use crate::rmi::error::{Error, InternalError};
use crate::rmi::{self, Ripas};

/// Shallowest level whose block is aligned at `start` and fits before `end`.
pub fn find_map_level(realm: &Realm, start: usize, end: usize) -> usize {
    let mut level = RTT_MAX_LEVEL;
    while level > realm.start_level() + 1 {
        let size = map_size(level - 1);
        if !is_aligned(start, size) || start + size > end {
            break;
        }
        level -= 1;
    }
    level
}

fn check_range(realm: &Realm, start: usize, end: usize) -> Result<(), Error> {
    if start >= end
        || !is_aligned(start, PAGE_SIZE)
        || !is_aligned(end, PAGE_SIZE)
        || end > realm.par_size()
    {
        return Err(Error::RmiErrorInput);
    }
    Ok(())
}

/// Drives one RIPAS command across `[start, end)`, building the missing
/// tables on the way. Returns the address the monitor got to, with the error
/// that stopped it short of `end`.
fn walk<F>(
    realm: &mut Realm,
    ctx: AllocationContext,
    cmd: usize,
    start: usize,
    end: usize,
    step: F,
) -> (usize, Result<(), Error>)
where
    F: Fn(&Realm, usize) -> Result<usize, Error>,
{
    let mut addr = start;
    let mut created_at = None;

    while addr < end {
        let level = find_map_level(realm, addr, end);
        match step(&*realm, addr) {
            Ok(top) if top > addr => {
                addr = top;
                created_at = None;
            }
            Ok(top) => {
                error!("{} made no progress at {:#X} (top {:#X})", rmi::to_str(cmd), addr, top);
                return (addr, Err(Error::RmiErrorOthers(InternalError::Unexpected)));
            }
            Err(Error::RmiErrorRtt(l)) if l < level && created_at != Some(addr) => {
                if let Err(e) = create_level(realm, ctx, addr, l, level) {
                    error!("{} {:#X}: no table below level {}: {:?}", rmi::to_str(cmd), addr, l, e);
                    return (addr, Err(e));
                }
                created_at = Some(addr);
            }
            Err(e) => {
                error!("{} {:#X}..{:#X} failed: {:?}", rmi::to_str(cmd), addr, end, e);
                return (addr, Err(e));
            }
        }
    }
    (addr, Ok(()))
}

/// Marks `[start, end)` as RAM before the realm runs. No data is assigned.
pub fn init_ipa_state(realm: &mut Realm, start: usize, end: usize) -> Result<(), Error> {
    realm.expect_state(&[State::New])?;
    check_range(realm, start, end)?;
    let rd = realm.rd()?;

    let (_, ret) = walk(
        realm,
        AllocationContext::MayBlock,
        rmi::RTT_INIT_RIPAS,
        start,
        end,
        |realm, addr| realm.monitor.rtt_init_ripas(rd, addr, end),
    );
    ret?;
    debug!("RIPAS RAM {:#X}..{:#X}", start, end);
    Ok(())
}

/// Applies the RIPAS change `rec` asked for and returns how far it got.
///
/// Runs on the exit path under the vCPU lock, so missing tables come from
/// the spare or the atomic pool. Whatever turned EMPTY is unmapped, also
/// when a later step fails.
pub fn set_ipa_state(
    realm: &mut Realm,
    rec: &Rec,
    start: usize,
    end: usize,
    ripas: Ripas,
) -> Result<usize, Error> {
    realm.expect_state(&[State::Active])?;
    check_range(realm, start, end)?;
    let rd = realm.rd()?;
    let rec = rec.addr();

    let (top, ret) = walk(
        realm,
        AllocationContext::MustNotBlock,
        rmi::RTT_SET_RIPAS,
        start,
        end,
        |realm, addr| realm.monitor.rtt_set_ripas(rd, rec, addr, end),
    );

    if ripas == Ripas::Empty && top > start {
        mapping::unmap_range(realm, start, top - start)?;
    }
    ret.map(|_| top)
}
