use super::{align_down, is_aligned, map_size};
use crate::config::{PAGE_SIZE, RTT_MAX_LEVEL};
use crate::granule::{AllocationContext, Holder};
use crate::realm::Realm;
use crate::rmi::error::{Error, InternalError};
use crate::rmi::{self, RttEntry};

use core::cmp::{max, min};

// Walk retries at one address: a block split, then a live-table descent per level.
const MAX_ATTEMPTS: usize = RTT_MAX_LEVEL + 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Half {
    Protected,
    Unprotected,
}

fn unexpected(cmd: usize, ipa: usize, level: usize, e: Error) -> Error {
    error!(
        "{} ipa:{:#X} level:{} unexpected {:?}",
        rmi::to_str(cmd),
        ipa,
        level,
        e
    );
    Error::RmiErrorOthers(InternalError::Unexpected)
}

/// Installs tables for every level in `(from_level, to_level]` on the walk to `addr`.
///
/// Levels created before a failure stay in place; the caller retries its
/// whole operation and finds them.
pub fn create_level(
    realm: &mut Realm,
    ctx: AllocationContext,
    addr: usize,
    from_level: usize,
    to_level: usize,
) -> Result<(), Error> {
    let rd = realm.rd()?;
    let monitor = realm.monitor.clone();

    for level in (from_level + 1)..=to_level {
        let rtt = realm.granules.acquire(ctx, Holder::Rtt)?;
        let ipa = align_down(addr, map_size(level - 1));

        match monitor.rtt_create(rd, rtt, ipa, level) {
            Ok(()) => trace!("RTT_CREATE ipa:{:#X} level:{} rtt:{:#X}", ipa, level, rtt),
            Err(Error::RmiErrorRtt(l)) if l == level => {
                // Someone else installed this table first.
                realm.granules.release(rtt);
            }
            Err(e) => {
                error!("RTT_CREATE ipa:{:#X} level:{} failed: {:?}", ipa, level, e);
                realm.granules.release(rtt);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Tears down everything mapped in the protected range `[start, end)`,
/// destroying the tables of `level` and below that the range fully covers.
pub fn destroy_range(realm: &mut Realm, level: usize, start: usize, end: usize) -> Result<(), Error> {
    tear_down(realm, Half::Protected, level, start, end)
}

/// Same walk as [`destroy_range`] over the unprotected range. Host pages
/// mapped there are never delegated, so they are only unmapped.
pub fn unmap_unprotected(
    realm: &mut Realm,
    level: usize,
    start: usize,
    end: usize,
) -> Result<(), Error> {
    tear_down(realm, Half::Unprotected, level, start, end)
}

fn tear_down(
    realm: &mut Realm,
    half: Half,
    level: usize,
    start: usize,
    end: usize,
) -> Result<(), Error> {
    if level > RTT_MAX_LEVEL {
        return tear_down_leaves(realm, half, start, end);
    }

    let rd = realm.rd()?;
    let monitor = realm.monitor.clone();
    let size = map_size(level - 1);
    let mut addr = start;
    let mut attempts = 0;

    while addr < end {
        let next = align_down(addr, size) + size;
        if !is_aligned(addr, size) || next > end {
            tear_down(realm, half, level + 1, addr, min(next, end))?;
            addr = next;
            attempts = 0;
            continue;
        }

        let (ret, top) = monitor.rtt_destroy(rd, addr, level);
        match ret {
            Ok(rtt) => {
                trace!("RTT_DESTROY ipa:{:#X} level:{} rtt:{:#X}", addr, level, rtt);
                realm.granules.release(rtt);
                addr = next;
                attempts = 0;
                continue;
            }
            // Nothing live below: skip the unassigned region.
            Err(Error::RmiErrorRtt(_)) if top > addr => {
                addr = top;
                attempts = 0;
                continue;
            }
            Err(Error::RmiErrorRtt(l)) if l <= level && attempts < MAX_ATTEMPTS => {
                if l == level {
                    // The table is still live, empty it first.
                    tear_down(realm, half, level + 1, addr, next)?;
                } else {
                    clear_block(realm, half, l, addr, next)?;
                }
            }
            Err(e) => return Err(unexpected(rmi::RTT_DESTROY, addr, level, e)),
        }
        attempts += 1;
    }
    Ok(())
}

/// Handles a live leaf entry at `level` that covers `[addr, end)`.
/// A fully covered unprotected block is unmapped in place; anything else
/// is split one level down, which may consume the spare granule.
fn clear_block(
    realm: &mut Realm,
    half: Half,
    level: usize,
    addr: usize,
    end: usize,
) -> Result<(), Error> {
    let block = align_down(addr, map_size(level));
    let covered = block == addr && block + map_size(level) <= end;

    if half == Half::Unprotected && covered {
        let rd = realm.rd()?;
        let (ret, _) = realm.monitor.rtt_unmap_unprotected(rd, block, level);
        return ret.map_err(|e| unexpected(rmi::RTT_UNMAP_UNPROTECTED, block, level, e));
    }

    if level >= RTT_MAX_LEVEL {
        return Err(unexpected(
            rmi::RTT_CREATE,
            block,
            level + 1,
            Error::RmiErrorRtt(level),
        ));
    }
    trace!("splitting block ipa:{:#X} level:{}", block, level);
    create_level(realm, AllocationContext::MustNotBlock, block, level, level + 1)
}

fn tear_down_leaves(realm: &mut Realm, half: Half, start: usize, end: usize) -> Result<(), Error> {
    let rd = realm.rd()?;
    let monitor = realm.monitor.clone();
    let mut addr = start;
    let mut attempts = 0;

    while addr < end {
        let (ret, top) = match half {
            Half::Protected => monitor.data_destroy(rd, addr),
            Half::Unprotected => {
                let (ret, top) = monitor.rtt_unmap_unprotected(rd, addr, RTT_MAX_LEVEL);
                (ret.map(|_| 0), top)
            }
        };

        match ret {
            Ok(data) => {
                if half == Half::Protected && realm.granules.reclaim(data).is_err() {
                    error!("data granule {:#X} at ipa:{:#X} is lost", data, addr);
                }
                addr = max(top, addr + PAGE_SIZE);
                attempts = 0;
            }
            Err(Error::RmiErrorRtt(_)) if top > addr => {
                addr = top;
                attempts = 0;
            }
            Err(Error::RmiErrorRtt(l)) if l < RTT_MAX_LEVEL && attempts < MAX_ATTEMPTS => {
                clear_block(realm, half, l, addr, end)?;
                attempts += 1;
            }
            Err(e) => {
                let cmd = match half {
                    Half::Protected => rmi::DATA_DESTROY,
                    Half::Unprotected => rmi::RTT_UNMAP_UNPROTECTED,
                };
                return Err(unexpected(cmd, addr, RTT_MAX_LEVEL, e));
            }
        }
    }
    Ok(())
}

/// Collapses homogeneous tables of `level` inside `[start, end)` into their
/// parent entries. Returns how many candidate entries could not be folded.
pub fn fold_range(realm: &mut Realm, level: usize, start: usize, end: usize) -> Result<usize, Error> {
    fold(realm, level, start, end).map(|(_, not_folded)| not_folded)
}

fn fold(realm: &mut Realm, level: usize, start: usize, end: usize) -> Result<(usize, usize), Error> {
    let rd = realm.rd()?;
    let monitor = realm.monitor.clone();
    let size = map_size(level - 1);
    let (mut folded, mut not_folded) = (0, 0);
    let mut addr = align_down(start, size);

    while addr < end {
        let next = addr + size;
        let mut ret = monitor.rtt_fold(rd, addr, level);

        if let Err(Error::RmiErrorRtt(l)) = ret {
            // Children of the table are tables themselves: fold those first,
            // and retry only if that changed anything.
            if l == level && level < RTT_MAX_LEVEL {
                let (inner, _) = fold(realm, level + 1, max(start, addr), min(end, next))?;
                folded += inner;
                if inner > 0 {
                    ret = monitor.rtt_fold(rd, addr, level);
                }
            }
        }

        match ret {
            Ok(rtt) => {
                trace!("RTT_FOLD ipa:{:#X} level:{} rtt:{:#X}", addr, level, rtt);
                realm.granules.release(rtt);
                folded += 1;
            }
            Err(Error::RmiErrorRtt(_)) => not_folded += 1,
            Err(e) => return Err(unexpected(rmi::RTT_FOLD, addr, level, e)),
        }
        addr = next;
    }
    Ok((folded, not_folded))
}

pub fn read_entry(realm: &Realm, addr: usize, level: usize) -> Result<RttEntry, Error> {
    let rd = realm.rd()?;
    realm.monitor.rtt_read_entry(rd, align_down(addr, map_size(level)), level)
}
