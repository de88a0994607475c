use super::rtt::{self, create_level};
use super::{is_aligned, stage2_tte};
use crate::config::{LARGE_PAGE_SIZE, PAGE_SIZE, RTT_BLOCK_LEVEL, RTT_MAX_LEVEL};
use crate::granule::{AllocationContext, Holder, Ownership};
use crate::realm::{Realm, State};
use crate::rmi::error::{Error, InternalError};
use crate::rmi::{self, RttEntryState, MEASURE_CONTENT, NO_MEASURE_CONTENT};

use alloc::vec::Vec;
use core::cmp::{max, min};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapSize {
    Page,
    Block,
}

impl MapSize {
    pub fn bytes(self) -> usize {
        match self {
            MapSize::Page => PAGE_SIZE,
            MapSize::Block => LARGE_PAGE_SIZE,
        }
    }

    pub fn pages(self) -> usize {
        self.bytes() / PAGE_SIZE
    }

    fn level(self) -> usize {
        match self {
            MapSize::Page => RTT_MAX_LEVEL,
            MapSize::Block => RTT_BLOCK_LEVEL,
        }
    }
}

/// Host memory behind a protected IPA, as seen by the VMM's memory slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backing {
    pub pa: usize,
    /// `pa` starts a physically contiguous, 2 MiB aligned block.
    pub block: bool,
}

pub trait MemorySlots {
    fn backing(&self, ipa: usize) -> Option<Backing>;
    /// The source pages have been copied and are no longer needed.
    fn release(&self, pa: usize, size: usize);
}

fn check_target(realm: &Realm, pa: usize, ipa: usize, size: MapSize, protected: bool) -> Result<(), Error> {
    let bytes = size.bytes();
    if !is_aligned(pa, bytes) || !is_aligned(ipa, bytes) {
        return Err(Error::RmiErrorInput);
    }
    let end = ipa.checked_add(bytes).ok_or(Error::RmiErrorInput)?;
    let inside = if protected {
        end <= realm.par_size()
    } else {
        ipa >= realm.par_size() && end <= realm.ipa_size()
    };
    if !inside {
        return Err(Error::RmiErrorInput);
    }
    Ok(())
}

/// Maps a copy of `src` at the protected `ipa`, measured or not.
///
/// The content lands in freshly allocated pages, so `src` stays with the
/// host whatever the outcome.
pub fn map_protected(
    realm: &mut Realm,
    ctx: AllocationContext,
    src: usize,
    ipa: usize,
    size: MapSize,
    measure: bool,
) -> Result<(), Error> {
    realm.expect_state(&[State::New, State::Active])?;
    check_target(realm, src, ipa, size, true)?;

    let pages = size.pages();
    let data = realm
        .granules
        .host()
        .alloc_pages(pages, ctx)
        .ok_or(Error::RmiErrorOthers(InternalError::OutOfMemory))?;
    for i in 0..pages {
        realm
            .granules
            .host()
            .copy_page(data + i * PAGE_SIZE, src + i * PAGE_SIZE);
    }

    let flags = if measure {
        MEASURE_CONTENT
    } else {
        NO_MEASURE_CONTENT
    };
    let ret = install(realm, ctx, data, ipa, size, Some((src, flags)));
    // Pages that did not end up in the realm go back to the host.
    for i in 0..pages {
        let page = data + i * PAGE_SIZE;
        if realm.granules.ownership(page) == Ownership::Free {
            realm.granules.host().free_pages(page, 1);
        }
    }
    ret
}

/// Maps `page` at the protected `ipa` with unknown content, the path taken
/// on a realm fault. On success the page belongs to the realm.
pub fn map_protected_unknown(
    realm: &mut Realm,
    ctx: AllocationContext,
    page: usize,
    ipa: usize,
    size: MapSize,
) -> Result<(), Error> {
    realm.expect_state(&[State::New, State::Active])?;
    check_target(realm, page, ipa, size, true)?;
    install(realm, ctx, page, ipa, size, None)
}

fn install(
    realm: &mut Realm,
    ctx: AllocationContext,
    data: usize,
    ipa: usize,
    size: MapSize,
    content: Option<(usize, usize)>,
) -> Result<(), Error> {
    let mut installed = Vec::new();
    let mut ret = Ok(());

    for i in 0..size.pages() {
        let offset = i * PAGE_SIZE;
        let content = content.map(|(src, flags)| (src + offset, flags));
        match install_page(realm, ctx, data + offset, ipa + offset, content) {
            Ok(true) => installed.push(ipa + offset),
            Ok(false) => {}
            Err(e) => {
                ret = Err(e);
                break;
            }
        }
    }

    if ret.is_ok() && size == MapSize::Block {
        ret = fold_block(realm, ipa);
    }

    if let Err(e) = ret {
        warn!("mapping {:#X} failed: {:?}, {} pages to unwind", ipa, e, installed.len());
        for addr in installed.iter().rev() {
            unwind_page(realm, *addr);
        }
        return Err(e);
    }
    Ok(())
}

fn assigned_page(realm: &Realm, ipa: usize) -> Result<Option<usize>, Error> {
    let entry = rtt::read_entry(realm, ipa, RTT_MAX_LEVEL)?;
    if entry.walk_level == RTT_MAX_LEVEL && entry.state == RttEntryState::Assigned {
        return Ok(Some(entry.phys()));
    }
    Ok(None)
}

/// Returns whether this call installed the page. `false` means a racing
/// caller mapped `ipa` first: with the same page, or with a copy of the
/// same content, in which case `page` is undelegated again.
fn install_page(
    realm: &mut Realm,
    ctx: AllocationContext,
    page: usize,
    ipa: usize,
    content: Option<(usize, usize)>,
) -> Result<bool, Error> {
    if let Err(e) = realm.granules.delegate(page, Holder::Data) {
        if assigned_page(realm, ipa)? == Some(page) {
            debug!("page {:#X} already mapped at {:#X}", page, ipa);
            return Ok(false);
        }
        return Err(e);
    }

    let rd = realm.rd()?;
    let monitor = realm.monitor.clone();
    let create = || match content {
        Some((src, flags)) => monitor.data_create(rd, page, ipa, src, flags),
        None => monitor.data_create_unknown(rd, page, ipa),
    };

    let mut ret = create();
    if let Err(Error::RmiErrorRtt(level)) = ret {
        if level < RTT_MAX_LEVEL {
            ret = create_level(realm, ctx, ipa, level, RTT_MAX_LEVEL).and_then(|_| create());
        }
    }

    if let Err(e) = ret {
        // Never entered the tree, hand it back to whoever owns it.
        let _ = realm.granules.undelegate(page);
        if content.is_some()
            && e == Error::RmiErrorRtt(RTT_MAX_LEVEL)
            && assigned_page(realm, ipa)?.is_some()
        {
            debug!("{:#X} already mapped, dropping copy {:#X}", ipa, page);
            return Ok(false);
        }
        error!("{:#X} -> {:#X} not mapped: {:?}", ipa, page, e);
        return Err(e);
    }
    Ok(true)
}

fn unwind_page(realm: &mut Realm, ipa: usize) {
    let Ok(rd) = realm.rd() else {
        return;
    };
    let (ret, _) = realm.monitor.data_destroy(rd, ipa);
    match ret {
        Ok(page) => {
            let _ = realm.granules.undelegate(page);
        }
        Err(e) => error!("{} {:#X} failed: {:?}", rmi::to_str(rmi::DATA_DESTROY), ipa, e),
    }
}

fn fold_block(realm: &mut Realm, ipa: usize) -> Result<(), Error> {
    let entry = rtt::read_entry(realm, ipa, RTT_BLOCK_LEVEL)?;
    if entry.walk_level != RTT_BLOCK_LEVEL || entry.state != RttEntryState::Table {
        error!("no table under block {:#X}: {:?}", ipa, entry);
        return Err(Error::RmiErrorOthers(InternalError::Unexpected));
    }
    let rd = realm.rd()?;
    let rtt = realm.monitor.rtt_fold(rd, ipa, RTT_MAX_LEVEL)?;
    realm.granules.release(rtt);
    Ok(())
}

/// Shares the host page(s) at `pa` with the realm at the unprotected `ipa`.
pub fn map_unprotected(
    realm: &mut Realm,
    ctx: AllocationContext,
    pa: usize,
    ipa: usize,
    size: MapSize,
) -> Result<(), Error> {
    realm.expect_state(&[State::New, State::Active])?;
    check_target(realm, pa, ipa, size, false)?;

    let rd = realm.rd()?;
    let monitor = realm.monitor.clone();
    let level = size.level();
    let desc = stage2_tte::unprotected_desc(pa);

    let mut ret = monitor.rtt_map_unprotected(rd, ipa, level, desc);
    if let Err(Error::RmiErrorRtt(l)) = ret {
        if l < level {
            ret = create_level(realm, ctx, ipa, l, level)
                .and_then(|_| monitor.rtt_map_unprotected(rd, ipa, level, desc));
        }
    }
    ret.map_err(|e| {
        error!("{} {:#X} failed: {:?}", rmi::to_str(rmi::RTT_MAP_UNPROTECTED), ipa, e);
        e
    })
}

/// Removes every mapping in `[addr, addr + size)`, protected or not.
pub fn unmap_range(realm: &mut Realm, addr: usize, size: usize) -> Result<(), Error> {
    realm.expect_state(&[State::New, State::Active, State::Dying])?;
    if !is_aligned(addr, PAGE_SIZE) || !is_aligned(size, PAGE_SIZE) {
        return Err(Error::RmiErrorInput);
    }
    let end = addr
        .checked_add(size)
        .filter(|end| *end <= realm.ipa_size())
        .ok_or(Error::RmiErrorInput)?;

    if !realm.granules.ensure_spare(AllocationContext::MustNotBlock) {
        warn!("no spare granule for unmapping {:#X}..{:#X}", addr, end);
    }

    let level = realm.start_level() + 1;
    let par = realm.par_size();
    let fold = realm.policy().fold_after_unmap;

    if addr < par {
        let top = min(end, par);
        rtt::destroy_range(realm, level, addr, top)?;
        if fold {
            rtt::fold_range(realm, level, addr, top)?;
        }
    }
    if end > par {
        let base = max(addr, par);
        rtt::unmap_unprotected(realm, level, base, end)?;
        if fold {
            rtt::fold_range(realm, level, base, end)?;
        }
    }
    Ok(())
}

/// Copies the host memory backing `[base, end)` into the realm. Stops at the
/// first failure; what is already mapped stays mapped.
pub fn populate_protected_region(
    realm: &mut Realm,
    slots: &dyn MemorySlots,
    base: usize,
    end: usize,
    measure: bool,
) -> Result<(), Error> {
    realm.expect_state(&[State::New])?;
    if base >= end || !is_aligned(base, PAGE_SIZE) || !is_aligned(end, PAGE_SIZE) {
        return Err(Error::RmiErrorInput);
    }

    let mut ipa = base;
    while ipa < end {
        let backing = slots.backing(ipa).ok_or_else(|| {
            error!("no memory behind ipa {:#X}", ipa);
            Error::RmiErrorInput
        })?;
        let size = if backing.block
            && is_aligned(ipa, LARGE_PAGE_SIZE)
            && is_aligned(backing.pa, LARGE_PAGE_SIZE)
            && ipa + LARGE_PAGE_SIZE <= end
        {
            MapSize::Block
        } else {
            MapSize::Page
        };

        let ret = map_protected(realm, AllocationContext::MayBlock, backing.pa, ipa, size, measure);
        slots.release(backing.pa, size.bytes());
        ret?;
        ipa += size.bytes();
    }
    debug!("populated {:#X}..{:#X}", base, end);
    Ok(())
}
