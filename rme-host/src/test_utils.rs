use crate::config::{PAGE_SIZE, RTT_BLOCK_LEVEL, RTT_MAX_LEVEL};
use crate::granule::{AllocationContext, HostMemory};
use crate::realm::mm::mapping::{Backing, MemorySlots};
use crate::realm::mm::{self, align_down, align_up, is_aligned, map_size};
use crate::realm::Realm;
use crate::rmi::error::Error;
use crate::rmi::features::FeatureReg0;
use crate::rmi::rec::run::{Exit, Run};
use crate::rmi::version::encode_version;
use crate::rmi::*;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::mutex::Mutex;

pub const MOCK_S2SZ: usize = 48;
pub const MOCK_AUX_COUNT: usize = 2;

const ENTRIES: usize = 512;
const HOST_BASE: usize = 0x8000_0000;

pub fn extract_bits(value: usize, start: u32, end: u32) -> usize {
    let num_bits = end - start + 1;
    let mask = if num_bits == usize::BITS {
        usize::MAX
    } else {
        (1 << num_bits) - 1
    };
    (value >> start) & mask
}

/// One monitor call as the mock saw it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Call {
    pub cmd: usize,
    pub args: [usize; 4],
    pub ok: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GranuleState {
    Delegated,
    Rd,
    Rec,
    Rtt,
    Data,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    state: RttEntryState,
    desc: usize,
    ripas: Ripas,
}

impl Slot {
    const fn unassigned(ripas: Ripas) -> Self {
        Self {
            state: RttEntryState::Unassigned,
            desc: 0,
            ripas,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RealmState {
    New,
    Active,
}

/// Stage 2 tables of one realm, one slot per (level, entry base).
/// Missing root entries read as unassigned and empty.
struct RealmModel {
    state: RealmState,
    ipa_bits: usize,
    start_level: usize,
    pgd: (usize, usize),
    recs: usize,
    slots: BTreeMap<(usize, usize), Slot>,
}

impl RealmModel {
    fn par_size(&self) -> usize {
        1 << (self.ipa_bits - 1)
    }

    fn get(&self, level: usize, ipa: usize) -> Slot {
        let key = (level, align_down(ipa, map_size(level)));
        self.slots
            .get(&key)
            .copied()
            .unwrap_or(Slot::unassigned(Ripas::Empty))
    }

    fn set(&mut self, level: usize, ipa: usize, slot: Slot) {
        self.slots
            .insert((level, align_down(ipa, map_size(level))), slot);
    }

    fn walk(&self, ipa: usize, target: usize) -> (usize, Slot) {
        let mut level = self.start_level;
        loop {
            let slot = self.get(level, ipa);
            if level >= target || slot.state != RttEntryState::Table {
                return (level, slot);
            }
            level += 1;
        }
    }

    fn table_end(&self, level: usize, ipa: usize) -> usize {
        if level == self.start_level {
            1 << self.ipa_bits
        } else {
            align_down(ipa, map_size(level - 1)) + map_size(level - 1)
        }
    }

    /// Base of the next live entry after the one holding `ipa`, or the end
    /// of its table.
    fn next_live(&self, level: usize, ipa: usize) -> usize {
        let end = self.table_end(level, ipa);
        let from = align_down(ipa, map_size(level)) + map_size(level);
        self.slots
            .range((level, from)..(level, end))
            .find(|(_, slot)| slot.state.is_live())
            .map_or(end, |((_, addr), _)| *addr)
    }

    fn children(&self, level: usize, base: usize) -> impl Iterator<Item = Slot> + '_ {
        (0..ENTRIES).map(move |i| self.get(level, base + i * map_size(level)))
    }

    fn remove_children(&mut self, level: usize, base: usize) {
        for i in 0..ENTRIES {
            self.slots.remove(&(level, base + i * map_size(level)));
        }
    }

    /// Sets `ripas` on consecutive entries of the walk level from `base`.
    fn apply_ripas(&mut self, base: usize, top: usize, ripas: Ripas, assigned: bool) -> Result<usize, Error> {
        let (level, _) = self.walk(base, RTT_MAX_LEVEL);
        let size = map_size(level);
        if !is_aligned(base, size) || base + size > top {
            return Err(Error::RmiErrorRtt(level));
        }

        let end = self.table_end(level, base);
        let mut addr = base;
        while addr < end && addr + size <= top {
            let slot = self.get(level, addr);
            let allowed = match slot.state {
                RttEntryState::Unassigned => true,
                RttEntryState::Assigned => assigned,
                _ => false,
            };
            if !allowed {
                break;
            }
            self.set(level, addr, Slot { ripas, ..slot });
            addr += size;
        }

        if addr == base {
            return Err(Error::RmiErrorRtt(level));
        }
        Ok(addr)
    }
}

struct RecModel {
    rd: usize,
    aux: Vec<usize>,
    runnable: bool,
    ripas: Option<(usize, usize, Ripas)>,
}

#[derive(Default)]
struct Model {
    version: usize,
    granules: BTreeMap<usize, GranuleState>,
    realms: BTreeMap<usize, RealmModel>,
    recs: BTreeMap<usize, RecModel>,
    exits: VecDeque<Exit>,
    faults: Vec<(usize, usize, Error)>,
    log: Vec<Call>,
}

impl Model {
    fn expect_granule(&self, addr: usize, state: GranuleState) -> Result<(), Error> {
        match self.granules.get(&addr) {
            Some(s) if *s == state => Ok(()),
            _ => Err(Error::RmiErrorInput),
        }
    }

    fn realm(&mut self, rd: usize) -> Result<&mut RealmModel, Error> {
        self.realms.get_mut(&rd).ok_or(Error::RmiErrorInput)
    }

    fn injected(&mut self, cmd: usize) -> Option<Error> {
        let pos = self.faults.iter().position(|(c, _, _)| *c == cmd)?;
        self.faults[pos].1 -= 1;
        if self.faults[pos].1 == 0 {
            Some(self.faults.remove(pos).2)
        } else {
            None
        }
    }
}

/// A Realm Management Monitor simulated in memory.
///
/// It keeps granule states and per-realm tables, follows the RMI rules for
/// walks, table creation, destruction and folding, and logs every call.
pub struct MockMonitor {
    model: Mutex<Model>,
}

impl MockMonitor {
    pub fn new() -> Self {
        Self {
            model: Mutex::new(Model {
                version: encode_version(),
                ..Default::default()
            }),
        }
    }

    pub fn set_version(&self, version: usize) {
        self.model.lock().version = version;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.model.lock().log.clone()
    }

    pub fn clear_log(&self) {
        self.model.lock().log.clear();
    }

    pub fn count(&self, cmd: usize) -> usize {
        self.model.lock().log.iter().filter(|c| c.cmd == cmd).count()
    }

    pub fn count_ok(&self, cmd: usize) -> usize {
        self.model
            .lock()
            .log
            .iter()
            .filter(|c| c.cmd == cmd && c.ok)
            .count()
    }

    pub fn fail_next(&self, cmd: usize, err: Error) {
        self.fail_nth(cmd, 1, err);
    }

    /// Fails the `n`th upcoming call of `cmd`, counting from 1.
    pub fn fail_nth(&self, cmd: usize, n: usize, err: Error) {
        self.model.lock().faults.push((cmd, n, err));
    }

    /// Queues the exit the next REC_ENTER reports.
    pub fn push_exit(&self, exit: Exit) {
        self.model.lock().exits.push_back(exit);
    }

    /// Stands in for a RIPAS change the realm requested through `rec`.
    pub fn request_ripas(&self, rec: usize, base: usize, top: usize, ripas: Ripas) {
        if let Some(r) = self.model.lock().recs.get_mut(&rec) {
            r.ripas = Some((base, top, ripas));
        }
    }

    pub fn rec_runnable(&self, rec: usize) -> bool {
        self.model
            .lock()
            .recs
            .get(&rec)
            .map_or(false, |r| r.runnable)
    }

    fn call<T>(
        &self,
        cmd: usize,
        args: [usize; 4],
        f: impl FnOnce(&mut Model) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut model = self.model.lock();
        let ret = match model.injected(cmd) {
            Some(e) => Err(e),
            None => f(&mut *model),
        };
        model.log.push(Call {
            cmd,
            args,
            ok: ret.is_ok(),
        });
        ret
    }

    fn call_top<T>(
        &self,
        cmd: usize,
        args: [usize; 4],
        f: impl FnOnce(&mut Model) -> WithTop<T>,
    ) -> WithTop<T> {
        let mut model = self.model.lock();
        let (ret, top) = match model.injected(cmd) {
            Some(e) => (Err(e), args[1]),
            None => f(&mut *model),
        };
        model.log.push(Call {
            cmd,
            args,
            ok: ret.is_ok(),
        });
        (ret, top)
    }
}

fn create_data(m: &mut Model, rd: usize, data: usize, ipa: usize, active: bool) -> Result<(), Error> {
    m.expect_granule(data, GranuleState::Delegated)?;
    let realm = m.realm(rd)?;
    if realm.state != RealmState::New && !active {
        return Err(Error::RmiErrorRealm(0));
    }
    if !is_aligned(ipa, PAGE_SIZE) || ipa >= realm.par_size() {
        return Err(Error::RmiErrorInput);
    }
    let (level, slot) = realm.walk(ipa, RTT_MAX_LEVEL);
    if level < RTT_MAX_LEVEL {
        return Err(Error::RmiErrorRtt(level));
    }
    if slot.state != RttEntryState::Unassigned {
        return Err(Error::RmiErrorRtt(RTT_MAX_LEVEL));
    }
    realm.set(
        level,
        ipa,
        Slot {
            state: RttEntryState::Assigned,
            desc: data,
            ripas: slot.ripas,
        },
    );
    m.granules.insert(data, GranuleState::Data);
    Ok(())
}

fn check_level(realm: &RealmModel, level: usize) -> Result<(), Error> {
    if level <= realm.start_level || level > RTT_MAX_LEVEL {
        return Err(Error::RmiErrorInput);
    }
    Ok(())
}

impl Monitor for MockMonitor {
    fn version(&self, requested: usize) -> Result<(usize, usize), Error> {
        self.call(VERSION, [requested, 0, 0, 0], |m| Ok((m.version, m.version)))
    }

    fn features(&self, index: usize) -> Result<u64, Error> {
        self.call(FEATURES, [index, 0, 0, 0], |_| {
            if index != 0 {
                return Err(Error::RmiErrorInput);
            }
            let mut reg = FeatureReg0::new(0);
            reg.set_masked_value(FeatureReg0::S2SZ, MOCK_S2SZ as u64)
                .set_masked_value(FeatureReg0::HASH_SHA_256, 1)
                .set_masked_value(FeatureReg0::NUM_BPS, 6)
                .set_masked_value(FeatureReg0::NUM_WPS, 4);
            Ok(reg.get())
        })
    }

    fn granule_delegate(&self, addr: usize) -> Result<(), Error> {
        self.call(GRANULE_DELEGATE, [addr, 0, 0, 0], |m| {
            if !is_aligned(addr, PAGE_SIZE) || m.granules.contains_key(&addr) {
                return Err(Error::RmiErrorInput);
            }
            m.granules.insert(addr, GranuleState::Delegated);
            Ok(())
        })
    }

    fn granule_undelegate(&self, addr: usize) -> Result<(), Error> {
        self.call(GRANULE_UNDELEGATE, [addr, 0, 0, 0], |m| {
            m.expect_granule(addr, GranuleState::Delegated)?;
            m.granules.remove(&addr);
            Ok(())
        })
    }

    fn realm_create(&self, rd: usize, params: &realm::Params) -> Result<(), Error> {
        let base = params.rtt_base as usize;
        self.call(REALM_CREATE, [rd, base, 0, 0], |m| {
            let num = params.rtt_num_start as usize;
            let ipa_bits = params.s2sz as usize;
            let start_level = params.rtt_level_start as usize;

            m.expect_granule(rd, GranuleState::Delegated)?;
            for i in 0..num {
                m.expect_granule(base + i * PAGE_SIZE, GranuleState::Delegated)?;
            }
            if mm::start_level(ipa_bits) != start_level
                || mm::pgd_pages(ipa_bits, start_level) != num
            {
                return Err(Error::RmiErrorInput);
            }

            m.granules.insert(rd, GranuleState::Rd);
            for i in 0..num {
                m.granules.insert(base + i * PAGE_SIZE, GranuleState::Rtt);
            }
            m.realms.insert(
                rd,
                RealmModel {
                    state: RealmState::New,
                    ipa_bits,
                    start_level,
                    pgd: (base, num),
                    recs: 0,
                    slots: BTreeMap::new(),
                },
            );
            Ok(())
        })
    }

    fn realm_activate(&self, rd: usize) -> Result<(), Error> {
        self.call(REALM_ACTIVATE, [rd, 0, 0, 0], |m| {
            let realm = m.realm(rd)?;
            if realm.state != RealmState::New {
                return Err(Error::RmiErrorRealm(0));
            }
            realm.state = RealmState::Active;
            Ok(())
        })
    }

    fn realm_destroy(&self, rd: usize) -> Result<(), Error> {
        self.call(REALM_DESTROY, [rd, 0, 0, 0], |m| {
            let realm = m.realm(rd)?;
            if realm.recs > 0 || realm.slots.values().any(|s| s.state.is_live()) {
                return Err(Error::RmiErrorInUse);
            }
            let (base, num) = realm.pgd;
            m.realms.remove(&rd);
            m.granules.insert(rd, GranuleState::Delegated);
            for i in 0..num {
                m.granules.insert(base + i * PAGE_SIZE, GranuleState::Delegated);
            }
            Ok(())
        })
    }

    fn rec_aux_count(&self, rd: usize) -> Result<usize, Error> {
        self.call(REC_AUX_COUNT, [rd, 0, 0, 0], |m| {
            m.realm(rd)?;
            Ok(MOCK_AUX_COUNT)
        })
    }

    fn rec_create(&self, rd: usize, rec: usize, params: &rec::Params) -> Result<(), Error> {
        self.call(REC_CREATE, [rd, rec, 0, 0], |m| {
            if m.realm(rd)?.state != RealmState::New {
                return Err(Error::RmiErrorRealm(0));
            }
            m.expect_granule(rec, GranuleState::Delegated)?;
            if params.num_aux as usize != MOCK_AUX_COUNT {
                return Err(Error::RmiErrorInput);
            }
            let aux: Vec<usize> = params.aux().iter().map(|a| *a as usize).collect();
            for addr in &aux {
                m.expect_granule(*addr, GranuleState::Delegated)?;
            }

            m.granules.insert(rec, GranuleState::Rec);
            for addr in &aux {
                m.granules.insert(*addr, GranuleState::Rec);
            }
            m.realm(rd)?.recs += 1;
            m.recs.insert(
                rec,
                RecModel {
                    rd,
                    aux,
                    runnable: params.runnable(),
                    ripas: None,
                },
            );
            Ok(())
        })
    }

    fn rec_destroy(&self, rec: usize) -> Result<(), Error> {
        self.call(REC_DESTROY, [rec, 0, 0, 0], |m| {
            let model = m.recs.remove(&rec).ok_or(Error::RmiErrorInput)?;
            m.granules.insert(rec, GranuleState::Delegated);
            for addr in &model.aux {
                m.granules.insert(*addr, GranuleState::Delegated);
            }
            m.realm(model.rd)?.recs -= 1;
            Ok(())
        })
    }

    fn rec_enter(&self, rec: usize, run: &mut Run) -> Result<(), Error> {
        self.call(REC_ENTER, [rec, 0, 0, 0], |m| {
            let rd = m.recs.get(&rec).ok_or(Error::RmiErrorInput)?.rd;
            if m.realm(rd)?.state != RealmState::Active {
                return Err(Error::RmiErrorRealm(0));
            }
            let exit = m.exits.pop_front().unwrap_or(Exit {
                exit_reason: EXIT_IRQ,
                ..Default::default()
            });
            if exit.exit_reason == EXIT_RIPAS_CHANGE {
                if let Some(r) = m.recs.get_mut(&rec) {
                    r.ripas = Some((
                        exit.ripas_base as usize,
                        exit.ripas_top as usize,
                        Ripas::from((exit.ripas_value & 1) as usize),
                    ));
                }
            }
            run.exit = exit;
            Ok(())
        })
    }

    fn psci_complete(&self, calling: usize, target: usize, status: usize) -> Result<(), Error> {
        self.call(PSCI_COMPLETE, [calling, target, status, 0], |m| {
            if !m.recs.contains_key(&calling) || !m.recs.contains_key(&target) {
                return Err(Error::RmiErrorInput);
            }
            Ok(())
        })
    }

    fn data_create(
        &self,
        rd: usize,
        data: usize,
        ipa: usize,
        src: usize,
        flags: usize,
    ) -> Result<(), Error> {
        self.call(DATA_CREATE, [rd, ipa, data, src | flags], |m| {
            create_data(m, rd, data, ipa, false)
        })
    }

    fn data_create_unknown(&self, rd: usize, data: usize, ipa: usize) -> Result<(), Error> {
        self.call(DATA_CREATE_UNKNOWN, [rd, ipa, data, 0], |m| {
            create_data(m, rd, data, ipa, true)
        })
    }

    fn data_destroy(&self, rd: usize, ipa: usize) -> WithTop<usize> {
        self.call_top(DATA_DESTROY, [rd, ipa, 0, 0], |m| {
            let realm = match m.realm(rd) {
                Ok(realm) => realm,
                Err(e) => return (Err(e), ipa),
            };
            let (level, slot) = realm.walk(ipa, RTT_MAX_LEVEL);
            if level < RTT_MAX_LEVEL {
                let top = if slot.state.is_live() {
                    ipa
                } else {
                    realm.next_live(level, ipa)
                };
                return (Err(Error::RmiErrorRtt(level)), top);
            }
            if slot.state != RttEntryState::Assigned {
                return (Err(Error::RmiErrorRtt(level)), realm.next_live(level, ipa));
            }
            realm.set(level, ipa, Slot::unassigned(slot.ripas));
            let top = realm.next_live(level, ipa);
            m.granules.insert(slot.desc, GranuleState::Delegated);
            (Ok(slot.desc), top)
        })
    }

    fn rtt_create(&self, rd: usize, rtt: usize, ipa: usize, level: usize) -> Result<(), Error> {
        self.call(RTT_CREATE, [rd, ipa, level, rtt], |m| {
            m.expect_granule(rtt, GranuleState::Delegated)?;
            let realm = m.realm(rd)?;
            check_level(realm, level)?;
            if !is_aligned(ipa, map_size(level - 1)) {
                return Err(Error::RmiErrorInput);
            }
            let (walk, parent) = realm.walk(ipa, level - 1);
            if walk < level - 1 {
                return Err(Error::RmiErrorRtt(walk));
            }
            if parent.state == RttEntryState::Table {
                return Err(Error::RmiErrorRtt(level));
            }

            let size = map_size(level);
            for i in 0..ENTRIES {
                let desc = match parent.state {
                    RttEntryState::Assigned | RttEntryState::ValidNs => parent.desc + i * size,
                    _ => 0,
                };
                realm.set(level, ipa + i * size, Slot { desc, ..parent });
            }
            realm.set(
                level - 1,
                ipa,
                Slot {
                    state: RttEntryState::Table,
                    desc: rtt,
                    ripas: parent.ripas,
                },
            );
            m.granules.insert(rtt, GranuleState::Rtt);
            Ok(())
        })
    }

    fn rtt_destroy(&self, rd: usize, ipa: usize, level: usize) -> WithTop<usize> {
        self.call_top(RTT_DESTROY, [rd, ipa, level, 0], |m| {
            let realm = match m.realm(rd) {
                Ok(realm) => realm,
                Err(e) => return (Err(e), ipa),
            };
            if check_level(realm, level).is_err() || !is_aligned(ipa, map_size(level - 1)) {
                return (Err(Error::RmiErrorInput), ipa);
            }
            let (walk, parent) = realm.walk(ipa, level - 1);
            if walk < level - 1 || parent.state != RttEntryState::Table {
                let top = if parent.state.is_live() {
                    ipa
                } else {
                    realm.next_live(walk, ipa)
                };
                return (Err(Error::RmiErrorRtt(walk)), top);
            }
            if realm.children(level, ipa).any(|s| s.state.is_live()) {
                return (Err(Error::RmiErrorRtt(level)), ipa);
            }

            realm.remove_children(level, ipa);
            let replaced = if ipa < realm.par_size() {
                Slot {
                    state: RttEntryState::Destroyed,
                    desc: 0,
                    ripas: Ripas::Destroyed,
                }
            } else {
                Slot::unassigned(Ripas::Empty)
            };
            realm.set(level - 1, ipa, replaced);
            let top = realm.next_live(level - 1, ipa);
            m.granules.insert(parent.desc, GranuleState::Delegated);
            (Ok(parent.desc), top)
        })
    }

    fn rtt_fold(&self, rd: usize, ipa: usize, level: usize) -> Result<usize, Error> {
        self.call(RTT_FOLD, [rd, ipa, level, 0], |m| {
            let realm = m.realm(rd)?;
            check_level(realm, level)?;
            let base = align_down(ipa, map_size(level - 1));
            let (walk, parent) = realm.walk(base, level - 1);
            if walk < level - 1 || parent.state != RttEntryState::Table {
                return Err(Error::RmiErrorRtt(walk));
            }

            let size = map_size(level);
            let first = realm.get(level, base);
            let uniform = realm.children(level, base).enumerate().all(|(i, s)| {
                s.state == first.state
                    && s.ripas == first.ripas
                    && match s.state {
                        RttEntryState::Assigned | RttEntryState::ValidNs => {
                            s.desc == first.desc + i * size
                        }
                        RttEntryState::Table => false,
                        _ => true,
                    }
            });
            let foldable = match first.state {
                RttEntryState::Assigned | RttEntryState::ValidNs => {
                    level - 1 >= RTT_BLOCK_LEVEL
                        && is_aligned(first.desc & !(PAGE_SIZE - 1), map_size(level - 1))
                }
                _ => true,
            };
            if !uniform || !foldable {
                return Err(Error::RmiErrorRtt(level));
            }

            realm.remove_children(level, base);
            realm.set(level - 1, base, first);
            m.granules.insert(parent.desc, GranuleState::Delegated);
            Ok(parent.desc)
        })
    }

    fn rtt_read_entry(&self, rd: usize, ipa: usize, level: usize) -> Result<RttEntry, Error> {
        self.call(RTT_READ_ENTRY, [rd, ipa, level, 0], |m| {
            let realm = m.realm(rd)?;
            if level < realm.start_level || level > RTT_MAX_LEVEL {
                return Err(Error::RmiErrorInput);
            }
            let (walk_level, slot) = realm.walk(ipa, level);
            Ok(RttEntry {
                walk_level,
                state: slot.state,
                desc: slot.desc,
                ripas: slot.ripas,
            })
        })
    }

    fn rtt_init_ripas(&self, rd: usize, base: usize, top: usize) -> Result<usize, Error> {
        self.call(RTT_INIT_RIPAS, [rd, base, top, 0], |m| {
            let realm = m.realm(rd)?;
            if realm.state != RealmState::New {
                return Err(Error::RmiErrorRealm(0));
            }
            if base >= top || top > realm.par_size() {
                return Err(Error::RmiErrorInput);
            }
            realm.apply_ripas(base, top, Ripas::Ram, false)
        })
    }

    fn rtt_set_ripas(&self, rd: usize, rec: usize, base: usize, top: usize) -> Result<usize, Error> {
        self.call(RTT_SET_RIPAS, [rd, base, top, rec], |m| {
            let request = m.recs.get(&rec).ok_or(Error::RmiErrorInput)?;
            let owner = request.rd;
            let (from, to, ripas) = request.ripas.ok_or(Error::RmiErrorInput)?;
            if owner != rd || base != from || top > to {
                return Err(Error::RmiErrorInput);
            }

            let realm = m.realm(rd)?;
            if realm.state != RealmState::Active {
                return Err(Error::RmiErrorRealm(0));
            }
            let reached = realm.apply_ripas(base, top, ripas, true)?;

            if let Some(r) = m.recs.get_mut(&rec) {
                r.ripas = if reached < to {
                    Some((reached, to, ripas))
                } else {
                    None
                };
            }
            Ok(reached)
        })
    }

    fn rtt_map_unprotected(
        &self,
        rd: usize,
        ipa: usize,
        level: usize,
        desc: usize,
    ) -> Result<(), Error> {
        self.call(RTT_MAP_UNPROTECTED, [rd, ipa, level, desc], |m| {
            let realm = m.realm(rd)?;
            check_level(realm, level)?;
            if !is_aligned(ipa, map_size(level))
                || ipa < realm.par_size()
                || ipa >= 1 << realm.ipa_bits
            {
                return Err(Error::RmiErrorInput);
            }
            let (walk, slot) = realm.walk(ipa, level);
            if walk < level {
                return Err(Error::RmiErrorRtt(walk));
            }
            if slot.state != RttEntryState::Unassigned {
                return Err(Error::RmiErrorRtt(level));
            }
            realm.set(
                level,
                ipa,
                Slot {
                    state: RttEntryState::ValidNs,
                    desc,
                    ripas: Ripas::Empty,
                },
            );
            Ok(())
        })
    }

    fn rtt_unmap_unprotected(&self, rd: usize, ipa: usize, level: usize) -> WithTop<()> {
        self.call_top(RTT_UNMAP_UNPROTECTED, [rd, ipa, level, 0], |m| {
            let realm = match m.realm(rd) {
                Ok(realm) => realm,
                Err(e) => return (Err(e), ipa),
            };
            if check_level(realm, level).is_err()
                || !is_aligned(ipa, map_size(level))
                || ipa < realm.par_size()
            {
                return (Err(Error::RmiErrorInput), ipa);
            }
            let (walk, slot) = realm.walk(ipa, level);
            if walk < level {
                let top = if slot.state.is_live() {
                    ipa
                } else {
                    realm.next_live(walk, ipa)
                };
                return (Err(Error::RmiErrorRtt(walk)), top);
            }
            if slot.state != RttEntryState::ValidNs {
                return (Err(Error::RmiErrorRtt(level)), realm.next_live(level, ipa));
            }
            realm.set(level, ipa, Slot::unassigned(Ripas::Empty));
            (Ok(()), realm.next_live(level, ipa))
        })
    }
}

struct HostState {
    next: usize,
    outstanding: usize,
    atomic_pool: Option<usize>,
    copies: usize,
}

/// Bump allocator standing in for the hypervisor's page allocator.
/// Allocations are aligned to their own size and never reused.
pub struct MockHost {
    state: Mutex<HostState>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                next: HOST_BASE,
                outstanding: 0,
                atomic_pool: None,
                copies: 0,
            }),
        }
    }

    /// Pages allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn copies(&self) -> usize {
        self.state.lock().copies
    }

    /// Limits what `MustNotBlock` allocations may take from now on.
    pub fn set_atomic_pool(&self, pages: usize) {
        self.state.lock().atomic_pool = Some(pages);
    }
}

impl HostMemory for MockHost {
    fn alloc_pages(&self, count: usize, ctx: AllocationContext) -> Option<usize> {
        let mut state = self.state.lock();
        if ctx == AllocationContext::MustNotBlock {
            if let Some(pool) = state.atomic_pool.as_mut() {
                if *pool < count {
                    return None;
                }
                *pool -= count;
            }
        }
        let addr = align_up(state.next, (count * PAGE_SIZE).next_power_of_two());
        state.next = addr + count * PAGE_SIZE;
        state.outstanding += count;
        Some(addr)
    }

    fn free_pages(&self, _addr: usize, count: usize) {
        let mut state = self.state.lock();
        state.outstanding = state.outstanding.saturating_sub(count);
    }

    fn copy_page(&self, _dst: usize, _src: usize) {
        self.state.lock().copies += 1;
    }
}

/// One memory slot backing `[base, base + size)` with contiguous host pages.
pub struct MockSlots {
    base: usize,
    size: usize,
    mem: usize,
    released: AtomicUsize,
}

impl MockSlots {
    pub fn new(host: &MockHost, base: usize, size: usize) -> Self {
        let mem = host
            .alloc_pages(size / PAGE_SIZE, AllocationContext::MayBlock)
            .unwrap();
        Self {
            base,
            size,
            mem,
            released: AtomicUsize::new(0),
        }
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }
}

impl MemorySlots for MockSlots {
    fn backing(&self, ipa: usize) -> Option<Backing> {
        if ipa < self.base || ipa >= self.base + self.size {
            return None;
        }
        let offset = ipa - self.base;
        let large = map_size(RTT_BLOCK_LEVEL);
        Some(Backing {
            pa: self.mem + offset,
            block: is_aligned(offset, large) && offset + large <= self.size,
        })
    }

    fn release(&self, _pa: usize, size: usize) {
        self.released.fetch_add(size, Ordering::Relaxed);
    }
}

pub fn alloc_page(host: &MockHost) -> usize {
    host.alloc_pages(1, AllocationContext::MayBlock).unwrap()
}

/// A realm in NONE on top of a fresh monitor, with the call log cleared.
pub fn new_realm(ipa_bits: usize) -> (Arc<MockMonitor>, Arc<MockHost>, Realm) {
    let monitor = Arc::new(MockMonitor::new());
    crate::rmi::init(monitor.as_ref()).unwrap();
    monitor.clear_log();

    let host = Arc::new(MockHost::new());
    let realm = Realm::new(monitor.clone(), host.clone(), ipa_bits);
    (monitor, host, realm)
}
