pub const NR_GPRS: usize = 31;

pub const EMULATED_MMIO: u64 = 1 << 0;
pub const INJECT_SEA: u64 = 1 << 1;
pub const TRAP_WFI: u64 = 1 << 2;
pub const TRAP_WFE: u64 = 1 << 3;

#[derive(Clone, Copy, Debug, Default)]
pub struct Entry {
    pub flags: u64,
    pub gprs: [u64; NR_GPRS],
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Exit {
    pub exit_reason: u8,
    pub esr: u64,
    pub far: u64,
    pub hpfar: u64,
    pub gprs: [u64; NR_GPRS],
    pub cntv_ctl: u64,
    pub cntv_cval: u64,
    pub cntp_ctl: u64,
    pub cntp_cval: u64,
    pub ripas_base: u64,
    pub ripas_top: u64,
    pub ripas_value: u8,
    pub imm: u16,
}

/// Host-visible half of REC_ENTER: what the host passes in and
/// what the monitor reports back when the REC exits.
#[derive(Clone, Copy, Debug, Default)]
pub struct Run {
    pub entry: Entry,
    pub exit: Exit,
}
