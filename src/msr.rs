//! The bounded table of emulated model-specific registers.

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::regs::CpuRegisterState;

pub const IA32_TSC: u32 = 0x10;
pub const IA32_APIC_BASE: u32 = 0x1b;
pub const IA32_MTRRCAP: u32 = 0xfe;
pub const IA32_SYSENTER_CS: u32 = 0x174;
pub const IA32_SYSENTER_ESP: u32 = 0x175;
pub const IA32_SYSENTER_EIP: u32 = 0x176;
pub const IA32_MISC_ENABLE: u32 = 0x1a0;
pub const IA32_PAT: u32 = 0x277;
pub const IA32_MTRR_DEF_TYPE: u32 = 0x2ff;
/// x2APIC interrupt command register. Writes are classified as IPIs, never stored.
pub const IA32_X2APIC_ICR: u32 = 0x830;
pub const IA32_EFER: u32 = 0xc000_0080;
pub const IA32_STAR: u32 = 0xc000_0081;
pub const IA32_LSTAR: u32 = 0xc000_0082;
pub const IA32_CSTAR: u32 = 0xc000_0083;
pub const IA32_FMASK: u32 = 0xc000_0084;
pub const IA32_FS_BASE: u32 = 0xc000_0100;
pub const IA32_GS_BASE: u32 = 0xc000_0101;
pub const IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;
pub const IA32_TSC_AUX: u32 = 0xc000_0103;

/// Static description of one emulated MSR.
#[derive(Debug)]
pub struct MsrInfo {
    pub index: u32,
    pub name: &'static str,
    pub writable: bool,
    pub reset: u64,
}

const fn rw(index: u32, name: &'static str, reset: u64) -> MsrInfo {
    MsrInfo {
        index,
        name,
        writable: true,
        reset,
    }
}

/// Every MSR the monitor emulates. Anything else is subject to [`MsrPolicy`].
pub static EMULATED_MSRS: &[MsrInfo] = &[
    rw(IA32_TSC, "IA32_TSC", 0),
    rw(IA32_APIC_BASE, "IA32_APIC_BASE", 0xfee0_0800),
    MsrInfo {
        index: IA32_MTRRCAP,
        name: "IA32_MTRRCAP",
        writable: false,
        // WC supported, no fixed or variable ranges
        reset: 1 << 10,
    },
    rw(IA32_SYSENTER_CS, "IA32_SYSENTER_CS", 0),
    rw(IA32_SYSENTER_ESP, "IA32_SYSENTER_ESP", 0),
    rw(IA32_SYSENTER_EIP, "IA32_SYSENTER_EIP", 0),
    rw(IA32_MISC_ENABLE, "IA32_MISC_ENABLE", 1),
    rw(IA32_PAT, "IA32_PAT", 0x0007_0406_0007_0406),
    rw(IA32_MTRR_DEF_TYPE, "IA32_MTRR_DEF_TYPE", 0),
    rw(IA32_EFER, "IA32_EFER", 0),
    rw(IA32_STAR, "IA32_STAR", 0),
    rw(IA32_LSTAR, "IA32_LSTAR", 0),
    rw(IA32_CSTAR, "IA32_CSTAR", 0),
    rw(IA32_FMASK, "IA32_FMASK", 0),
    rw(IA32_FS_BASE, "IA32_FS_BASE", 0),
    rw(IA32_GS_BASE, "IA32_GS_BASE", 0),
    rw(IA32_KERNEL_GS_BASE, "IA32_KERNEL_GS_BASE", 0),
    rw(IA32_TSC_AUX, "IA32_TSC_AUX", 0),
];

/// Looks up an emulated MSR.
pub fn lookup(index: u32) -> Option<&'static MsrInfo> {
    EMULATED_MSRS.iter().find(|m| m.index == index)
}

/// Whether `index` is in the emulated set.
pub fn is_emulated(index: u32) -> bool {
    lookup(index).is_some()
}

pub(crate) fn reset_values() -> BTreeMap<u32, u64> {
    EMULATED_MSRS.iter().map(|m| (m.index, m.reset)).collect()
}

/// How accesses to MSRs outside the emulated set (and writes to read-only ones) are treated.
///
/// The same policy governs both the read and the write path. There is intentionally no
/// default: every machine configuration has to choose one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsrPolicy {
    /// Inject #GP(0) into the guest.
    Strict,
    /// Reads return zero, writes are discarded.
    Lenient,
}

/// The result of emulating one RDMSR or WRMSR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsrOutcome {
    /// The access completed; for reads this carries the value.
    Done(u64),
    /// The access must raise #GP(0) in the guest.
    InjectGp,
}

/// Emulates RDMSR.
pub fn read(regs: &CpuRegisterState, index: u32, policy: MsrPolicy) -> MsrOutcome {
    match lookup(index) {
        Some(info) => MsrOutcome::Done(regs.msrs.get(&info.index).copied().unwrap_or(info.reset)),
        None => unknown(index, "read", policy),
    }
}

/// Emulates WRMSR.
pub fn write(regs: &mut CpuRegisterState, index: u32, value: u64, policy: MsrPolicy) -> MsrOutcome {
    match lookup(index) {
        Some(info) if info.writable => {
            regs.msrs.insert(index, value);
            MsrOutcome::Done(value)
        }
        Some(info) => {
            warn!("write of {value:#x} to read-only MSR {}", info.name);
            match policy {
                MsrPolicy::Strict => MsrOutcome::InjectGp,
                MsrPolicy::Lenient => MsrOutcome::Done(0),
            }
        }
        None => unknown(index, "write", policy),
    }
}

fn unknown(index: u32, op: &str, policy: MsrPolicy) -> MsrOutcome {
    match policy {
        MsrPolicy::Strict => {
            warn!("{op} of unknown MSR {index:#x}, injecting #GP");
            MsrOutcome::InjectGp
        }
        MsrPolicy::Lenient => {
            warn!("{op} of unknown MSR {index:#x} ignored");
            MsrOutcome::Done(0)
        }
    }
}
