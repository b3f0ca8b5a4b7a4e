//! Architectural register state and typed access to it.
//!
//! [`CpuRegisterState`] is the backend-independent register file of one vCPU. Backends
//! synchronize their hardware state into it around every guest entry, so the exit handlers,
//! the checkpoint coordinator and the inspection CLI all operate on the same representation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RegisterError;
use crate::msr;

/// General-purpose registers, in x86 encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// All general-purpose registers, in encoding order.
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    const NAMES: [&'static str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    /// The lowercase name of the register.
    pub fn name(self) -> &'static str {
        Self::NAMES[self as usize]
    }
}

/// Segment and system-segment registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum SegmentId {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
    Ldtr = 6,
    Tr = 7,
}

impl SegmentId {
    /// All segment registers.
    pub const ALL: [SegmentId; 8] = [
        SegmentId::Es,
        SegmentId::Cs,
        SegmentId::Ss,
        SegmentId::Ds,
        SegmentId::Fs,
        SegmentId::Gs,
        SegmentId::Ldtr,
        SegmentId::Tr,
    ];

    const NAMES: [&'static str; 8] = ["es", "cs", "ss", "ds", "fs", "gs", "ldtr", "tr"];

    /// The lowercase name of the register.
    pub fn name(self) -> &'static str {
        Self::NAMES[self as usize]
    }
}

/// Descriptor-table registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum TableId {
    Gdtr,
    Idtr,
}

/// Debug registers that are part of the architectural state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum DebugReg {
    Dr0 = 0,
    Dr1 = 1,
    Dr2 = 2,
    Dr3 = 3,
    Dr6 = 4,
    Dr7 = 5,
}

impl DebugReg {
    /// All debug registers.
    pub const ALL: [DebugReg; 6] = [
        DebugReg::Dr0,
        DebugReg::Dr1,
        DebugReg::Dr2,
        DebugReg::Dr3,
        DebugReg::Dr6,
        DebugReg::Dr7,
    ];

    const NAMES: [&'static str; 6] = ["dr0", "dr1", "dr2", "dr3", "dr6", "dr7"];

    /// The lowercase name of the register.
    pub fn name(self) -> &'static str {
        Self::NAMES[self as usize]
    }
}

/// Control registers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ControlReg {
    Cr0,
    Cr2,
    Cr3,
    Cr4,
}

/// A stable identifier for one piece of architectural state.
///
/// Identifiers print as, and parse from, lowercase names such as `rax`, `cr3`, `cs`,
/// `gdtr` or `msr:0xc0000080`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegisterId {
    /// A general-purpose register.
    Gpr(Gpr),
    /// The instruction pointer.
    Rip,
    /// The flags register.
    Rflags,
    /// A control register.
    Control(ControlReg),
    /// A debug register.
    Debug(DebugReg),
    /// A segment register, including its hidden descriptor part.
    Segment(SegmentId),
    /// A descriptor-table register.
    Table(TableId),
    /// An emulated model-specific register.
    Msr(u32),
}

impl RegisterId {
    /// Every identifier backed by [`CpuRegisterState`], including all emulated MSRs.
    pub fn all() -> impl Iterator<Item = RegisterId> {
        Gpr::ALL
            .into_iter()
            .map(RegisterId::Gpr)
            .chain([RegisterId::Rip, RegisterId::Rflags])
            .chain(
                [ControlReg::Cr0, ControlReg::Cr2, ControlReg::Cr3, ControlReg::Cr4]
                    .into_iter()
                    .map(RegisterId::Control),
            )
            .chain(DebugReg::ALL.into_iter().map(RegisterId::Debug))
            .chain(SegmentId::ALL.into_iter().map(RegisterId::Segment))
            .chain([TableId::Gdtr, TableId::Idtr].into_iter().map(RegisterId::Table))
            .chain(msr::EMULATED_MSRS.iter().map(|m| RegisterId::Msr(m.index)))
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpr(gpr) => f.write_str(gpr.name()),
            Self::Rip => f.write_str("rip"),
            Self::Rflags => f.write_str("rflags"),
            Self::Control(ControlReg::Cr0) => f.write_str("cr0"),
            Self::Control(ControlReg::Cr2) => f.write_str("cr2"),
            Self::Control(ControlReg::Cr3) => f.write_str("cr3"),
            Self::Control(ControlReg::Cr4) => f.write_str("cr4"),
            Self::Debug(dr) => f.write_str(dr.name()),
            Self::Segment(seg) => f.write_str(seg.name()),
            Self::Table(TableId::Gdtr) => f.write_str("gdtr"),
            Self::Table(TableId::Idtr) => f.write_str("idtr"),
            Self::Msr(index) => write!(f, "msr:{index:#x}"),
        }
    }
}

impl FromStr for RegisterId {
    type Err = RegisterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        if let Some(index) = name.strip_prefix("msr:") {
            let index = index.trim_start_matches("0x");
            return u32::from_str_radix(index, 16)
                .map(RegisterId::Msr)
                .map_err(|_| RegisterError::Unsupported(s.into()));
        }
        let id = match name.as_str() {
            "rip" => RegisterId::Rip,
            "rflags" => RegisterId::Rflags,
            "cr0" => RegisterId::Control(ControlReg::Cr0),
            "cr2" => RegisterId::Control(ControlReg::Cr2),
            "cr3" => RegisterId::Control(ControlReg::Cr3),
            "cr4" => RegisterId::Control(ControlReg::Cr4),
            "gdtr" => RegisterId::Table(TableId::Gdtr),
            "idtr" => RegisterId::Table(TableId::Idtr),
            other => {
                if let Some(gpr) = Gpr::ALL.into_iter().find(|g| g.name() == other) {
                    RegisterId::Gpr(gpr)
                } else if let Some(dr) = DebugReg::ALL.into_iter().find(|d| d.name() == other) {
                    RegisterId::Debug(dr)
                } else if let Some(seg) = SegmentId::ALL.into_iter().find(|s| s.name() == other) {
                    RegisterId::Segment(seg)
                } else {
                    return Err(RegisterError::Unsupported(s.into()));
                }
            }
        };
        Ok(id)
    }
}

/// The visible selector and hidden descriptor cache of a segment register.
///
/// `access` uses the VMX access-rights layout: type in bits 0..=3, S in bit 4, DPL in bits
/// 5..=6, P in bit 7, L in bit 13, D/B in bit 14, G in bit 15.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// Visible selector.
    pub selector: u16,
    /// Segment base.
    pub base: u64,
    /// Segment limit, in bytes.
    pub limit: u32,
    /// Access rights.
    pub access: u32,
}

impl SegmentDescriptor {
    const ACCESS_LONG: u32 = 1 << 13;
    const ACCESS_DB: u32 = 1 << 14;

    const fn new(selector: u16, base: u64, limit: u32, access: u32) -> Self {
        Self {
            selector,
            base,
            limit,
            access,
        }
    }

    /// Whether the descriptor is a 64-bit code segment (CS.L).
    pub const fn is_long(&self) -> bool {
        self.access & Self::ACCESS_LONG != 0
    }

    /// Whether the descriptor has the default-operand-size bit set (CS.D).
    pub const fn is_default_32(&self) -> bool {
        self.access & Self::ACCESS_DB != 0
    }
}

/// A GDTR or IDTR value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorTable {
    /// Linear base address.
    pub base: u64,
    /// Table limit, in bytes.
    pub limit: u16,
}

/// A typed register value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterValue {
    /// A plain 64-bit register.
    Scalar(u64),
    /// A segment register.
    Segment(SegmentDescriptor),
    /// A descriptor-table register.
    Table(DescriptorTable),
}

/// The addressing mode the guest CPU is currently in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuMode {
    /// Real-address mode.
    Real,
    /// Protected mode with a 16-bit code segment.
    Protected16,
    /// Protected mode (or compatibility mode) with a 32-bit code segment.
    Protected32,
    /// 64-bit long mode.
    Long,
}

impl CpuMode {
    /// The default operand/address size, in bits, used to decode instructions.
    pub const fn bitness(self) -> u32 {
        match self {
            Self::Real | Self::Protected16 => 16,
            Self::Protected32 => 32,
            Self::Long => 64,
        }
    }
}

/// The architectural register file of one virtual CPU.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuRegisterState {
    /// General-purpose registers, indexed by [`Gpr`].
    pub gprs: [u64; 16],
    /// Instruction pointer.
    pub rip: u64,
    /// Flags.
    pub rflags: u64,
    /// CR0.
    pub cr0: u64,
    /// CR2.
    pub cr2: u64,
    /// CR3.
    pub cr3: u64,
    /// CR4.
    pub cr4: u64,
    /// Debug registers, indexed by [`DebugReg`].
    pub dr: [u64; 6],
    /// Segment registers, indexed by [`SegmentId`].
    pub segments: [SegmentDescriptor; 8],
    /// GDTR.
    pub gdtr: DescriptorTable,
    /// IDTR.
    pub idtr: DescriptorTable,
    /// Values of the emulated MSRs.
    pub msrs: BTreeMap<u32, u64>,
}

const CR0_PE: u64 = 1 << 0;
const EFER_LMA: u64 = 1 << 10;

impl Default for CpuRegisterState {
    fn default() -> Self {
        Self::reset()
    }
}

impl CpuRegisterState {
    /// The architectural state after RESET/INIT.
    pub fn reset() -> Self {
        let data = SegmentDescriptor::new(0, 0, 0xffff, 0x93);
        let mut segments = [data; 8];
        segments[SegmentId::Cs as usize] = SegmentDescriptor::new(0xf000, 0xffff_0000, 0xffff, 0x9b);
        segments[SegmentId::Ldtr as usize] = SegmentDescriptor::new(0, 0, 0xffff, 0x82);
        segments[SegmentId::Tr as usize] = SegmentDescriptor::new(0, 0, 0xffff, 0x8b);
        Self {
            gprs: [0; 16],
            rip: 0xfff0,
            rflags: 0x2,
            cr0: 0x6000_0010,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr: [0, 0, 0, 0, 0xffff_0ff0, 0x400],
            segments,
            gdtr: DescriptorTable { base: 0, limit: 0xffff },
            idtr: DescriptorTable { base: 0, limit: 0xffff },
            msrs: msr::reset_values(),
        }
    }

    /// Point the CPU at a real-mode entry as a STARTUP IPI does: `CS = vector << 8`, `IP = 0`.
    pub fn set_startup_entry(&mut self, vector: u8) {
        let cs = &mut self.segments[SegmentId::Cs as usize];
        cs.selector = u16::from(vector) << 8;
        cs.base = u64::from(vector) << 12;
        self.rip = 0;
    }

    /// Reads a general-purpose register.
    pub fn gpr(&self, gpr: Gpr) -> u64 {
        self.gprs[gpr as usize]
    }

    /// Writes a general-purpose register.
    pub fn set_gpr(&mut self, gpr: Gpr, value: u64) {
        self.gprs[gpr as usize] = value;
    }

    /// Writes the low `size` bytes of a general-purpose register with x86 semantics: 32-bit
    /// writes zero the upper half, 8- and 16-bit writes preserve the remaining bytes.
    pub fn write_gpr_sized(&mut self, gpr: Gpr, size: usize, value: u64) {
        let old = self.gpr(gpr);
        let new = match size {
            1 => (old & !0xff) | (value & 0xff),
            2 => (old & !0xffff) | (value & 0xffff),
            4 => value & 0xffff_ffff,
            _ => value,
        };
        self.set_gpr(gpr, new);
    }

    /// Returns a segment register.
    pub fn segment(&self, seg: SegmentId) -> &SegmentDescriptor {
        &self.segments[seg as usize]
    }

    /// The current addressing mode, derived from CR0.PE, EFER.LMA and CS.L/CS.D.
    pub fn cpu_mode(&self) -> CpuMode {
        let efer = self.msrs.get(&msr::IA32_EFER).copied().unwrap_or(0);
        let cs = self.segment(SegmentId::Cs);
        if self.cr0 & CR0_PE == 0 {
            CpuMode::Real
        } else if efer & EFER_LMA != 0 && cs.is_long() {
            CpuMode::Long
        } else if cs.is_default_32() {
            CpuMode::Protected32
        } else {
            CpuMode::Protected16
        }
    }
}

/// Typed get/set access to architectural state, keyed by [`RegisterId`].
pub trait RegisterAccess {
    /// Reads one register.
    fn get(&self, id: RegisterId) -> Result<RegisterValue, RegisterError>;

    /// Writes one register. The value must have the shape the identifier expects.
    fn set(&mut self, id: RegisterId, value: RegisterValue) -> Result<(), RegisterError>;
}

impl RegisterAccess for CpuRegisterState {
    fn get(&self, id: RegisterId) -> Result<RegisterValue, RegisterError> {
        let value = match id {
            RegisterId::Gpr(gpr) => RegisterValue::Scalar(self.gpr(gpr)),
            RegisterId::Rip => RegisterValue::Scalar(self.rip),
            RegisterId::Rflags => RegisterValue::Scalar(self.rflags),
            RegisterId::Control(cr) => RegisterValue::Scalar(match cr {
                ControlReg::Cr0 => self.cr0,
                ControlReg::Cr2 => self.cr2,
                ControlReg::Cr3 => self.cr3,
                ControlReg::Cr4 => self.cr4,
            }),
            RegisterId::Debug(dr) => RegisterValue::Scalar(self.dr[dr as usize]),
            RegisterId::Segment(seg) => RegisterValue::Segment(self.segments[seg as usize]),
            RegisterId::Table(TableId::Gdtr) => RegisterValue::Table(self.gdtr),
            RegisterId::Table(TableId::Idtr) => RegisterValue::Table(self.idtr),
            RegisterId::Msr(index) => {
                if !msr::is_emulated(index) {
                    return Err(RegisterError::Unsupported(id.to_string()));
                }
                RegisterValue::Scalar(self.msrs.get(&index).copied().unwrap_or(0))
            }
        };
        Ok(value)
    }

    fn set(&mut self, id: RegisterId, value: RegisterValue) -> Result<(), RegisterError> {
        let mismatch = |expected| RegisterError::TypeMismatch { id, expected };
        match (id, value) {
            (RegisterId::Gpr(gpr), RegisterValue::Scalar(v)) => self.set_gpr(gpr, v),
            (RegisterId::Rip, RegisterValue::Scalar(v)) => self.rip = v,
            (RegisterId::Rflags, RegisterValue::Scalar(v)) => self.rflags = v,
            (RegisterId::Control(cr), RegisterValue::Scalar(v)) => match cr {
                ControlReg::Cr0 => self.cr0 = v,
                ControlReg::Cr2 => self.cr2 = v,
                ControlReg::Cr3 => self.cr3 = v,
                ControlReg::Cr4 => self.cr4 = v,
            },
            (RegisterId::Debug(dr), RegisterValue::Scalar(v)) => self.dr[dr as usize] = v,
            (RegisterId::Msr(index), RegisterValue::Scalar(v)) => {
                if !msr::is_emulated(index) {
                    return Err(RegisterError::Unsupported(id.to_string()));
                }
                self.msrs.insert(index, v);
            }
            (RegisterId::Segment(seg), RegisterValue::Segment(desc)) => {
                self.segments[seg as usize] = desc;
            }
            (RegisterId::Table(TableId::Gdtr), RegisterValue::Table(desc)) => self.gdtr = desc,
            (RegisterId::Table(TableId::Idtr), RegisterValue::Table(desc)) => self.idtr = desc,
            (RegisterId::Segment(_), _) => return Err(mismatch("segment")),
            (RegisterId::Table(_), _) => return Err(mismatch("descriptor table")),
            (_, _) => return Err(mismatch("scalar")),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for id in RegisterId::all() {
            let parsed: RegisterId = id.to_string().parse().unwrap();
            assert_eq!(parsed, id);
        }
        assert_eq!("RAX".parse::<RegisterId>().unwrap(), RegisterId::Gpr(Gpr::Rax));
        assert_eq!(
            "msr:0xc0000080".parse::<RegisterId>().unwrap(),
            RegisterId::Msr(msr::IA32_EFER)
        );
    }

    #[test]
    fn unknown_names_are_unsupported() {
        assert!(matches!(
            "xmm0".parse::<RegisterId>(),
            Err(RegisterError::Unsupported(_))
        ));
        let regs = CpuRegisterState::reset();
        assert!(matches!(
            regs.get(RegisterId::Msr(0x1234)),
            Err(RegisterError::Unsupported(_))
        ));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let mut regs = CpuRegisterState::reset();
        let expected = |regs: &mut CpuRegisterState, id, value| match regs.set(id, value) {
            Err(RegisterError::TypeMismatch { expected, .. }) => expected,
            other => panic!("unexpected result {other:?}"),
        };
        let cs = RegisterId::Segment(SegmentId::Cs);
        let gdtr = RegisterId::Table(TableId::Gdtr);
        assert_eq!(expected(&mut regs, cs, RegisterValue::Scalar(1)), "segment");
        assert_eq!(expected(&mut regs, gdtr, RegisterValue::Scalar(1)), "descriptor table");
        assert_eq!(
            expected(&mut regs, RegisterId::Rip, RegisterValue::Table(DescriptorTable::default())),
            "scalar"
        );
        assert_eq!(
            expected(&mut regs, gdtr, RegisterValue::Segment(SegmentDescriptor::default())),
            "descriptor table"
        );
        assert_eq!(regs, CpuRegisterState::reset());

        regs.set(gdtr, RegisterValue::Table(DescriptorTable { base: 0x1000, limit: 0x7f }))
            .unwrap();
        assert_eq!(regs.gdtr.base, 0x1000);
    }

    #[test]
    fn sized_writes_follow_x86_rules() {
        let mut regs = CpuRegisterState::reset();
        regs.set_gpr(Gpr::Rax, 0x1122_3344_5566_7788);
        regs.write_gpr_sized(Gpr::Rax, 1, 0xaa);
        assert_eq!(regs.gpr(Gpr::Rax), 0x1122_3344_5566_77aa);
        regs.write_gpr_sized(Gpr::Rax, 2, 0xbbcc);
        assert_eq!(regs.gpr(Gpr::Rax), 0x1122_3344_5566_bbcc);
        regs.write_gpr_sized(Gpr::Rax, 4, 0xdead_beef);
        assert_eq!(regs.gpr(Gpr::Rax), 0xdead_beef);
    }

    #[test]
    fn cpu_mode_tracks_control_state() {
        let mut regs = CpuRegisterState::reset();
        assert_eq!(regs.cpu_mode(), CpuMode::Real);

        regs.cr0 |= CR0_PE;
        assert_eq!(regs.cpu_mode(), CpuMode::Protected16);

        regs.segments[SegmentId::Cs as usize].access |= SegmentDescriptor::ACCESS_DB;
        assert_eq!(regs.cpu_mode(), CpuMode::Protected32);

        regs.msrs.insert(msr::IA32_EFER, EFER_LMA | (1 << 8));
        regs.segments[SegmentId::Cs as usize].access =
            0x9b | SegmentDescriptor::ACCESS_LONG;
        assert_eq!(regs.cpu_mode(), CpuMode::Long);
        assert_eq!(regs.cpu_mode().bitness(), 64);
    }

    #[test]
    fn startup_entry_is_vector_derived() {
        let mut regs = CpuRegisterState::reset();
        regs.set_startup_entry(0x9a);
        assert_eq!(regs.segment(SegmentId::Cs).selector, 0x9a00);
        assert_eq!(regs.segment(SegmentId::Cs).base, 0x9a000);
        assert_eq!(regs.rip, 0);
    }
}
