use std::fmt;

use crate::addr::{AccessDirection, AccessWidth, GuestPhysAddr, Port};
use crate::emulate::DecodedAccess;
use crate::ipi::IpiRequest;

/// The hardware virtualization backend that produced a [`RawExit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Intel VT-x.
    Vmx,
    /// AMD-V.
    Svm,
    /// Exits synthesized by the monitor itself, never by hardware.
    Monitor,
}

impl Backend {
    /// A short lowercase name for logging.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Vmx => "vmx",
            Self::Svm => "svm",
            Self::Monitor => "monitor",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Up to 15 instruction bytes fetched by the backend or the monitor.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct InsnBytes {
    buf: [u8; Self::MAX_LEN],
    len: u8,
}

impl InsnBytes {
    /// The maximum length of an x86 instruction.
    pub const MAX_LEN: usize = 15;

    /// Copies at most [`Self::MAX_LEN`] bytes from `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let len = bytes.len().min(Self::MAX_LEN);
        let mut buf = [0; Self::MAX_LEN];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            buf,
            len: len as u8,
        }
    }

    /// The valid bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len as usize]
    }

    /// Whether no bytes are available.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for InsnBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InsnBytes({:02x?})", self.as_slice())
    }
}

/// The guest GPRs a backend snapshots on every exit because exit payloads refer to them
/// (RDMSR/WRMSR take their operands from `ECX` and `EDX:EAX`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExitGprs {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
}

/// An unclassified exit as reported by a backend.
///
/// `info1`/`info2` carry the backend's qualification words: the exit qualification and the
/// interruption information on VMX, `EXITINFO1` and `EXITINFO2` on SVM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawExit {
    pub backend: Backend,
    pub code: u64,
    pub rip: u64,
    pub inst_len: u8,
    pub info1: u64,
    pub info2: u64,
    /// Faulting guest-physical address, for backends that report it separately.
    pub guest_phys: u64,
    /// Instruction bytes from decode assists, if the backend provides them.
    pub insn_bytes: InsnBytes,
    /// A backend-provided decode of the faulting memory access, if any.
    pub decoded: Option<DecodedAccess>,
    pub gprs: ExitGprs,
}

impl RawExit {
    /// A raw exit with the given code and empty payload.
    pub fn new(backend: Backend, code: u64, rip: u64) -> Self {
        Self {
            backend,
            code,
            rip,
            inst_len: 0,
            info1: 0,
            info2: 0,
            guest_phys: 0,
            insn_bytes: InsnBytes::default(),
            decoded: None,
            gprs: ExitGprs::default(),
        }
    }

    /// The exit the run loop synthesizes when the machine has been suspended.
    pub fn suspended(reason: SuspendReason, rip: u64) -> Self {
        let mut exit = Self::new(Backend::Monitor, crate::classify::MONITOR_EXIT_SUSPENDED, rip);
        exit.info1 = reason as u64;
        exit
    }
}

/// Why the whole machine was suspended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SuspendReason {
    /// The guest requested a reset.
    Reset = 0,
    /// The guest requested power-off.
    PowerOff = 1,
    /// All processors halted with interrupts disabled.
    Halt = 2,
    /// A processor triple-faulted.
    TripleFault = 3,
}

impl SuspendReason {
    /// Inverse of `reason as u64`.
    pub const fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Self::Reset),
            1 => Some(Self::PowerOff),
            2 => Some(Self::Halt),
            3 => Some(Self::TripleFault),
            _ => None,
        }
    }
}

/// A port I/O exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortIo {
    pub port: Port,
    pub width: AccessWidth,
    pub direction: AccessDirection,
    /// INS/OUTS.
    pub string: bool,
    /// REP-prefixed.
    pub rep: bool,
}

/// A guest access to memory that is not backed by RAM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryAccess {
    pub gpa: GuestPhysAddr,
    /// A decode already performed by the backend. When absent the instruction is decoded in
    /// software.
    pub decoded: Option<DecodedAccess>,
    /// Instruction bytes from decode assists; empty if the backend provides none.
    pub insn: InsnBytes,
}

/// An RDMSR or WRMSR.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsrOp {
    Read,
    Write(u64),
}

/// The closed set of exit kinds the dispatcher handles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitKind {
    PortIo(PortIo),
    MemoryAccess(MemoryAccess),
    MsrAccess { index: u32, op: MsrOp },
    Halt,
    Pause,
    Ipi(IpiRequest),
    Breakpoint,
    SingleStep,
    MachineSuspended(SuspendReason),
    /// An exit reason outside the closed set, kept with its raw code for diagnostics.
    Unsupported { backend: Backend, code: u64 },
}

/// Payload-free discriminant of [`ExitKind`], used for statistics and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExitTag {
    PortIo = 0,
    MemoryAccess,
    MsrAccess,
    Halt,
    Pause,
    Ipi,
    Breakpoint,
    SingleStep,
    MachineSuspended,
    Unsupported,
}

impl ExitTag {
    /// Number of exit tags.
    pub const COUNT: usize = 10;

    /// All tags, in discriminant order.
    pub const ALL: [ExitTag; Self::COUNT] = [
        ExitTag::PortIo,
        ExitTag::MemoryAccess,
        ExitTag::MsrAccess,
        ExitTag::Halt,
        ExitTag::Pause,
        ExitTag::Ipi,
        ExitTag::Breakpoint,
        ExitTag::SingleStep,
        ExitTag::MachineSuspended,
        ExitTag::Unsupported,
    ];
}

impl ExitKind {
    /// The discriminant of this kind.
    pub fn tag(&self) -> ExitTag {
        match self {
            Self::PortIo(_) => ExitTag::PortIo,
            Self::MemoryAccess(_) => ExitTag::MemoryAccess,
            Self::MsrAccess { .. } => ExitTag::MsrAccess,
            Self::Halt => ExitTag::Halt,
            Self::Pause => ExitTag::Pause,
            Self::Ipi(_) => ExitTag::Ipi,
            Self::Breakpoint => ExitTag::Breakpoint,
            Self::SingleStep => ExitTag::SingleStep,
            Self::MachineSuspended(_) => ExitTag::MachineSuspended,
            Self::Unsupported { .. } => ExitTag::Unsupported,
        }
    }
}

/// A classified exit. Created fresh for every guest exit and consumed once by the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitEvent {
    /// Instruction pointer of the faulting instruction.
    pub rip: u64,
    /// Length of the faulting instruction, if the backend reported it; zero otherwise.
    pub inst_len: u8,
    pub kind: ExitKind,
}

impl ExitEvent {
    /// The discriminant of the exit kind.
    pub fn tag(&self) -> ExitTag {
        self.kind.tag()
    }
}
