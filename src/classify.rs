//! Classification of raw backend exits into [`ExitEvent`]s.
//!
//! Classification is a pure function of the [`RawExit`]: it never blocks and never touches
//! vCPU state. Exit codes outside the closed set become [`ExitKind::Unsupported`] and keep
//! their raw code; the name tables at the bottom of this module exist only for diagnostics.

use crate::addr::{AccessDirection, AccessWidth, GuestPhysAddr};
use crate::exit::{
    Backend, ExitEvent, ExitKind, MemoryAccess, MsrOp, PortIo, RawExit, SuspendReason,
};
use crate::ipi::IpiRequest;
use crate::msr::IA32_X2APIC_ICR;

/// Monitor-synthesized exit: the machine has been suspended. `info1` holds the
/// [`SuspendReason`].
pub const MONITOR_EXIT_SUSPENDED: u64 = 1;

pub const VMX_EXIT_EXCEPTION_NMI: u64 = 0;
pub const VMX_EXIT_TRIPLE_FAULT: u64 = 2;
pub const VMX_EXIT_HLT: u64 = 12;
pub const VMX_EXIT_IO_INSTRUCTION: u64 = 30;
pub const VMX_EXIT_RDMSR: u64 = 31;
pub const VMX_EXIT_WRMSR: u64 = 32;
pub const VMX_EXIT_MONITOR_TRAP_FLAG: u64 = 37;
pub const VMX_EXIT_PAUSE: u64 = 40;
pub const VMX_EXIT_EPT_VIOLATION: u64 = 48;

pub const SVM_EXIT_EXCP_DB: u64 = 0x41;
pub const SVM_EXIT_EXCP_BP: u64 = 0x43;
pub const SVM_EXIT_PAUSE: u64 = 0x77;
pub const SVM_EXIT_HLT: u64 = 0x78;
pub const SVM_EXIT_IOIO: u64 = 0x7b;
pub const SVM_EXIT_MSR: u64 = 0x7c;
pub const SVM_EXIT_SHUTDOWN: u64 = 0x7f;
pub const SVM_EXIT_NPF: u64 = 0x400;

const DB_VECTOR: u64 = 1;
const BP_VECTOR: u64 = 3;
const VMX_INTR_INFO_VALID: u64 = 1 << 31;

/// Classifies one raw exit.
pub fn classify(raw: &RawExit) -> ExitEvent {
    let kind = match raw.backend {
        Backend::Vmx => classify_vmx(raw),
        Backend::Svm => classify_svm(raw),
        Backend::Monitor => classify_monitor(raw),
    };
    let kind = kind.unwrap_or(ExitKind::Unsupported {
        backend: raw.backend,
        code: raw.code,
    });
    let inst_len = match (raw.backend, raw.code) {
        // EXITINFO2 holds the RIP of the next instruction for IOIO intercepts.
        (Backend::Svm, SVM_EXIT_IOIO) if raw.inst_len == 0 => {
            raw.info2.wrapping_sub(raw.rip).min(15) as u8
        }
        _ => raw.inst_len,
    };
    ExitEvent {
        rip: raw.rip,
        inst_len,
        kind,
    }
}

fn classify_vmx(raw: &RawExit) -> Option<ExitKind> {
    let kind = match raw.code {
        VMX_EXIT_EXCEPTION_NMI => {
            let info = raw.info2;
            if info & VMX_INTR_INFO_VALID == 0 {
                return None;
            }
            match info & 0xff {
                BP_VECTOR => ExitKind::Breakpoint,
                DB_VECTOR => ExitKind::SingleStep,
                _ => return None,
            }
        }
        VMX_EXIT_TRIPLE_FAULT => ExitKind::MachineSuspended(SuspendReason::TripleFault),
        VMX_EXIT_HLT => ExitKind::Halt,
        VMX_EXIT_PAUSE => ExitKind::Pause,
        VMX_EXIT_MONITOR_TRAP_FLAG => ExitKind::SingleStep,
        VMX_EXIT_IO_INSTRUCTION => {
            // Exit qualification: size-1 in bits 0..=2, IN in bit 3, string in bit 4, REP in
            // bit 5, port in bits 16..=31.
            let q = raw.info1;
            let width = AccessWidth::from_size((q & 0x7) as usize + 1)?;
            ExitKind::PortIo(PortIo {
                port: (q >> 16) as u16,
                width,
                direction: direction(q & (1 << 3) != 0),
                string: q & (1 << 4) != 0,
                rep: q & (1 << 5) != 0,
            })
        }
        VMX_EXIT_RDMSR => msr_exit(raw, false)?,
        VMX_EXIT_WRMSR => msr_exit(raw, true)?,
        VMX_EXIT_EPT_VIOLATION => memory_exit(raw, raw.guest_phys),
        _ => return None,
    };
    Some(kind)
}

fn classify_svm(raw: &RawExit) -> Option<ExitKind> {
    let kind = match raw.code {
        SVM_EXIT_EXCP_BP => ExitKind::Breakpoint,
        SVM_EXIT_EXCP_DB => ExitKind::SingleStep,
        SVM_EXIT_SHUTDOWN => ExitKind::MachineSuspended(SuspendReason::TripleFault),
        SVM_EXIT_HLT => ExitKind::Halt,
        SVM_EXIT_PAUSE => ExitKind::Pause,
        SVM_EXIT_IOIO => {
            // EXITINFO1: IN in bit 0, STR in bit 2, REP in bit 3, SZ8/SZ16/SZ32 in bits 4..=6,
            // port in bits 16..=31.
            let info = raw.info1;
            let width = match (info >> 4) & 0x7 {
                0b001 => AccessWidth::Byte,
                0b010 => AccessWidth::Word,
                0b100 => AccessWidth::Dword,
                _ => return None,
            };
            ExitKind::PortIo(PortIo {
                port: (info >> 16) as u16,
                width,
                direction: direction(info & 1 != 0),
                string: info & (1 << 2) != 0,
                rep: info & (1 << 3) != 0,
            })
        }
        SVM_EXIT_MSR => match raw.info1 {
            0 => msr_exit(raw, false)?,
            1 => msr_exit(raw, true)?,
            _ => return None,
        },
        // EXITINFO2 holds the faulting guest-physical address.
        SVM_EXIT_NPF => memory_exit(raw, raw.info2),
        _ => return None,
    };
    Some(kind)
}

fn classify_monitor(raw: &RawExit) -> Option<ExitKind> {
    match raw.code {
        MONITOR_EXIT_SUSPENDED => {
            SuspendReason::from_code(raw.info1).map(ExitKind::MachineSuspended)
        }
        _ => None,
    }
}

fn direction(is_in: bool) -> AccessDirection {
    if is_in {
        AccessDirection::Read
    } else {
        AccessDirection::Write
    }
}

fn msr_exit(raw: &RawExit, write: bool) -> Option<ExitKind> {
    let index = raw.gprs.rcx as u32;
    if !write {
        return Some(ExitKind::MsrAccess {
            index,
            op: MsrOp::Read,
        });
    }
    let value = (raw.gprs.rdx << 32) | (raw.gprs.rax & 0xffff_ffff);
    if index == IA32_X2APIC_ICR {
        return Some(ExitKind::Ipi(IpiRequest::decode_icr(value)));
    }
    Some(ExitKind::MsrAccess {
        index,
        op: MsrOp::Write(value),
    })
}

fn memory_exit(raw: &RawExit, gpa: u64) -> ExitKind {
    ExitKind::MemoryAccess(MemoryAccess {
        gpa: GuestPhysAddr::from_usize(gpa as usize),
        decoded: raw.decoded,
        insn: raw.insn_bytes,
    })
}

/// Basic VMX exit reasons, indexed by code.
static VMX_EXIT_NAMES: [&str; 65] = [
    "EXCEPTION_NMI",
    "EXTERNAL_INTERRUPT",
    "TRIPLE_FAULT",
    "INIT_SIGNAL",
    "SIPI",
    "IO_SMI",
    "OTHER_SMI",
    "INTERRUPT_WINDOW",
    "NMI_WINDOW",
    "TASK_SWITCH",
    "CPUID",
    "GETSEC",
    "HLT",
    "INVD",
    "INVLPG",
    "RDPMC",
    "RDTSC",
    "RSM",
    "VMCALL",
    "VMCLEAR",
    "VMLAUNCH",
    "VMPTRLD",
    "VMPTRST",
    "VMREAD",
    "VMRESUME",
    "VMWRITE",
    "VMXOFF",
    "VMXON",
    "CR_ACCESS",
    "DR_ACCESS",
    "IO_INSTRUCTION",
    "RDMSR",
    "WRMSR",
    "ENTRY_FAIL_GUEST_STATE",
    "ENTRY_FAIL_MSR_LOADING",
    "RESERVED_35",
    "MWAIT",
    "MONITOR_TRAP_FLAG",
    "RESERVED_38",
    "MONITOR",
    "PAUSE",
    "ENTRY_FAIL_MACHINE_CHECK",
    "RESERVED_42",
    "TPR_BELOW_THRESHOLD",
    "APIC_ACCESS",
    "VIRTUALIZED_EOI",
    "GDTR_IDTR_ACCESS",
    "LDTR_TR_ACCESS",
    "EPT_VIOLATION",
    "EPT_MISCONFIG",
    "INVEPT",
    "RDTSCP",
    "PREEMPTION_TIMER",
    "INVVPID",
    "WBINVD",
    "XSETBV",
    "APIC_WRITE",
    "RDRAND",
    "INVPCID",
    "VMFUNC",
    "ENCLS",
    "RDSEED",
    "PML_FULL",
    "XSAVES",
    "XRSTORS",
];

fn svm_exit_name(code: u64) -> &'static str {
    match code {
        0x00..=0x0f => "CR_READ",
        0x10..=0x1f => "CR_WRITE",
        0x20..=0x2f => "DR_READ",
        0x30..=0x3f => "DR_WRITE",
        0x41 => "EXCP_DB",
        0x43 => "EXCP_BP",
        0x40..=0x5f => "EXCEPTION",
        0x60 => "INTR",
        0x61 => "NMI",
        0x62 => "SMI",
        0x63 => "INIT",
        0x64 => "VINTR",
        0x65 => "CR0_SEL_WRITE",
        0x66..=0x6d => "DESCRIPTOR_TABLE_ACCESS",
        0x6e => "RDTSC",
        0x6f => "RDPMC",
        0x70 => "PUSHF",
        0x71 => "POPF",
        0x72 => "CPUID",
        0x73 => "RSM",
        0x74 => "IRET",
        0x75 => "SWINT",
        0x76 => "INVD",
        0x77 => "PAUSE",
        0x78 => "HLT",
        0x79 => "INVLPG",
        0x7a => "INVLPGA",
        0x7b => "IOIO",
        0x7c => "MSR",
        0x7d => "TASK_SWITCH",
        0x7e => "FERR_FREEZE",
        0x7f => "SHUTDOWN",
        0x80 => "VMRUN",
        0x81 => "VMMCALL",
        0x82 => "VMLOAD",
        0x83 => "VMSAVE",
        0x84 => "STGI",
        0x85 => "CLGI",
        0x86 => "SKINIT",
        0x87 => "RDTSCP",
        0x88 => "ICEBP",
        0x89 => "WBINVD",
        0x8a => "MONITOR",
        0x8b => "MWAIT",
        0x8c => "MWAIT_CONDITIONAL",
        0x8d => "XSETBV",
        0x8e => "RDPRU",
        0x400 => "NPF",
        0x401 => "AVIC_INCOMPLETE_IPI",
        0x402 => "AVIC_NOACCEL",
        0x403 => "VMGEXIT",
        _ => "UNKNOWN",
    }
}

/// The human-readable name of a raw exit code. Used for logging only.
pub fn exit_reason_name(backend: Backend, code: u64) -> &'static str {
    match backend {
        Backend::Vmx => VMX_EXIT_NAMES
            .get(code as usize)
            .copied()
            .unwrap_or("UNKNOWN"),
        Backend::Svm => svm_exit_name(code),
        Backend::Monitor => match code {
            MONITOR_EXIT_SUSPENDED => "SUSPENDED",
            _ => "UNKNOWN",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::{ExitGprs, ExitTag, InsnBytes};
    use crate::ipi::{IpiDestination, IpiMode};

    fn vmx(code: u64) -> RawExit {
        RawExit::new(Backend::Vmx, code, 0x1000)
    }

    fn svm(code: u64) -> RawExit {
        RawExit::new(Backend::Svm, code, 0x1000)
    }

    #[test]
    fn vmx_port_io_qualification() {
        let mut raw = vmx(VMX_EXIT_IO_INSTRUCTION);
        raw.inst_len = 1;
        // 2-byte IN from 0x3f8
        raw.info1 = (0x3f8 << 16) | (1 << 3) | 1;
        let event = classify(&raw);
        assert_eq!(
            event.kind,
            ExitKind::PortIo(PortIo {
                port: 0x3f8,
                width: AccessWidth::Word,
                direction: AccessDirection::Read,
                string: false,
                rep: false,
            })
        );
        assert_eq!(event.inst_len, 1);
    }

    #[test]
    fn svm_port_io_uses_next_rip() {
        let mut raw = svm(SVM_EXIT_IOIO);
        // OUTSB with REP to port 0x80
        raw.info1 = (0x80 << 16) | (1 << 4) | (1 << 3) | (1 << 2);
        raw.info2 = raw.rip + 2;
        let event = classify(&raw);
        assert_eq!(event.inst_len, 2);
        let ExitKind::PortIo(io) = event.kind else {
            panic!("expected port I/O, got {:?}", event.kind);
        };
        assert_eq!(io.port, 0x80);
        assert_eq!(io.width, AccessWidth::Byte);
        assert_eq!(io.direction, AccessDirection::Write);
        assert!(io.string && io.rep);
    }

    #[test]
    fn malformed_io_width_is_unsupported() {
        let mut raw = svm(SVM_EXIT_IOIO);
        raw.info1 = 0b011 << 4;
        assert_eq!(
            classify(&raw).kind,
            ExitKind::Unsupported {
                backend: Backend::Svm,
                code: SVM_EXIT_IOIO
            }
        );
    }

    #[test]
    fn msr_exits_on_both_backends() {
        let gprs = ExitGprs {
            rax: 0xdead_beef_1234_5678,
            rcx: 0xc000_0082,
            rdx: 0xffff_8000,
        };
        let mut raw = vmx(VMX_EXIT_WRMSR);
        raw.gprs = gprs;
        assert_eq!(
            classify(&raw).kind,
            ExitKind::MsrAccess {
                index: 0xc000_0082,
                op: MsrOp::Write(0xffff_8000_1234_5678),
            }
        );

        let mut raw = svm(SVM_EXIT_MSR);
        raw.gprs = gprs;
        raw.info1 = 0;
        assert_eq!(
            classify(&raw).kind,
            ExitKind::MsrAccess {
                index: 0xc000_0082,
                op: MsrOp::Read,
            }
        );
    }

    #[test]
    fn icr_write_is_an_ipi() {
        let mut raw = vmx(VMX_EXIT_WRMSR);
        raw.gprs = ExitGprs {
            // STARTUP, vector 0x9a, destination APIC id 2
            rax: (6 << 8) | 0x9a,
            rcx: IA32_X2APIC_ICR as u64,
            rdx: 2,
        };
        let ExitKind::Ipi(ipi) = classify(&raw).kind else {
            panic!("expected IPI");
        };
        assert_eq!(ipi.mode, IpiMode::Startup(0x9a));
        assert_eq!(ipi.destination, IpiDestination::Physical(2));

        // INIT level de-assert, as sent between INIT and STARTUP during AP bring-up.
        raw.gprs.rax = (5 << 8) | (1 << 15);
        raw.gprs.rdx = 1;
        let ExitKind::Ipi(ipi) = classify(&raw).kind else {
            panic!("expected IPI");
        };
        assert_eq!(ipi.mode, IpiMode::Ignored);
    }

    #[test]
    fn breakpoints_and_single_steps() {
        let mut raw = vmx(VMX_EXIT_EXCEPTION_NMI);
        raw.info2 = VMX_INTR_INFO_VALID | (6 << 8) | BP_VECTOR;
        assert_eq!(classify(&raw).kind, ExitKind::Breakpoint);
        assert_eq!(classify(&vmx(VMX_EXIT_MONITOR_TRAP_FLAG)).kind, ExitKind::SingleStep);
        assert_eq!(classify(&svm(SVM_EXIT_EXCP_BP)).kind, ExitKind::Breakpoint);
        assert_eq!(classify(&svm(SVM_EXIT_EXCP_DB)).kind, ExitKind::SingleStep);

        // A #PF intercept is outside the closed set.
        raw.info2 = VMX_INTR_INFO_VALID | 14;
        assert_eq!(classify(&raw).tag(), ExitTag::Unsupported);
    }

    #[test]
    fn nested_page_faults_carry_the_gpa() {
        let mut raw = svm(SVM_EXIT_NPF);
        raw.info2 = 0xfee0_0030;
        raw.insn_bytes = InsnBytes::from_slice(&[0x8b, 0x00]);
        let ExitKind::MemoryAccess(access) = classify(&raw).kind else {
            panic!("expected memory access");
        };
        assert_eq!(access.gpa.as_usize(), 0xfee0_0030);
        assert_eq!(access.insn.as_slice(), &[0x8b, 0x00]);

        let mut raw = vmx(VMX_EXIT_EPT_VIOLATION);
        raw.guest_phys = 0xd000_0000;
        let ExitKind::MemoryAccess(access) = classify(&raw).kind else {
            panic!("expected memory access");
        };
        assert_eq!(access.gpa.as_usize(), 0xd000_0000);
        assert!(access.insn.is_empty());
    }

    #[test]
    fn shutdown_and_suspend() {
        assert_eq!(
            classify(&vmx(VMX_EXIT_TRIPLE_FAULT)).kind,
            ExitKind::MachineSuspended(SuspendReason::TripleFault)
        );
        assert_eq!(
            classify(&svm(SVM_EXIT_SHUTDOWN)).kind,
            ExitKind::MachineSuspended(SuspendReason::TripleFault)
        );
        assert_eq!(
            classify(&RawExit::suspended(SuspendReason::PowerOff, 0)).kind,
            ExitKind::MachineSuspended(SuspendReason::PowerOff)
        );
    }

    #[test]
    fn unknown_codes_keep_their_raw_value() {
        let event = classify(&vmx(10));
        assert_eq!(
            event.kind,
            ExitKind::Unsupported {
                backend: Backend::Vmx,
                code: 10
            }
        );
        assert_eq!(exit_reason_name(Backend::Vmx, 10), "CPUID");
        assert_eq!(exit_reason_name(Backend::Vmx, 1000), "UNKNOWN");
        assert_eq!(exit_reason_name(Backend::Svm, 0x72), "CPUID");
        assert_eq!(exit_reason_name(Backend::Svm, 0x43), "EXCP_BP");
    }
}
