//! Emulation of single device accesses on behalf of the guest.
//!
//! An emulated access is staged in full before anything becomes guest-visible: the device
//! access happens first, and only once it succeeded are RIP advanced and the destination
//! register written back. A failed emulation leaves the register state untouched.

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, OpKind, Register};
use log::trace;

use crate::addr::{AccessDirection, AccessWidth};
use crate::arch_vcpu::AxArchVCpu;
use crate::device::{AccessStatus, BusAddress, DeviceBus};
use crate::error::EmulationError;
use crate::exit::{InsnBytes, MemoryAccess, PortIo};
use crate::regs::{CpuMode, CpuRegisterState, Gpr};

/// Outcome of emulating one access.
pub type EmulationResult = Result<(), EmulationError>;

/// How a value read from a device is widened into its destination register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extend {
    /// Plain move: the destination is as wide as the access.
    None,
    Zero,
    Sign,
}

/// The register side of a memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessOperand {
    /// A general-purpose register, accessed with `size` bytes.
    Register { gpr: Gpr, size: u8, extend: Extend },
    /// An immediate source value (writes only).
    Immediate(u64),
}

/// A decoded memory access instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedAccess {
    pub direction: AccessDirection,
    pub width: AccessWidth,
    pub operand: AccessOperand,
    pub inst_len: u8,
}

/// Emulates MMIO and port I/O accesses against a [`DeviceBus`].
pub struct InstructionEmulator;

impl InstructionEmulator {
    /// Decodes the memory access performed by the instruction in `bytes`.
    ///
    /// Only plain data moves between a general-purpose register (or an immediate) and memory
    /// are supported: `MOV`, `MOVZX` and `MOVSX`. Anything else fails with
    /// [`EmulationError::DecodeFailed`].
    pub fn decode(bytes: &[u8], mode: CpuMode, rip: u64) -> Result<DecodedAccess, EmulationError> {
        let fail = |reason: String| EmulationError::DecodeFailed { rip, reason };
        let mut decoder = Decoder::with_ip(mode.bitness(), bytes, rip, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(fail(format!(
                "invalid or truncated instruction {:02x?} ({:?})",
                bytes,
                decoder.last_error()
            )));
        }

        let extend = match instr.code() {
            Code::Mov_rm8_r8
            | Code::Mov_rm16_r16
            | Code::Mov_rm32_r32
            | Code::Mov_rm64_r64
            | Code::Mov_r8_rm8
            | Code::Mov_r16_rm16
            | Code::Mov_r32_rm32
            | Code::Mov_r64_rm64
            | Code::Mov_AL_moffs8
            | Code::Mov_AX_moffs16
            | Code::Mov_EAX_moffs32
            | Code::Mov_RAX_moffs64
            | Code::Mov_moffs8_AL
            | Code::Mov_moffs16_AX
            | Code::Mov_moffs32_EAX
            | Code::Mov_moffs64_RAX
            | Code::Mov_rm8_imm8
            | Code::Mov_rm16_imm16
            | Code::Mov_rm32_imm32
            | Code::Mov_rm64_imm32 => Extend::None,
            Code::Movzx_r16_rm8
            | Code::Movzx_r32_rm8
            | Code::Movzx_r64_rm8
            | Code::Movzx_r16_rm16
            | Code::Movzx_r32_rm16
            | Code::Movzx_r64_rm16 => Extend::Zero,
            Code::Movsx_r16_rm8
            | Code::Movsx_r32_rm8
            | Code::Movsx_r64_rm8
            | Code::Movsx_r16_rm16
            | Code::Movsx_r32_rm16
            | Code::Movsx_r64_rm16 => Extend::Sign,
            code => return Err(fail(format!("unsupported instruction {code:?}"))),
        };

        let width = AccessWidth::from_size(instr.memory_size().size())
            .ok_or_else(|| fail(format!("unsupported access size {:?}", instr.memory_size())))?;
        let (direction, operand) = match (instr.op0_kind(), instr.op1_kind()) {
            (OpKind::Memory, OpKind::Register) => {
                (AccessDirection::Write, register_operand(&instr, 1, extend).map_err(fail)?)
            }
            (
                OpKind::Memory,
                OpKind::Immediate8
                | OpKind::Immediate16
                | OpKind::Immediate32
                | OpKind::Immediate32to64,
            ) => (
                AccessDirection::Write,
                AccessOperand::Immediate(instr.immediate(1) & width.mask()),
            ),
            (OpKind::Register, OpKind::Memory) => {
                (AccessDirection::Read, register_operand(&instr, 0, extend).map_err(fail)?)
            }
            _ => return Err(fail(format!("no memory operand in {:?}", instr.code()))),
        };

        Ok(DecodedAccess {
            direction,
            width,
            operand,
            inst_len: instr.len() as u8,
        })
    }

    /// Emulates the MMIO access that caused `access`.
    ///
    /// The backend's decode is used when it provided one; otherwise the instruction is
    /// decoded in software from the decode-assist bytes, or fetched from guest memory.
    pub fn emulate_mmio<A: AxArchVCpu>(
        arch: &mut A,
        devices: &dyn DeviceBus,
        rip: u64,
        access: &MemoryAccess,
    ) -> EmulationResult {
        let decoded = match access.decoded {
            Some(decoded) => decoded,
            None => {
                let insn = if access.insn.is_empty() {
                    fetch(arch, rip)?
                } else {
                    access.insn
                };
                Self::decode(insn.as_slice(), arch.regs().cpu_mode(), rip)?
            }
        };
        trace!("mmio {decoded:?} at {:?}", access.gpa);
        apply(
            arch.regs_mut(),
            devices,
            BusAddress::Mmio(access.gpa),
            rip,
            &decoded,
        )
    }

    /// Emulates an `IN` or `OUT`. The accumulator is the register operand; `IN` writes follow
    /// the usual sub-register rules (a 32-bit `IN` zero-extends into RAX).
    ///
    /// String and REP forms are not emulated.
    pub fn emulate_port_io<A: AxArchVCpu>(
        arch: &mut A,
        devices: &dyn DeviceBus,
        rip: u64,
        inst_len: u8,
        io: &PortIo,
    ) -> EmulationResult {
        if io.string || io.rep {
            return Err(EmulationError::Unsupported("string or REP port I/O"));
        }
        let inst_len = match inst_len {
            0 => instruction_length(arch, rip)?,
            len => len,
        };
        let decoded = DecodedAccess {
            direction: io.direction,
            width: io.width,
            operand: AccessOperand::Register {
                gpr: Gpr::Rax,
                size: io.width.size() as u8,
                extend: Extend::None,
            },
            inst_len,
        };
        apply(
            arch.regs_mut(),
            devices,
            BusAddress::Pio(io.port),
            rip,
            &decoded,
        )
    }
}

/// Length of the instruction at `rip`, decoded from guest memory.
pub(crate) fn instruction_length<A: AxArchVCpu>(arch: &A, rip: u64) -> Result<u8, EmulationError> {
    let insn = fetch(arch, rip)?;
    let mut decoder = Decoder::with_ip(
        arch.regs().cpu_mode().bitness(),
        insn.as_slice(),
        rip,
        DecoderOptions::NONE,
    );
    let instr = decoder.decode();
    if instr.is_invalid() {
        return Err(EmulationError::DecodeFailed {
            rip,
            reason: format!("invalid instruction {:02x?}", insn.as_slice()),
        });
    }
    Ok(instr.len() as u8)
}

fn fetch<A: AxArchVCpu>(arch: &A, rip: u64) -> Result<InsnBytes, EmulationError> {
    let mut buf = [0; InsnBytes::MAX_LEN];
    let len = arch
        .fetch_instruction(rip, &mut buf)
        .map_err(|err| EmulationError::DecodeFailed {
            rip,
            reason: format!("instruction fetch failed: {err:?}"),
        })?;
    Ok(InsnBytes::from_slice(&buf[..len.min(buf.len())]))
}

fn register_operand(instr: &Instruction, operand: u32, extend: Extend) -> Result<AccessOperand, String> {
    let reg = instr.op_register(operand);
    // AH, CH, DH and BH
    if reg.size() == 1 && reg >= Register::AH && reg < Register::SPL {
        return Err(format!("high byte register {reg:?}"));
    }
    let gpr = match reg.full_register() {
        Register::RAX => Gpr::Rax,
        Register::RCX => Gpr::Rcx,
        Register::RDX => Gpr::Rdx,
        Register::RBX => Gpr::Rbx,
        Register::RSP => Gpr::Rsp,
        Register::RBP => Gpr::Rbp,
        Register::RSI => Gpr::Rsi,
        Register::RDI => Gpr::Rdi,
        Register::R8 => Gpr::R8,
        Register::R9 => Gpr::R9,
        Register::R10 => Gpr::R10,
        Register::R11 => Gpr::R11,
        Register::R12 => Gpr::R12,
        Register::R13 => Gpr::R13,
        Register::R14 => Gpr::R14,
        Register::R15 => Gpr::R15,
        other => return Err(format!("not a general-purpose register: {other:?}")),
    };
    Ok(AccessOperand::Register {
        gpr,
        size: reg.size() as u8,
        extend,
    })
}

fn apply(
    regs: &mut CpuRegisterState,
    devices: &dyn DeviceBus,
    addr: BusAddress,
    rip: u64,
    decoded: &DecodedAccess,
) -> EmulationResult {
    let width = decoded.width;
    let mut data = [0u8; 8];
    let bytes = &mut data[..width.size()];

    if decoded.direction == AccessDirection::Write {
        let value = match decoded.operand {
            AccessOperand::Register { gpr, .. } => regs.gpr(gpr),
            AccessOperand::Immediate(value) => value,
        };
        bytes.copy_from_slice(&value.to_le_bytes()[..width.size()]);
    }

    match devices.access(addr, width, decoded.direction, bytes) {
        AccessStatus::Ok => {}
        AccessStatus::NoDevice => {
            return Err(EmulationError::NoDevice {
                space: addr.space(),
                addr: addr.raw(),
                width,
            })
        }
        AccessStatus::Failed(reason) => {
            return Err(EmulationError::DeviceFailed {
                addr: addr.raw(),
                reason,
            })
        }
    }

    regs.rip = rip.wrapping_add(u64::from(decoded.inst_len));
    if decoded.direction == AccessDirection::Read {
        if let AccessOperand::Register { gpr, size, extend } = decoded.operand {
            let value = u64::from_le_bytes(data);
            let value = match extend {
                Extend::None | Extend::Zero => value,
                Extend::Sign => {
                    let shift = 64 - width.size() * 8;
                    (((value << shift) as i64) >> shift) as u64
                }
            };
            regs.write_gpr_sized(gpr, usize::from(size), value);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode64(bytes: &[u8]) -> Result<DecodedAccess, EmulationError> {
        InstructionEmulator::decode(bytes, CpuMode::Long, 0x1000)
    }

    #[test]
    fn decodes_register_moves() {
        // mov [rdi], eax
        let store = decode64(&[0x89, 0x07]).unwrap();
        assert_eq!(store.direction, AccessDirection::Write);
        assert_eq!(store.width, AccessWidth::Dword);
        assert_eq!(
            store.operand,
            AccessOperand::Register {
                gpr: Gpr::Rax,
                size: 4,
                extend: Extend::None
            }
        );
        assert_eq!(store.inst_len, 2);

        // mov r9, [rax]
        let load = decode64(&[0x4c, 0x8b, 0x08]).unwrap();
        assert_eq!(load.direction, AccessDirection::Read);
        assert_eq!(load.width, AccessWidth::Qword);
        assert_eq!(
            load.operand,
            AccessOperand::Register {
                gpr: Gpr::R9,
                size: 8,
                extend: Extend::None
            }
        );
    }

    #[test]
    fn decodes_immediates_and_extensions() {
        // mov dword [rax], 0x12345678
        let store = decode64(&[0xc7, 0x00, 0x78, 0x56, 0x34, 0x12]).unwrap();
        assert_eq!(store.operand, AccessOperand::Immediate(0x1234_5678));
        assert_eq!(store.inst_len, 6);

        // movzx ecx, byte [rax]
        let zx = decode64(&[0x0f, 0xb6, 0x08]).unwrap();
        assert_eq!(zx.width, AccessWidth::Byte);
        assert_eq!(
            zx.operand,
            AccessOperand::Register {
                gpr: Gpr::Rcx,
                size: 4,
                extend: Extend::Zero
            }
        );

        // movsx rdx, word [rax]
        let sx = decode64(&[0x48, 0x0f, 0xbf, 0x10]).unwrap();
        assert_eq!(sx.width, AccessWidth::Word);
        assert!(matches!(sx.operand, AccessOperand::Register { extend: Extend::Sign, .. }));
    }

    #[test]
    fn decode_failures() {
        // add [rax], eax
        assert!(matches!(
            decode64(&[0x01, 0x00]),
            Err(EmulationError::DecodeFailed { .. })
        ));
        // mov ah, [rax]
        assert!(decode64(&[0x8a, 0x20]).is_err());
        // truncated
        assert!(decode64(&[0x8b]).is_err());
        assert!(decode64(&[]).is_err());
    }

    #[test]
    fn decode_is_deterministic() {
        let bytes = [0x48, 0x0f, 0xbe, 0x0c, 0x24];
        assert_eq!(decode64(&bytes), decode64(&bytes));
    }

    #[test]
    fn real_mode_operand_size() {
        // mov [bx], ax in 16-bit code
        let store = InstructionEmulator::decode(&[0x89, 0x07], CpuMode::Real, 0x7c00).unwrap();
        assert_eq!(store.width, AccessWidth::Word);
    }
}
