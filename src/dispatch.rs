//! Routing of classified exits to their handlers.
//!
//! [`ExitHandlers`] has one field per [`ExitKind`], so a handler set is total by
//! construction and [`ExitDispatcher::dispatch`] is a plain exhaustive match. Any handler
//! failure becomes [`Directive::AbortMachine`]; recoverable guest errors (such as a #GP for
//! an unknown MSR) are handled inside the handler and never surface as failures.

use std::sync::Arc;
use std::thread;

use log::{error, warn};

use crate::arch_vcpu::AxArchVCpu;
use crate::classify::exit_reason_name;
use crate::debug::{DebugCommand, DebugEvent, DebugStopKind, StopResolution};
use crate::emulate::InstructionEmulator;
use crate::error::{AbortCause, ExitError};
use crate::exit::{Backend, ExitEvent, ExitKind, MemoryAccess, MsrOp, PortIo, SuspendReason};
use crate::ipi::{IpiController, IpiRequest};
use crate::machine::Machine;
use crate::msr::{self, MsrOutcome};
use crate::regs::Gpr;
use crate::vcpu::{VCpuState, VirtualCpu};

/// What the run loop does after an exit has been handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Pass through a safe point, then re-enter the guest.
    Continue,
    /// Re-enter the guest immediately, unless a safe point is pending.
    Retry,
    /// Leave the run loop; the vcpu becomes suspended.
    StopCpu,
    /// Stop every vcpu of the machine.
    AbortMachine(AbortCause),
}

/// Everything a handler may touch while handling one exit.
pub struct ExitContext<'a, A: AxArchVCpu> {
    pub machine: &'a Arc<Machine<A>>,
    pub vcpu: &'a VirtualCpu<A>,
    /// The backend vcpu, locked by the run loop for the duration of the exit.
    pub arch: &'a mut A,
}

pub type HandlerResult = Result<Directive, ExitError>;

pub type PortIoHandler<A> = fn(&mut ExitContext<'_, A>, &ExitEvent, &PortIo) -> HandlerResult;
pub type MemoryAccessHandler<A> =
    fn(&mut ExitContext<'_, A>, &ExitEvent, &MemoryAccess) -> HandlerResult;
pub type MsrAccessHandler<A> = fn(&mut ExitContext<'_, A>, &ExitEvent, u32, MsrOp) -> HandlerResult;
pub type IpiHandler<A> = fn(&mut ExitContext<'_, A>, &ExitEvent, &IpiRequest) -> HandlerResult;
pub type SuspendHandler<A> = fn(&mut ExitContext<'_, A>, &ExitEvent, SuspendReason) -> HandlerResult;
pub type UnsupportedHandler<A> = fn(&mut ExitContext<'_, A>, &ExitEvent, Backend, u64) -> HandlerResult;
pub type SimpleHandler<A> = fn(&mut ExitContext<'_, A>, &ExitEvent) -> HandlerResult;

/// One handler per exit kind.
pub struct ExitHandlers<A: AxArchVCpu> {
    pub port_io: PortIoHandler<A>,
    pub memory_access: MemoryAccessHandler<A>,
    pub msr_access: MsrAccessHandler<A>,
    pub halt: SimpleHandler<A>,
    pub pause: SimpleHandler<A>,
    pub ipi: IpiHandler<A>,
    pub breakpoint: SimpleHandler<A>,
    pub single_step: SimpleHandler<A>,
    pub machine_suspended: SuspendHandler<A>,
    pub unsupported: UnsupportedHandler<A>,
}

impl<A: AxArchVCpu> ExitHandlers<A> {
    /// The monitor's own handlers.
    pub fn standard() -> Self {
        Self {
            port_io: handle_port_io::<A>,
            memory_access: handle_memory_access::<A>,
            msr_access: handle_msr_access::<A>,
            halt: handle_halt::<A>,
            pause: handle_pause::<A>,
            ipi: handle_ipi::<A>,
            breakpoint: handle_breakpoint::<A>,
            single_step: handle_single_step::<A>,
            machine_suspended: handle_machine_suspended::<A>,
            unsupported: handle_unsupported::<A>,
        }
    }
}

impl<A: AxArchVCpu> Default for ExitHandlers<A> {
    fn default() -> Self {
        Self::standard()
    }
}

/// Routes every [`ExitEvent`] to exactly one handler.
pub struct ExitDispatcher<A: AxArchVCpu> {
    handlers: ExitHandlers<A>,
}

impl<A: AxArchVCpu> ExitDispatcher<A> {
    pub fn new(handlers: ExitHandlers<A>) -> Self {
        Self { handlers }
    }

    /// Handles one exit. The vcpu's hold count is raised for the duration of the handler.
    pub fn dispatch(&self, ctx: &mut ExitContext<'_, A>, event: &ExitEvent) -> Directive {
        let _hold = ctx.vcpu.hold();
        ctx.vcpu.set_state(VCpuState::Emulating);
        let h = &self.handlers;
        let result = match &event.kind {
            ExitKind::PortIo(io) => (h.port_io)(ctx, event, io),
            ExitKind::MemoryAccess(access) => (h.memory_access)(ctx, event, access),
            ExitKind::MsrAccess { index, op } => (h.msr_access)(ctx, event, *index, *op),
            ExitKind::Halt => (h.halt)(ctx, event),
            ExitKind::Pause => (h.pause)(ctx, event),
            ExitKind::Ipi(request) => (h.ipi)(ctx, event, request),
            ExitKind::Breakpoint => (h.breakpoint)(ctx, event),
            ExitKind::SingleStep => (h.single_step)(ctx, event),
            ExitKind::MachineSuspended(reason) => (h.machine_suspended)(ctx, event, *reason),
            ExitKind::Unsupported { backend, code } => (h.unsupported)(ctx, event, *backend, *code),
        };
        result.unwrap_or_else(|error| {
            let cause = AbortCause {
                vcpu: ctx.vcpu.id(),
                kind: Some(event.tag()),
                rip: event.rip,
                error,
            };
            error!("{cause}");
            Directive::AbortMachine(cause)
        })
    }
}

const GP_VECTOR: u8 = 13;
const BP_VECTOR: u8 = 3;
/// RDMSR and WRMSR are both `0f 32`/`0f 30`.
const MSR_INSN_LEN: u8 = 2;

fn advance_rip<A: AxArchVCpu>(arch: &mut A, event: &ExitEvent, default_len: u8) {
    let len = match event.inst_len {
        0 => default_len,
        len => len,
    };
    arch.regs_mut().rip = event.rip.wrapping_add(u64::from(len));
}

fn handle_port_io<A: AxArchVCpu>(
    ctx: &mut ExitContext<'_, A>,
    event: &ExitEvent,
    io: &PortIo,
) -> HandlerResult {
    InstructionEmulator::emulate_port_io(
        ctx.arch,
        ctx.machine.devices(),
        event.rip,
        event.inst_len,
        io,
    )?;
    Ok(Directive::Continue)
}

fn handle_memory_access<A: AxArchVCpu>(
    ctx: &mut ExitContext<'_, A>,
    event: &ExitEvent,
    access: &MemoryAccess,
) -> HandlerResult {
    InstructionEmulator::emulate_mmio(ctx.arch, ctx.machine.devices(), event.rip, access)?;
    Ok(Directive::Continue)
}

fn handle_msr_access<A: AxArchVCpu>(
    ctx: &mut ExitContext<'_, A>,
    event: &ExitEvent,
    index: u32,
    op: MsrOp,
) -> HandlerResult {
    let policy = ctx.machine.config().msr_policy;
    let regs = ctx.arch.regs_mut();
    let outcome = match op {
        MsrOp::Read => msr::read(regs, index, policy),
        MsrOp::Write(value) => msr::write(regs, index, value, policy),
    };
    match outcome {
        MsrOutcome::Done(value) => {
            if op == MsrOp::Read {
                regs.write_gpr_sized(Gpr::Rax, 4, value);
                regs.write_gpr_sized(Gpr::Rdx, 4, value >> 32);
            }
            advance_rip(ctx.arch, event, MSR_INSN_LEN);
        }
        // RIP stays on the faulting instruction.
        MsrOutcome::InjectGp => ctx
            .arch
            .inject_exception(GP_VECTOR, Some(0))
            .map_err(ExitError::Backend)?,
    }
    Ok(Directive::Continue)
}

fn handle_halt<A: AxArchVCpu>(_ctx: &mut ExitContext<'_, A>, _event: &ExitEvent) -> HandlerResult {
    // Interrupts are delivered at safe points; yield once and re-enter.
    thread::yield_now();
    Ok(Directive::Continue)
}

fn handle_pause<A: AxArchVCpu>(_ctx: &mut ExitContext<'_, A>, _event: &ExitEvent) -> HandlerResult {
    Ok(Directive::Retry)
}

fn handle_ipi<A: AxArchVCpu>(
    ctx: &mut ExitContext<'_, A>,
    event: &ExitEvent,
    request: &IpiRequest,
) -> HandlerResult {
    let origin = ctx.vcpu.id();
    let targets = request.targets(origin, ctx.machine.vcpu_count());
    IpiController::handle_ipi(ctx.machine, origin, targets, request.mode)?;
    advance_rip(ctx.arch, event, MSR_INSN_LEN);
    Ok(Directive::Continue)
}

fn handle_debug_stop<A: AxArchVCpu>(
    ctx: &mut ExitContext<'_, A>,
    event: &ExitEvent,
    kind: DebugStopKind,
) -> HandlerResult {
    ctx.vcpu
        .transition_state(VCpuState::Emulating, VCpuState::Debugging)
        .map_err(ExitError::Backend)?;
    let stop = DebugEvent {
        vcpu: ctx.vcpu.id(),
        rip: event.rip,
        kind,
        regs: ctx.arch.regs().clone(),
    };
    let all_stop = ctx.machine.config().debug_all_stop_on_break;
    let resolution = ctx.machine.debug().report_stop(stop, all_stop);
    ctx.vcpu
        .transition_state(VCpuState::Debugging, VCpuState::Emulating)
        .map_err(ExitError::Backend)?;
    let step = match resolution {
        StopResolution::NoSession if kind == DebugStopKind::Breakpoint => {
            // The guest set its own breakpoint; reflect it.
            ctx.arch
                .inject_exception(BP_VECTOR, None)
                .map_err(ExitError::Backend)?;
            false
        }
        StopResolution::Command(command) => command == DebugCommand::Step,
        StopResolution::NoSession | StopResolution::Detached => false,
    };
    ctx.arch.set_single_step(step).map_err(ExitError::Backend)?;
    Ok(Directive::Continue)
}

fn handle_breakpoint<A: AxArchVCpu>(ctx: &mut ExitContext<'_, A>, event: &ExitEvent) -> HandlerResult {
    handle_debug_stop(ctx, event, DebugStopKind::Breakpoint)
}

fn handle_single_step<A: AxArchVCpu>(ctx: &mut ExitContext<'_, A>, event: &ExitEvent) -> HandlerResult {
    handle_debug_stop(ctx, event, DebugStopKind::SingleStep)
}

fn handle_machine_suspended<A: AxArchVCpu>(
    ctx: &mut ExitContext<'_, A>,
    event: &ExitEvent,
    reason: SuspendReason,
) -> HandlerResult {
    if reason == SuspendReason::TripleFault {
        error!("vcpu {}: triple fault at rip {:#x}", ctx.vcpu.id(), event.rip);
    }
    ctx.machine.suspend(reason, ctx.vcpu.id(), event.rip);
    Ok(Directive::StopCpu)
}

fn handle_unsupported<A: AxArchVCpu>(
    ctx: &mut ExitContext<'_, A>,
    event: &ExitEvent,
    backend: Backend,
    code: u64,
) -> HandlerResult {
    let name = exit_reason_name(backend, code);
    warn!(
        "vcpu {}: unhandled {backend} exit {code:#x} ({name}) at rip {:#x}",
        ctx.vcpu.id(),
        event.rip
    );
    Err(ExitError::Unhandled {
        backend: backend.name(),
        code,
        name,
    })
}
