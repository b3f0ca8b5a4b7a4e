//! The per-vcpu run loop and the thread that drives it.

use std::sync::Arc;

use log::{debug, error, trace};

use crate::arch_vcpu::AxArchVCpu;
use crate::classify::classify;
use crate::dispatch::{Directive, ExitContext};
use crate::error::{AbortCause, ExitError};
use crate::exit::RawExit;
use crate::machine::Machine;
use crate::vcpu::{SafePoint, StartupRequest, VCpuState, VirtualCpu};

/// Why [`VcpuRunLoop::run`] returned without aborting the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    /// The vcpu took an INIT; it waits for the next STARTUP.
    Init,
    /// The vcpu was stopped and will not run again.
    Stopped,
}

/// Drives one vcpu: enter the guest, classify the exit, dispatch it, repeat.
///
/// Between guest entries the loop passes through a safe point, with the arch lock released
/// and no handler in flight. That is the only place where the vcpu can be paused, take an
/// INIT or a queued interrupt, or observe a machine-wide suspend.
pub struct VcpuRunLoop;

impl VcpuRunLoop {
    /// Runs `vcpu` on the calling thread until a handler stops it, an INIT resets it, or
    /// the machine is aborted.
    pub(crate) fn run<A: AxArchVCpu>(
        machine: &Arc<Machine<A>>,
        vcpu: &VirtualCpu<A>,
    ) -> Result<RunExit, AbortCause> {
        let id = vcpu.id();
        loop {
            if machine.debug().all_stopped() {
                vcpu.set_state(VCpuState::Debugging);
                machine.debug().wait_all_stop();
            }
            let work = match vcpu.safe_point() {
                SafePoint::Stop => return Ok(RunExit::Stopped),
                SafePoint::Init => return Ok(RunExit::Init),
                SafePoint::Proceed(work) => work,
            };

            let mut arch = vcpu.lock_arch();
            for vector in work.interrupts {
                if let Err(error) = arch.inject_interrupt(vector) {
                    return Err(fail(machine, id, arch.regs().rip, ExitError::Backend(error)));
                }
            }
            let mut suspended = work.suspended;
            loop {
                let raw = match suspended.take() {
                    Some(reason) => RawExit::suspended(reason, arch.regs().rip),
                    None => match arch.run() {
                        Ok(raw) => raw,
                        Err(error) => {
                            return Err(fail(machine, id, arch.regs().rip, ExitError::Backend(error)))
                        }
                    },
                };
                let event = classify(&raw);
                vcpu.record_exit(&event);
                trace!("vcpu {id}: {:?} at rip {:#x}", event.kind, event.rip);

                let mut ctx = ExitContext {
                    machine,
                    vcpu,
                    arch: &mut *arch,
                };
                match machine.dispatcher().dispatch(&mut ctx, &event) {
                    // An all-stop is only honoured at the top of the outer loop.
                    Directive::Retry
                        if !vcpu.needs_attention() && !machine.debug().all_stopped() =>
                    {
                        vcpu.set_state(VCpuState::Running);
                    }
                    Directive::Retry | Directive::Continue => break,
                    Directive::StopCpu => return Ok(RunExit::Stopped),
                    Directive::AbortMachine(cause) => {
                        machine.abort(cause.clone());
                        return Err(cause);
                    }
                }
            }
        }
    }
}

fn fail<A: AxArchVCpu>(machine: &Machine<A>, vcpu: usize, rip: u64, error: ExitError) -> AbortCause {
    let cause = AbortCause {
        vcpu,
        kind: None,
        rip,
        error,
    };
    error!("{cause}");
    machine.abort(cause.clone());
    cause
}

/// Body of a vcpu's host thread. Runs once per vcpu for the machine's lifetime: it waits
/// for a startup, runs the guest, and goes back to waiting after an INIT.
pub(crate) fn vcpu_thread<A: AxArchVCpu>(machine: Arc<Machine<A>>, vcpu: Arc<VirtualCpu<A>>) {
    let id = vcpu.id();
    debug!("vcpu {id}: thread started");
    if let Err(error) = vcpu.lock_arch().bind() {
        fail(&machine, id, 0, ExitError::Backend(error));
    }

    while let Some(request) = vcpu.wait_for_startup() {
        if let Err(cause) = start(&machine, &vcpu, request) {
            debug!("vcpu {id}: failed to start: {cause}");
            break;
        }
        match VcpuRunLoop::run(&machine, &vcpu) {
            Ok(RunExit::Init) => {
                debug!("vcpu {id}: INIT");
                let mut arch = vcpu.lock_arch();
                if let Err(error) = arch.reset() {
                    fail(&machine, id, arch.regs().rip, ExitError::Backend(error));
                    break;
                }
            }
            Ok(RunExit::Stopped) => break,
            Err(_) => break,
        }
    }

    if let Err(error) = vcpu.lock_arch().unbind() {
        error!("vcpu {id}: failed to unbind: {error:?}");
    }
    vcpu.enter_suspended();
    debug!("vcpu {id}: thread exiting");
    machine.vcpu_thread_exited(id);
}

fn start<A: AxArchVCpu>(
    machine: &Machine<A>,
    vcpu: &VirtualCpu<A>,
    request: StartupRequest,
) -> Result<(), AbortCause> {
    let mut arch = vcpu.lock_arch();
    let result = match request {
        StartupRequest::Entry(entry) => arch.set_entry(entry),
        StartupRequest::Vector(vector) => {
            arch.regs_mut().set_startup_entry(vector);
            Ok(())
        }
        StartupRequest::Resume => Ok(()),
    };
    debug!("vcpu {}: starting at rip {:#x} ({request:?})", vcpu.id(), arch.regs().rip);
    result.map_err(|error| fail(machine, vcpu.id(), arch.regs().rip, ExitError::Backend(error)))
}
