use axerrno::AxResult;

use crate::addr::GuestPhysAddr;
use crate::exit::{Backend, RawExit};
use crate::regs::CpuRegisterState;

/// Backend-specific virtual CPU trait definition.
///
/// This trait is the seam between the monitor core and a hardware virtualization backend
/// (VT-x or AMD-V). A backend owns the hardware context of one virtual CPU and keeps the
/// architectural state in a [`CpuRegisterState`] that it synchronizes around every guest
/// entry, so the rest of the monitor never touches backend-specific structures.
///
/// # Threading
///
/// Each virtual CPU is driven by exactly one host thread. All methods are called with the
/// vCPU's arch lock held, either from its own run-loop thread or, while the vCPU is quiesced,
/// from the thread inspecting or checkpointing it.
pub trait AxArchVCpu: Sized + Send + 'static {
    /// Backend-specific configuration for vCPU creation.
    ///
    /// Every vCPU of a machine is created from a clone of the same configuration.
    type CreateConfig: Clone;

    /// Creates a new backend-specific vCPU instance with RESET register state.
    fn new(vcpu_id: usize, config: Self::CreateConfig) -> AxResult<Self>;

    /// The backend that produces this vCPU's exits.
    fn backend(&self) -> Backend;

    /// Sets the guest entry point where the bootstrap processor starts executing.
    fn set_entry(&mut self, entry: GuestPhysAddr) -> AxResult;

    /// Returns the vCPU to its RESET/INIT state.
    fn reset(&mut self) -> AxResult;

    /// Executes the vCPU until a VM exit occurs.
    ///
    /// This transfers control to the guest and returns once the guest triggers an exit that
    /// requires monitor intervention. The register state is synchronized before returning.
    fn run(&mut self) -> AxResult<RawExit>;

    /// Binds the backend context to the calling thread before the first guest entry.
    fn bind(&mut self) -> AxResult {
        Ok(())
    }

    /// Releases the backend context from the calling thread after the last guest exit.
    fn unbind(&mut self) -> AxResult {
        Ok(())
    }

    /// The architectural register state.
    fn regs(&self) -> &CpuRegisterState;

    /// Mutable access to the architectural register state. Changes take effect on the next
    /// guest entry.
    fn regs_mut(&mut self) -> &mut CpuRegisterState;

    /// Reads up to `buf.len()` instruction bytes at `rip` (relative to the current code
    /// segment) from guest memory and returns how many were read.
    fn fetch_instruction(&self, rip: u64, buf: &mut [u8]) -> AxResult<usize>;

    /// Injects an external interrupt on the next guest entry.
    fn inject_interrupt(&mut self, vector: u8) -> AxResult;

    /// Injects a hardware exception on the next guest entry.
    fn inject_exception(&mut self, vector: u8, error_code: Option<u32>) -> AxResult;

    /// Arms or disarms single-stepping (monitor trap flag or RFLAGS.TF).
    fn set_single_step(&mut self, enabled: bool) -> AxResult;
}
