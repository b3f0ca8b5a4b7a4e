// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxVmon - the monitor core of a user-space hypervisor.
//!
//! This crate drives a hardware-virtualized guest machine. Every virtual CPU runs on its own
//! host thread; the hardware virtualization backend (VT-x or AMD-V) is reached through the
//! `AxArchVCpu` trait, while this crate classifies the exits it reports, dispatches them to
//! handlers and coordinates the vCPUs of one machine.
//!
//! # Features
//!
//! - Per-vCPU run loop with a well-defined safe point between guest entries
//! - Closed classification of VMX and SVM exits and a total handler table
//! - Software emulation of trapped MMIO and port I/O against a device bus
//! - Emulated MSR table with explicit strict/lenient policies for unknown MSRs
//! - INIT/STARTUP/fixed IPIs between vCPUs
//! - Breakpoint and single-step routing to an attached debugger
//! - Pause-all checkpoints with bounded waits, snapshot sinks and restore
//! - Typed register access for inspection tools

mod addr; // Guest address and access-width types
mod arch_vcpu; // Backend-specific vCPU trait definition
mod checkpoint; // Pause-all snapshot and restore
mod classify; // Raw exit classification and diagnostic exit names
mod control; // Out-of-process control channel
mod debug; // Debugger session handshake
mod device; // Device bus and range-mapped device manager
mod dispatch; // Exit handlers and directives
mod emulate; // MMIO and port I/O emulation
mod error; // Error types
mod exit; // Raw and classified exit types
mod ipi; // Inter-processor interrupts
mod latch; // Pause rendezvous
mod machine; // Machine lifecycle
pub mod msr; // Emulated model-specific registers
mod regs; // Architectural register state
mod run; // Per-vCPU run loop
mod vcpu; // VirtualCpu lifecycle state machine

pub use addr::{AccessDirection, AccessWidth, GuestPhysAddr, Port};
pub use arch_vcpu::AxArchVCpu;
pub use checkpoint::{
    CheckpointCoordinator, CheckpointOutcome, CheckpointRequest, FileSink, MachineSnapshot,
    SnapshotSink, SnapshotSource, VcpuSnapshot, SNAPSHOT_VERSION,
};
pub use classify::{classify, exit_reason_name};
pub use control::{ControlHandle, ControlRequest, ControlServer};
pub use debug::{DebugBridge, DebugCommand, DebugEvent, DebugSession, DebugStopKind};
pub use device::{AccessStatus, BusAddress, BusDevice, DeviceBus, DeviceManager, DeviceSnapshot};
pub use dispatch::{Directive, ExitContext, ExitDispatcher, ExitHandlers, HandlerResult};
pub use emulate::{AccessOperand, DecodedAccess, EmulationResult, Extend, InstructionEmulator};
pub use error::*;
pub use exit::*;
pub use ipi::{CpuSet, IpiController, IpiDestination, IpiMode, IpiRequest};
pub use latch::PauseLatch;
pub use machine::{Machine, MachineConfig, MachineExit, TeardownPolicy};
pub use msr::{MsrOutcome, MsrPolicy};
pub use regs::*;
pub use run::{RunExit, VcpuRunLoop};
pub use vcpu::{ExitStats, HoldGuard, LastExit, VCpuState, VirtualCpu};
