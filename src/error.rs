use std::io;

use axerrno::AxError;
use thiserror::Error;

use crate::addr::AccessWidth;
use crate::exit::ExitTag;
use crate::regs::RegisterId;

/// Errors of the register access API.
///
/// An unknown identifier ([`RegisterError::Unsupported`]) is reported distinctly from an
/// access that raced a core which is not quiesced ([`RegisterError::Busy`]).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("no such vcpu: {0}")]
    NoSuchVcpu(usize),
    #[error("unsupported register identifier `{0}`")]
    Unsupported(String),
    #[error("register `{id}` expects a {expected} value")]
    TypeMismatch {
        id: RegisterId,
        expected: &'static str,
    },
    #[error("vcpu {0} is running; pause it before accessing its registers")]
    Busy(usize),
}

/// Why one emulated access could not be completed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmulationError {
    #[error("no device claims {space} address {addr:#x} ({width:?})")]
    NoDevice {
        space: &'static str,
        addr: u64,
        width: AccessWidth,
    },
    #[error("device at {addr:#x} failed the access: {reason}")]
    DeviceFailed { addr: u64, reason: String },
    #[error("cannot decode instruction at {rip:#x}: {reason}")]
    DecodeFailed { rip: u64, reason: String },
    #[error("unsupported access: {0}")]
    Unsupported(&'static str),
}

/// A failure while handling one exit. Always fatal to the machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExitError {
    #[error("no handler for {backend} exit {code:#x} ({name})")]
    Unhandled {
        backend: &'static str,
        code: u64,
        name: &'static str,
    },
    #[error("emulation failed: {0}")]
    Emulation(#[from] EmulationError),
    #[error("backend error: {0:?}")]
    Backend(AxError),
    #[error("vcpu {vcpu}: {reason}")]
    Vcpu { vcpu: usize, reason: String },
}

/// Diagnostic recorded when the machine is aborted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("vcpu {vcpu} aborted the machine at rip {rip:#x} (exit: {kind:?}): {error}")]
pub struct AbortCause {
    pub vcpu: usize,
    /// The exit being handled, or `None` if the backend failed outside of an exit.
    pub kind: Option<ExitTag>,
    pub rip: u64,
    pub error: ExitError,
}

/// Device-model failures outside of a single access.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device range {base:#x}+{len:#x} overlaps `{existing}`")]
    Overlap {
        base: u64,
        len: u64,
        existing: String,
    },
    #[error("device `{0}` is not registered")]
    Unknown(String),
    #[error("device `{name}` failed to save or restore its state: {reason}")]
    State { name: String, reason: String },
}

/// Failures of the snapshot sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sink rejected the snapshot: {0}")]
    Rejected(String),
}

/// Failures of a checkpoint or restore. The machine is fully resumed whenever one of these
/// is returned from [`crate::CheckpointCoordinator::checkpoint`].
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("another checkpoint is in progress")]
    Busy,
    #[error("vcpus {stuck:?} did not pause within {timeout_ms} ms")]
    PauseTimeout { stuck: Vec<usize>, timeout_ms: u64 },
    #[error("machine is not running")]
    NotRunning,
    #[error("device state: {0}")]
    Device(#[from] DeviceError),
    #[error("snapshot sink: {0}")]
    Sink(#[from] SinkError),
    #[error("snapshot of `{found}` cannot be restored into `{expected}`")]
    MachineMismatch { expected: String, found: String },
    #[error("vcpu {0} must be suspended before restore")]
    VcpuActive(usize),
    #[error("vcpu {vcpu} could not be restarted: {reason}")]
    Restart { vcpu: usize, reason: String },
    #[error("control channel closed")]
    ChannelClosed,
}

/// Machine-level failures.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("vcpu {vcpu} backend error: {error:?}")]
    Backend { vcpu: usize, error: AxError },
    #[error("no such vcpu: {0}")]
    NoSuchVcpu(usize),
    #[error("vcpu {0} is still running")]
    VcpuRunning(usize),
    #[error("failed to spawn thread `{thread}`: {source}")]
    Spawn { thread: String, source: io::Error },
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
    #[error("a debugger session is already attached")]
    DebuggerAttached,
    #[error("control channel closed")]
    ChannelClosed,
}
