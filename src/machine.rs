//! The virtual machine: its vcpus, device bus and machine-wide lifecycle.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::addr::GuestPhysAddr;
use crate::arch_vcpu::AxArchVCpu;
use crate::debug::{DebugBridge, DebugSession};
use crate::device::DeviceBus;
use crate::dispatch::{ExitDispatcher, ExitHandlers};
use crate::error::{AbortCause, MachineError, RegisterError};
use crate::exit::SuspendReason;
use crate::ipi::CpuSet;
use crate::msr::MsrPolicy;
use crate::regs::{RegisterAccess, RegisterId, RegisterValue};
use crate::run;
use crate::vcpu::{StartupDelivery, StartupRequest, VCpuState, VirtualCpu};

fn default_pause_timeout_ms() -> u64 {
    5000
}

/// Static configuration of a machine.
///
/// `msr_policy` has no default: a configuration that does not choose how unknown MSRs are
/// handled fails to deserialize.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,
    pub vcpu_count: usize,
    pub msr_policy: MsrPolicy,
    /// Bound on how long a checkpoint waits for every vcpu to pause.
    #[serde(default = "default_pause_timeout_ms")]
    pub pause_timeout_ms: u64,
    /// Number of guest memory regions reserved by the embedder.
    #[serde(default)]
    pub reserved_regions: usize,
    /// Stop every vcpu while one of them is stopped at a breakpoint.
    #[serde(default)]
    pub debug_all_stop_on_break: bool,
}

impl MachineConfig {
    pub fn new(name: impl Into<String>, vcpu_count: usize, msr_policy: MsrPolicy) -> Self {
        Self {
            name: name.into(),
            vcpu_count,
            msr_policy,
            pause_timeout_ms: default_pause_timeout_ms(),
            reserved_regions: 0,
            debug_all_stop_on_break: false,
        }
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), MachineError> {
        if self.name.is_empty() {
            return Err(MachineError::Config("machine name is empty".into()));
        }
        if self.vcpu_count == 0 || self.vcpu_count > CpuSet::MAX_CPUS {
            return Err(MachineError::Config(format!(
                "vcpu_count must be within 1..={}, got {}",
                CpuSet::MAX_CPUS,
                self.vcpu_count
            )));
        }
        if self.pause_timeout_ms == 0 {
            return Err(MachineError::Config("pause_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Why a machine stopped running.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MachineExit {
    Reset,
    PowerOff,
    Halted,
    TripleFault { vcpu: usize, rip: u64 },
    Aborted(AbortCause),
    /// Suspended to a snapshot.
    Checkpointed,
    /// Stopped by the embedder.
    Stopped,
}

/// What the embedder does with the process once a machine has exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeardownPolicy {
    /// Open the machine again from scratch.
    Restart,
    Terminate,
    /// Terminate after reporting the exit as a failure.
    TerminateWithDiagnostic,
}

impl MachineExit {
    fn from_suspend(reason: SuspendReason, vcpu: usize, rip: u64) -> Self {
        match reason {
            SuspendReason::Reset => Self::Reset,
            SuspendReason::PowerOff => Self::PowerOff,
            SuspendReason::Halt => Self::Halted,
            SuspendReason::TripleFault => Self::TripleFault { vcpu, rip },
        }
    }

    pub fn policy(&self) -> TeardownPolicy {
        match self {
            Self::Reset => TeardownPolicy::Restart,
            Self::TripleFault { .. } | Self::Aborted(_) => TeardownPolicy::TerminateWithDiagnostic,
            Self::PowerOff | Self::Halted | Self::Checkpointed | Self::Stopped => {
                TeardownPolicy::Terminate
            }
        }
    }

    /// Process exit status for this exit.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Reset | Self::Checkpointed | Self::Stopped => 0,
            Self::PowerOff => 1,
            Self::Halted => 2,
            Self::TripleFault { .. } => 3,
            Self::Aborted(_) => 4,
        }
    }
}

struct Lifecycle {
    exit: Option<MachineExit>,
    suspended: Option<SuspendReason>,
    live_threads: usize,
}

/// A virtual machine. Owns its vcpus exclusively.
pub struct Machine<A: AxArchVCpu> {
    config: MachineConfig,
    vcpus: Vec<Arc<VirtualCpu<A>>>,
    devices: Arc<dyn DeviceBus>,
    dispatcher: ExitDispatcher<A>,
    debug: Arc<DebugBridge>,
    checkpoint_lock: Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    lifecycle_cond: Condvar,
}

impl<A: AxArchVCpu> Machine<A> {
    /// Opens a machine with the standard exit handlers. Every vcpu starts suspended.
    pub fn open(
        config: MachineConfig,
        devices: Arc<dyn DeviceBus>,
        arch_config: A::CreateConfig,
    ) -> Result<Arc<Self>, MachineError> {
        Self::with_handlers(config, devices, arch_config, ExitHandlers::standard())
    }

    /// Opens a machine with a custom handler set.
    pub fn with_handlers(
        config: MachineConfig,
        devices: Arc<dyn DeviceBus>,
        arch_config: A::CreateConfig,
        handlers: ExitHandlers<A>,
    ) -> Result<Arc<Self>, MachineError> {
        config.validate()?;
        let vcpus = (0..config.vcpu_count)
            .map(|id| {
                VirtualCpu::new(id, arch_config.clone())
                    .map(Arc::new)
                    .map_err(|error| MachineError::Backend { vcpu: id, error })
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!("machine `{}` opened with {} vcpus", config.name, vcpus.len());
        Ok(Arc::new(Self {
            config,
            vcpus,
            devices,
            dispatcher: ExitDispatcher::new(handlers),
            debug: Arc::new(DebugBridge::new()),
            checkpoint_lock: Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle {
                exit: None,
                suspended: None,
                live_threads: 0,
            }),
            lifecycle_cond: Condvar::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    pub fn reserved_regions(&self) -> usize {
        self.config.reserved_regions
    }

    pub fn vcpu(&self, id: usize) -> Option<&Arc<VirtualCpu<A>>> {
        self.vcpus.get(id)
    }

    pub fn vcpus(&self) -> &[Arc<VirtualCpu<A>>] {
        &self.vcpus
    }

    pub fn devices(&self) -> &dyn DeviceBus {
        self.devices.as_ref()
    }

    pub fn debug(&self) -> &Arc<DebugBridge> {
        &self.debug
    }

    pub(crate) fn dispatcher(&self) -> &ExitDispatcher<A> {
        &self.dispatcher
    }

    pub(crate) fn checkpoint_lock(&self) -> &Mutex<()> {
        &self.checkpoint_lock
    }

    /// Whether a checkpoint currently holds the machine.
    pub fn is_quiescing(&self) -> bool {
        self.checkpoint_lock.is_locked()
    }

    /// The machine-wide suspend reason, once any vcpu reported one.
    pub fn suspend_reason(&self) -> Option<SuspendReason> {
        self.lifecycle.lock().suspended
    }

    /// Starts the bootstrap processor at `entry`.
    pub fn boot(self: &Arc<Self>, entry: GuestPhysAddr) -> Result<(), MachineError> {
        info!("machine `{}` booting at {entry:?}", self.config.name);
        match self.start_vcpu(0, StartupRequest::Entry(entry))? {
            StartupDelivery::Ignored => Err(MachineError::VcpuRunning(0)),
            StartupDelivery::Woken | StartupDelivery::Spawn => Ok(()),
        }
    }

    /// Brings a suspended vcpu to life, spawning its thread on the first start.
    pub(crate) fn start_vcpu(
        self: &Arc<Self>,
        id: usize,
        request: StartupRequest,
    ) -> Result<StartupDelivery, MachineError> {
        let vcpu = self.vcpu(id).ok_or(MachineError::NoSuchVcpu(id))?;
        let delivery = vcpu.deliver_startup(request);
        if delivery == StartupDelivery::Spawn {
            self.lifecycle.lock().live_threads += 1;
            let machine = self.clone();
            let thread_vcpu = vcpu.clone();
            let name = format!("vcpu{id}");
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || run::vcpu_thread(machine, thread_vcpu));
            match spawned {
                Ok(handle) => vcpu.set_thread(handle),
                Err(source) => {
                    vcpu.cancel_spawn();
                    self.vcpu_thread_exited(id);
                    return Err(MachineError::Spawn { thread: name, source });
                }
            }
            debug!("vcpu {id}: thread spawned");
        }
        Ok(delivery)
    }

    /// Records a machine-wide suspend reported by `vcpu`. The first reason wins; every
    /// other vcpu observes it at its next safe point.
    pub(crate) fn suspend(&self, reason: SuspendReason, vcpu: usize, rip: u64) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.suspended.is_some() {
                return;
            }
            lifecycle.suspended = Some(reason);
        }
        info!("machine `{}` suspended by vcpu {vcpu}: {reason:?}", self.config.name);
        self.record_exit(MachineExit::from_suspend(reason, vcpu, rip));
        for vcpu in &self.vcpus {
            vcpu.notify_machine_suspended(reason);
        }
        self.debug.release();
    }

    /// Stops every vcpu because of a fatal error.
    pub(crate) fn abort(&self, cause: AbortCause) {
        self.record_exit(MachineExit::Aborted(cause));
        self.stop_all();
    }

    /// Stops every vcpu at its next safe point.
    pub fn request_stop(&self) {
        info!("machine `{}`: stop requested", self.config.name);
        self.record_exit(MachineExit::Stopped);
        self.stop_all();
    }

    fn stop_all(&self) {
        for vcpu in &self.vcpus {
            vcpu.request_stop();
        }
        self.debug.release();
    }

    /// Records why the machine exited. Only the first exit is kept.
    pub(crate) fn record_exit(&self, exit: MachineExit) {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.exit.is_none() {
            match exit.policy() {
                TeardownPolicy::TerminateWithDiagnostic => {
                    error!("machine `{}` exiting: {exit:?}", self.config.name)
                }
                _ => info!("machine `{}` exiting: {exit:?}", self.config.name),
            }
            lifecycle.exit = Some(exit);
            self.lifecycle_cond.notify_all();
        }
    }

    pub(crate) fn vcpu_thread_exited(&self, id: usize) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.live_threads = lifecycle.live_threads.saturating_sub(1);
        debug!("vcpu {id}: {} vcpu threads left", lifecycle.live_threads);
        self.lifecycle_cond.notify_all();
    }

    /// The recorded exit, if the machine has exited.
    pub fn exit_reason(&self) -> Option<MachineExit> {
        self.lifecycle.lock().exit.clone()
    }

    /// Blocks until the machine has exited and every vcpu thread has returned.
    pub fn wait_for_exit(&self) -> MachineExit {
        let mut lifecycle = self.lifecycle.lock();
        loop {
            if lifecycle.live_threads == 0 {
                if let Some(exit) = &lifecycle.exit {
                    return exit.clone();
                }
            }
            self.lifecycle_cond.wait(&mut lifecycle);
        }
    }

    /// Like [`Machine::wait_for_exit`], giving up after `timeout`.
    pub fn wait_for_exit_timeout(&self, timeout: Duration) -> Option<MachineExit> {
        let deadline = Instant::now() + timeout;
        let mut lifecycle = self.lifecycle.lock();
        loop {
            if lifecycle.live_threads == 0 {
                if let Some(exit) = &lifecycle.exit {
                    return Some(exit.clone());
                }
            }
            if self
                .lifecycle_cond
                .wait_until(&mut lifecycle, deadline)
                .timed_out()
            {
                return None;
            }
        }
    }

    /// Stops the machine and joins every vcpu thread. Afterwards every vcpu is suspended.
    pub fn teardown(&self) -> MachineExit {
        self.request_stop();
        for vcpu in &self.vcpus {
            if let Some(handle) = vcpu.take_thread() {
                if handle.join().is_err() {
                    warn!("vcpu {}: thread panicked", vcpu.id());
                }
            }
        }
        let exit = self.wait_for_exit();
        info!("machine `{}` torn down", self.config.name);
        exit
    }

    fn quiesced_vcpu(&self, vcpu: usize) -> Result<&Arc<VirtualCpu<A>>, RegisterError> {
        let cpu = self.vcpu(vcpu).ok_or(RegisterError::NoSuchVcpu(vcpu))?;
        match cpu.state() {
            VCpuState::Suspended | VCpuState::Paused | VCpuState::Debugging => Ok(cpu),
            _ => Err(RegisterError::Busy(vcpu)),
        }
    }

    fn lock_quiesced(&self, vcpu: usize) -> Result<MutexGuard<'_, A>, RegisterError> {
        self.quiesced_vcpu(vcpu)?
            .try_lock_arch()
            .ok_or(RegisterError::Busy(vcpu))
    }

    /// Reads one register of a quiesced vcpu.
    pub fn read_register(&self, vcpu: usize, id: RegisterId) -> Result<RegisterValue, RegisterError> {
        self.lock_quiesced(vcpu)?.regs().get(id)
    }

    /// Writes one register of a quiesced vcpu.
    ///
    /// Writes are refused while a checkpoint or restore is in progress: the captured state
    /// must be what the vcpu resumes with.
    pub fn write_register(
        &self,
        vcpu: usize,
        id: RegisterId,
        value: RegisterValue,
    ) -> Result<(), RegisterError> {
        let _no_checkpoint = self
            .checkpoint_lock
            .try_lock()
            .ok_or(RegisterError::Busy(vcpu))?;
        self.lock_quiesced(vcpu)?.regs_mut().set(id, value)
    }

    /// Reads a register by its printed name, such as `rax` or `msr:0x10`.
    pub fn read_register_by_name(&self, vcpu: usize, name: &str) -> Result<RegisterValue, RegisterError> {
        let id: RegisterId = name.parse()?;
        self.read_register(vcpu, id)
    }

    /// Attaches a debugger. At most one session may be attached at a time.
    pub fn attach_debugger(&self) -> Result<DebugSession, MachineError> {
        self.debug.attach()
    }

    /// Receiving a migrated machine from a remote host is not implemented.
    pub fn migrate_receive(&self, host: &str, port: u16) -> Result<(), MachineError> {
        warn!("machine `{}`: migrate-receive from {host}:{port} is not supported", self.config.name);
        Err(MachineError::NotSupported("migrate-receive"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_requires_msr_policy() {
        let missing = r#"{ "name": "vm", "vcpu_count": 2 }"#;
        assert!(serde_json::from_str::<MachineConfig>(missing).is_err());

        let config: MachineConfig =
            serde_json::from_str(r#"{ "name": "vm", "vcpu_count": 2, "msr_policy": "strict" }"#)
                .unwrap();
        assert_eq!(config, MachineConfig::new("vm", 2, MsrPolicy::Strict));
        assert_eq!(config.pause_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn config_validation() {
        assert!(MachineConfig::new("vm", 4, MsrPolicy::Lenient).validate().is_ok());
        assert!(MachineConfig::new("", 4, MsrPolicy::Lenient).validate().is_err());
        assert!(MachineConfig::new("vm", 0, MsrPolicy::Lenient).validate().is_err());
        assert!(MachineConfig::new("vm", 65, MsrPolicy::Lenient).validate().is_err());
        let mut config = MachineConfig::new("vm", 1, MsrPolicy::Strict);
        config.pause_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn exit_policies() {
        assert_eq!(MachineExit::Reset.policy(), TeardownPolicy::Restart);
        assert_eq!(MachineExit::PowerOff.policy(), TeardownPolicy::Terminate);
        let fault = MachineExit::TripleFault { vcpu: 1, rip: 0x1000 };
        assert_eq!(fault.policy(), TeardownPolicy::TerminateWithDiagnostic);
        assert_eq!(fault.exit_code(), 3);
        assert_eq!(MachineExit::Checkpointed.exit_code(), 0);
    }
}
