//! Pause-all, snapshot and resume of a whole machine.
//!
//! A checkpoint parks every vcpu at a safe point using a [`PauseLatch`], captures register
//! and device state while nothing runs, hands the snapshot to a [`SnapshotSink`], and then
//! either resumes the machine or leaves it suspended. Any failure resumes every vcpu that
//! was paused before the error is returned, so the machine is never left half-paused.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::arch_vcpu::AxArchVCpu;
use crate::device::DeviceSnapshot;
use crate::error::{CheckpointError, SinkError};
use crate::ipi::CpuSet;
use crate::latch::PauseLatch;
use crate::machine::{Machine, MachineExit};
use crate::regs::CpuRegisterState;
use crate::vcpu::{StartupRequest, VCpuState};

/// Layout version of [`MachineSnapshot`].
pub const SNAPSHOT_VERSION: u32 = 1;

/// Saved state of one vcpu.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuSnapshot {
    pub id: usize,
    /// The vcpu had been started and was not suspended when the snapshot was taken.
    pub active: bool,
    pub regs: CpuRegisterState,
}

/// A consistent point-in-time image of a machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSnapshot {
    pub version: u32,
    pub machine: String,
    pub reserved_regions: usize,
    pub vcpus: Vec<VcpuSnapshot>,
    pub devices: Vec<DeviceSnapshot>,
}

/// Destination of a checkpoint.
pub trait SnapshotSink: Send {
    fn write_snapshot(&mut self, snapshot: &MachineSnapshot) -> Result<(), SinkError>;
}

/// Origin of a restore.
pub trait SnapshotSource {
    fn read_snapshot(&mut self) -> Result<MachineSnapshot, SinkError>;
}

/// Writes snapshots as JSON files.
///
/// The snapshot is written next to the target under a `.partial` name and renamed into
/// place once complete, so a failed write never leaves a truncated snapshot behind.
#[derive(Clone, Debug)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back a snapshot written by a [`FileSink`].
    pub fn load(path: impl AsRef<Path>) -> Result<MachineSnapshot, SinkError> {
        let file = File::open(path)?;
        let snapshot: MachineSnapshot = serde_json::from_reader(BufReader::new(file))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SinkError::Rejected(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    fn partial_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".partial");
        PathBuf::from(name)
    }

    fn write_partial(partial: &Path, snapshot: &MachineSnapshot) -> Result<(), SinkError> {
        let mut writer = BufWriter::new(File::create(partial)?);
        serde_json::to_writer(&mut writer, snapshot)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}

impl SnapshotSink for FileSink {
    fn write_snapshot(&mut self, snapshot: &MachineSnapshot) -> Result<(), SinkError> {
        let partial = self.partial_path();
        let written = Self::write_partial(&partial, snapshot)
            .and_then(|()| fs::rename(&partial, &self.path).map_err(SinkError::from));
        if written.is_err() {
            let _ = fs::remove_file(&partial);
        }
        written
    }
}

impl SnapshotSource for FileSink {
    fn read_snapshot(&mut self) -> Result<MachineSnapshot, SinkError> {
        Self::load(&self.path)
    }
}

/// A request to checkpoint a running machine.
pub struct CheckpointRequest {
    pub sink: Box<dyn SnapshotSink>,
    /// Leave the machine suspended after the snapshot instead of resuming it.
    pub suspend_after: bool,
}

impl CheckpointRequest {
    pub fn new(sink: impl SnapshotSink + 'static, suspend_after: bool) -> Self {
        Self {
            sink: Box::new(sink),
            suspend_after,
        }
    }
}

/// Summary of a completed checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointOutcome {
    /// Vcpus that were active and paused for the snapshot.
    pub paused: CpuSet,
    pub devices: usize,
    /// The machine was left suspended.
    pub suspended: bool,
}

/// Runs checkpoints and restores.
pub struct CheckpointCoordinator;

impl CheckpointCoordinator {
    /// Pauses every vcpu, writes a snapshot to `request.sink`, and resumes or suspends the
    /// machine. At most one checkpoint runs per machine; a concurrent one fails with
    /// [`CheckpointError::Busy`].
    pub fn checkpoint<A: AxArchVCpu>(
        machine: &Arc<Machine<A>>,
        request: CheckpointRequest,
    ) -> Result<CheckpointOutcome, CheckpointError> {
        let Some(_guard) = machine.checkpoint_lock().try_lock() else {
            return Err(CheckpointError::Busy);
        };
        if machine.exit_reason().is_some() {
            return Err(CheckpointError::NotRunning);
        }
        let CheckpointRequest {
            mut sink,
            suspend_after,
        } = request;

        let latch = Arc::new(PauseLatch::new(CpuSet::first(machine.vcpu_count())));
        info!("machine `{}`: checkpoint started", machine.name());
        for vcpu in machine.vcpus() {
            vcpu.request_pause(&latch);
        }
        let timeout = machine.config().pause_timeout();
        if let Err(stuck) = latch.wait(timeout) {
            warn!(
                "machine `{}`: vcpus {stuck:?} did not pause within {timeout:?}; resuming",
                machine.name()
            );
            Self::resume_all(machine, &latch);
            return Err(CheckpointError::PauseTimeout {
                stuck: stuck.iter().collect(),
                timeout_ms: machine.config().pause_timeout_ms,
            });
        }

        let snapshot = match Self::capture(machine) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                Self::resume_all(machine, &latch);
                return Err(error);
            }
        };
        if let Err(error) = sink.write_snapshot(&snapshot) {
            warn!("machine `{}`: snapshot rejected: {error}", machine.name());
            Self::resume_all(machine, &latch);
            return Err(error.into());
        }

        let outcome = CheckpointOutcome {
            paused: snapshot.vcpus.iter().filter(|v| v.active).map(|v| v.id).collect(),
            devices: snapshot.devices.len(),
            suspended: suspend_after,
        };
        if suspend_after {
            machine.record_exit(MachineExit::Checkpointed);
            for vcpu in machine.vcpus() {
                vcpu.stop_paused(&latch);
            }
            machine.debug().release();
        } else {
            Self::resume_all(machine, &latch);
        }
        info!("machine `{}`: checkpoint complete: {outcome:?}", machine.name());
        Ok(outcome)
    }

    fn resume_all<A: AxArchVCpu>(machine: &Machine<A>, latch: &Arc<PauseLatch>) {
        for vcpu in machine.vcpus() {
            vcpu.resume(latch);
        }
    }

    fn capture<A: AxArchVCpu>(machine: &Machine<A>) -> Result<MachineSnapshot, CheckpointError> {
        let vcpus = machine
            .vcpus()
            .iter()
            .map(|vcpu| {
                debug_assert_eq!(vcpu.hold_count(), 0);
                let active = vcpu.state() != VCpuState::Suspended;
                let regs = vcpu.lock_arch().regs().clone();
                VcpuSnapshot {
                    id: vcpu.id(),
                    active,
                    regs,
                }
            })
            .collect();
        let devices = machine.devices().save_state()?;
        debug!(
            "machine `{}`: captured {} vcpus and {} devices",
            machine.name(),
            machine.vcpu_count(),
            devices.len()
        );
        Ok(MachineSnapshot {
            version: SNAPSHOT_VERSION,
            machine: machine.name().into(),
            reserved_regions: machine.reserved_regions(),
            vcpus,
            devices,
        })
    }

    /// Loads `snapshot` into a machine whose vcpus are all suspended, then starts the vcpus
    /// that were active when it was taken. Their entry points are not reset.
    pub fn restore<A: AxArchVCpu>(
        machine: &Arc<Machine<A>>,
        snapshot: &MachineSnapshot,
    ) -> Result<(), CheckpointError> {
        let Some(_guard) = machine.checkpoint_lock().try_lock() else {
            return Err(CheckpointError::Busy);
        };
        if snapshot.machine != machine.name() || snapshot.vcpus.len() != machine.vcpu_count() {
            return Err(CheckpointError::MachineMismatch {
                expected: format!("{} ({} vcpus)", machine.name(), machine.vcpu_count()),
                found: format!("{} ({} vcpus)", snapshot.machine, snapshot.vcpus.len()),
            });
        }
        if machine.exit_reason().is_some() {
            return Err(CheckpointError::NotRunning);
        }
        if let Some(vcpu) = machine.vcpus().iter().find(|v| v.state() != VCpuState::Suspended) {
            return Err(CheckpointError::VcpuActive(vcpu.id()));
        }

        for saved in &snapshot.vcpus {
            let vcpu = machine
                .vcpu(saved.id)
                .ok_or_else(|| CheckpointError::MachineMismatch {
                    expected: format!("vcpu ids below {}", machine.vcpu_count()),
                    found: format!("vcpu {}", saved.id),
                })?;
            *vcpu.lock_arch().regs_mut() = saved.regs.clone();
        }
        machine.devices().restore_state(&snapshot.devices)?;
        info!(
            "machine `{}`: restored {} vcpus and {} devices",
            machine.name(),
            snapshot.vcpus.len(),
            snapshot.devices.len()
        );

        for saved in snapshot.vcpus.iter().filter(|v| v.active) {
            machine
                .start_vcpu(saved.id, StartupRequest::Resume)
                .map_err(|e| CheckpointError::Restart {
                    vcpu: saved.id,
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::Gpr;

    fn snapshot() -> MachineSnapshot {
        let mut regs = CpuRegisterState::reset();
        regs.set_gpr(Gpr::Rbx, 0xdead_beef);
        regs.rip = 0x7c00;
        MachineSnapshot {
            version: SNAPSHOT_VERSION,
            machine: "vm".into(),
            reserved_regions: 2,
            vcpus: vec![VcpuSnapshot {
                id: 0,
                active: true,
                regs,
            }],
            devices: vec![DeviceSnapshot {
                name: "uart".into(),
                data: vec![1, 2, 3],
            }],
        }
    }

    #[test]
    fn file_sink_writes_whole_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.snap");
        let mut sink = FileSink::new(&path);
        sink.write_snapshot(&snapshot()).unwrap();
        assert!(!sink.partial_path().exists());
        assert_eq!(sink.read_snapshot().unwrap(), snapshot());
    }

    #[test]
    fn file_sink_failure_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("vm.snap");
        let mut sink = FileSink::new(&path);
        assert!(matches!(sink.write_snapshot(&snapshot()), Err(SinkError::Io(_))));
        assert!(!path.exists());
    }

    #[test]
    fn rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm.snap");
        let mut old = snapshot();
        old.version = 0;
        fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();
        assert!(matches!(FileSink::load(&path), Err(SinkError::Rejected(_))));
    }
}
