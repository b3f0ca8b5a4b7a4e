//! The out-of-process control channel.
//!
//! A [`ControlServer`] owns a listener thread consuming a single-consumer queue of
//! [`ControlRequest`]s. Requests run one at a time, so at most one checkpoint is in flight
//! per channel; each request carries the channel its reply is sent on.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::arch_vcpu::AxArchVCpu;
use crate::checkpoint::{CheckpointCoordinator, CheckpointOutcome, CheckpointRequest};
use crate::error::{CheckpointError, MachineError};
use crate::machine::Machine;

/// A request submitted on the control channel.
pub enum ControlRequest {
    Checkpoint {
        request: CheckpointRequest,
        reply: Sender<Result<CheckpointOutcome, CheckpointError>>,
    },
    MigrateReceive {
        host: String,
        port: u16,
        reply: Sender<Result<(), MachineError>>,
    },
    /// Stops the listener. Requests queued behind it are dropped.
    Shutdown,
}

/// Submits requests to a [`ControlServer`]. Cheap to clone.
#[derive(Clone)]
pub struct ControlHandle {
    requests: Sender<ControlRequest>,
}

impl ControlHandle {
    pub fn submit(&self, request: ControlRequest) -> Result<(), MachineError> {
        self.requests
            .send(request)
            .map_err(|_| MachineError::ChannelClosed)
    }

    /// Checkpoints the machine and waits for the result.
    pub fn checkpoint(&self, request: CheckpointRequest) -> Result<CheckpointOutcome, CheckpointError> {
        let (reply, response) = mpsc::channel();
        self.submit(ControlRequest::Checkpoint { request, reply })
            .map_err(|_| CheckpointError::ChannelClosed)?;
        response.recv().map_err(|_| CheckpointError::ChannelClosed)?
    }

    pub fn migrate_receive(&self, host: &str, port: u16) -> Result<(), MachineError> {
        let (reply, response) = mpsc::channel();
        self.submit(ControlRequest::MigrateReceive {
            host: host.into(),
            port,
            reply,
        })?;
        response.recv().map_err(|_| MachineError::ChannelClosed)?
    }
}

/// The listener side of the control channel.
pub struct ControlServer {
    handle: ControlHandle,
    thread: Option<JoinHandle<()>>,
}

impl ControlServer {
    /// Spawns the listener thread for `machine`.
    pub fn spawn<A: AxArchVCpu>(machine: Arc<Machine<A>>) -> Result<Self, MachineError> {
        let (requests, queue) = mpsc::channel();
        let name = format!("{}-control", machine.name());
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || Self::serve(machine, queue))
            .map_err(|source| MachineError::Spawn { thread: name, source })?;
        Ok(Self {
            handle: ControlHandle { requests },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ControlHandle {
        self.handle.clone()
    }

    /// Stops the listener and waits for it to exit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.handle.submit(ControlRequest::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("control listener panicked");
            }
        }
    }

    fn serve<A: AxArchVCpu>(machine: Arc<Machine<A>>, queue: Receiver<ControlRequest>) {
        info!("machine `{}`: control channel listening", machine.name());
        for request in queue {
            match request {
                ControlRequest::Checkpoint { request, reply } => {
                    debug!(
                        "machine `{}`: checkpoint requested (suspend_after: {})",
                        machine.name(),
                        request.suspend_after
                    );
                    let result = CheckpointCoordinator::checkpoint(&machine, request);
                    if let Err(error) = &result {
                        warn!("machine `{}`: checkpoint failed: {error}", machine.name());
                    }
                    let _ = reply.send(result);
                }
                ControlRequest::MigrateReceive { host, port, reply } => {
                    let _ = reply.send(machine.migrate_receive(&host, port));
                }
                ControlRequest::Shutdown => break,
            }
        }
        info!("machine `{}`: control channel closed", machine.name());
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}
