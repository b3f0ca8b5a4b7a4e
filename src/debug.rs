//! Breakpoint and single-step routing to an attached debugger.
//!
//! At most one [`DebugSession`] is attached to a machine. A vcpu that takes a breakpoint or
//! single-step exit while a session is attached publishes a [`DebugEvent`] and waits in
//! [`VCpuState::Debugging`](crate::VCpuState::Debugging) for a command. Dropping the session
//! detaches it and lets every waiting vcpu run again.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use crate::error::MachineError;
use crate::regs::CpuRegisterState;

/// Why a vcpu stopped for the debugger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugStopKind {
    Breakpoint,
    SingleStep,
}

/// A vcpu stopped for the debugger.
#[derive(Clone, Debug)]
pub struct DebugEvent {
    pub vcpu: usize,
    pub rip: u64,
    pub kind: DebugStopKind,
    /// Register state at the stop.
    pub regs: CpuRegisterState,
}

/// How a stopped vcpu continues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugCommand {
    Continue,
    /// Execute one instruction and stop again.
    Step,
}

/// How a stop reported to the bridge was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopResolution {
    /// No session is attached; the guest handles the event itself.
    NoSession,
    Command(DebugCommand),
    /// The session went away while the vcpu was stopped.
    Detached,
}

#[derive(Default)]
struct BridgeState {
    session: Option<u64>,
    next_session: u64,
    events: Option<Sender<DebugEvent>>,
    commands: BTreeMap<usize, DebugCommand>,
    all_stop: bool,
}

/// The machine side of the debugger connection.
#[derive(Default)]
pub struct DebugBridge {
    state: Mutex<BridgeState>,
    cond: Condvar,
}

impl DebugBridge {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Attaches a new session. Fails if one is already attached.
    pub(crate) fn attach(self: &Arc<Self>) -> Result<DebugSession, MachineError> {
        let mut state = self.state.lock();
        if state.session.is_some() {
            return Err(MachineError::DebuggerAttached);
        }
        let id = state.next_session;
        state.next_session += 1;
        let (tx, rx) = mpsc::channel();
        state.session = Some(id);
        state.events = Some(tx);
        state.commands.clear();
        info!("debugger session {id} attached");
        Ok(DebugSession {
            bridge: self.clone(),
            id,
            events: rx,
        })
    }

    /// Whether a session is attached.
    pub fn is_attached(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Reports a stop and blocks until the session resumes `event.vcpu` or detaches.
    pub(crate) fn report_stop(&self, event: DebugEvent, all_stop: bool) -> StopResolution {
        let vcpu = event.vcpu;
        let mut state = self.state.lock();
        let Some(session) = state.session else {
            return StopResolution::NoSession;
        };
        let delivered = state
            .events
            .as_ref()
            .is_some_and(|events| events.send(event).is_ok());
        if !delivered {
            return StopResolution::Detached;
        }
        if all_stop {
            state.all_stop = true;
        }
        loop {
            if state.session != Some(session) {
                return StopResolution::Detached;
            }
            if let Some(command) = state.commands.remove(&vcpu) {
                return StopResolution::Command(command);
            }
            self.cond.wait(&mut state);
        }
    }

    /// Whether other vcpus must stay stopped because one of them hit a breakpoint.
    pub(crate) fn all_stopped(&self) -> bool {
        self.state.lock().all_stop
    }

    /// Blocks while an all-stop is in effect.
    pub(crate) fn wait_all_stop(&self) {
        let mut state = self.state.lock();
        while state.all_stop {
            self.cond.wait(&mut state);
        }
    }

    /// Forcibly detaches any session. Used when the machine stops.
    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        if let Some(id) = state.session {
            Self::detach_locked(&mut state, id);
            self.cond.notify_all();
        }
    }

    fn detach(&self, id: u64) {
        let mut state = self.state.lock();
        if state.session == Some(id) {
            Self::detach_locked(&mut state, id);
            self.cond.notify_all();
        }
    }

    fn detach_locked(state: &mut BridgeState, id: u64) {
        state.session = None;
        state.events = None;
        state.commands.clear();
        state.all_stop = false;
        info!("debugger session {id} detached");
    }

    fn resume(&self, id: u64, vcpu: usize, command: DebugCommand) {
        let mut state = self.state.lock();
        if state.session != Some(id) {
            return;
        }
        debug!("debugger: {command:?} vcpu {vcpu}");
        state.commands.insert(vcpu, command);
        state.all_stop = false;
        self.cond.notify_all();
    }

    fn set_all_stop(&self, id: u64, enabled: bool) {
        let mut state = self.state.lock();
        if state.session == Some(id) {
            state.all_stop = enabled;
            self.cond.notify_all();
        }
    }
}

/// An attached debugger. Detaches on drop.
pub struct DebugSession {
    bridge: Arc<DebugBridge>,
    id: u64,
    events: Receiver<DebugEvent>,
}

impl DebugSession {
    /// Waits up to `timeout` for the next stop.
    pub fn wait_event(&self, timeout: Duration) -> Option<DebugEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Resumes a stopped vcpu. Also ends an all-stop, letting the other vcpus run.
    pub fn resume(&self, vcpu: usize, command: DebugCommand) {
        self.bridge.resume(self.id, vcpu, command);
    }

    /// Keeps every vcpu at its next safe point until the next [`DebugSession::resume`].
    pub fn set_all_stop(&self, enabled: bool) {
        self.bridge.set_all_stop(self.id, enabled);
    }

    /// Detaches explicitly. Equivalent to dropping the session.
    pub fn detach(self) {}
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        self.bridge.detach(self.id);
    }
}
