use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use axerrno::{ax_err, AxResult};
use log::{debug, trace};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::addr::GuestPhysAddr;
use crate::arch_vcpu::AxArchVCpu;
use crate::exit::{ExitEvent, ExitTag, SuspendReason};
use crate::latch::PauseLatch;

/// The state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VCpuState {
    /// The vcpu is idle: never started, reset by INIT, or stopped. This is the initial state.
    Suspended = 0,
    /// The vcpu is in (or about to enter) guest context.
    Running = 1,
    /// The vcpu exited and the exit is being classified.
    ExitPending = 2,
    /// A handler is emulating the exit.
    Emulating = 3,
    /// The vcpu is stopped for an attached debugger.
    Debugging = 4,
    /// The vcpu is parked at a safe point for a machine-wide pause.
    Paused = 5,
}

/// How a suspended vcpu is brought back to life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StartupRequest {
    /// Boot the BSP at a flat entry point.
    Entry(GuestPhysAddr),
    /// A STARTUP IPI: begin at `vector << 12` in real mode.
    Vector(u8),
    /// Continue with the register state already loaded (after a restore).
    Resume,
}

/// Outcome of delivering a [`StartupRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StartupDelivery {
    /// The vcpu was not suspended, or already had a startup pending.
    Ignored,
    /// The vcpu's existing thread was woken.
    Woken,
    /// The vcpu has no thread yet; the caller must spawn it.
    Spawn,
}

/// What the run loop does after a safe point.
pub(crate) enum SafePoint {
    Proceed(EntryWork),
    /// An INIT was consumed; the vcpu is suspended and its state must be reset.
    Init,
    Stop,
}

/// Work the run loop performs before the next guest entry.
pub(crate) struct EntryWork {
    pub interrupts: Vec<u8>,
    pub suspended: Option<SuspendReason>,
}

/// The last exit a vcpu took, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LastExit {
    pub tag: ExitTag,
    pub rip: u64,
}

/// Per-kind exit counters.
#[derive(Debug, Default)]
pub struct ExitStats {
    counts: [AtomicU64; ExitTag::COUNT],
}

impl ExitStats {
    /// Exits of kind `tag` taken so far.
    pub fn count(&self, tag: ExitTag) -> u64 {
        self.counts[tag as usize].load(Ordering::Relaxed)
    }

    /// All exits taken so far.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    fn record(&self, tag: ExitTag) {
        self.counts[tag as usize].fetch_add(1, Ordering::Relaxed);
    }
}

/// Keeps a vcpu's hold count raised while an exit is being handled.
pub struct HoldGuard<'a> {
    count: &'a AtomicUsize,
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The lifecycle part of a vcpu, shared between its run-loop thread and everyone who
/// pauses, starts or stops it.
struct VCpuControl {
    state: VCpuState,
    /// The run-loop thread has been spawned.
    started: bool,
    startup: Option<StartupRequest>,
    init_pending: bool,
    pause: Option<Arc<PauseLatch>>,
    stop: bool,
    machine_suspended: Option<SuspendReason>,
    interrupts: VecDeque<u8>,
    last_exit: Option<LastExit>,
}

/// A virtual CPU with backend-independent lifecycle management.
///
/// The backend-specific state is delegated to a struct implementing [`AxArchVCpu`] and is
/// only ever touched with the arch lock held. The lifecycle state lives behind a separate
/// lock so the vcpu can be paused, started or stopped from other threads while its own
/// thread is inside the guest.
///
/// Note that:
/// - Almost all the methods are `&self`; the struct is shared through an `Arc`.
/// - Each vcpu is driven by exactly one host thread, spawned on its first startup.
pub struct VirtualCpu<A: AxArchVCpu> {
    id: usize,
    arch: Mutex<A>,
    control: Mutex<VCpuControl>,
    cond: Condvar,
    /// Set whenever the run loop has to pass through a safe point before re-entering.
    attention: AtomicBool,
    hold: AtomicUsize,
    stats: ExitStats,
    spawns: AtomicUsize,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<A: AxArchVCpu> VirtualCpu<A> {
    /// Create a new suspended [`VirtualCpu`].
    pub fn new(id: usize, arch_config: A::CreateConfig) -> AxResult<Self> {
        Ok(Self {
            id,
            arch: Mutex::new(A::new(id, arch_config)?),
            control: Mutex::new(VCpuControl {
                state: VCpuState::Suspended,
                started: false,
                startup: None,
                init_pending: false,
                pause: None,
                stop: false,
                machine_suspended: None,
                interrupts: VecDeque::new(),
                last_exit: None,
            }),
            cond: Condvar::new(),
            attention: AtomicBool::new(false),
            hold: AtomicUsize::new(0),
            stats: ExitStats::default(),
            spawns: AtomicUsize::new(0),
            thread: Mutex::new(None),
        })
    }

    /// Get the id of the vcpu.
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Get whether the vcpu is the BSP. We always assume the first vcpu (vcpu with id #0) is the BSP.
    pub const fn is_bsp(&self) -> bool {
        self.id == 0
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VCpuState {
        self.control.lock().state
    }

    pub(crate) fn set_state(&self, state: VCpuState) {
        self.control.lock().state = state;
    }

    /// Execute a block with the state of the vcpu transitioned from `from` to `to`. If the
    /// current state is not `from`, return an error.
    ///
    /// The lifecycle lock is held while the block runs, so no startup, pause or stop can
    /// interleave with it. The state is left unchanged if the block fails.
    pub fn with_state_transition<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        let mut control = self.control.lock();
        if control.state != from {
            ax_err!(
                BadState,
                format!("VCpu state is not {:?}, but {:?}", from, control.state)
            )
        } else {
            let result = f();
            if result.is_ok() {
                control.state = to;
            }
            result
        }
    }

    /// Transition the state of the vcpu. If the current state is not `from`, return an error.
    pub fn transition_state(&self, from: VCpuState, to: VCpuState) -> AxResult {
        self.with_state_transition(from, to, || Ok(()))
    }

    /// Number of in-flight handlers holding this vcpu. Always zero while it is paused.
    pub fn hold_count(&self) -> usize {
        self.hold.load(Ordering::Acquire)
    }

    /// Exit statistics.
    pub fn stats(&self) -> &ExitStats {
        &self.stats
    }

    /// The most recent exit, if any.
    pub fn last_exit(&self) -> Option<LastExit> {
        self.control.lock().last_exit
    }

    /// How many times a run-loop thread was spawned for this vcpu. Never more than one.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::Acquire)
    }

    pub(crate) fn hold(&self) -> HoldGuard<'_> {
        self.hold.fetch_add(1, Ordering::AcqRel);
        HoldGuard { count: &self.hold }
    }

    pub(crate) fn lock_arch(&self) -> MutexGuard<'_, A> {
        self.arch.lock()
    }

    pub(crate) fn try_lock_arch(&self) -> Option<MutexGuard<'_, A>> {
        self.arch.try_lock()
    }

    pub(crate) fn needs_attention(&self) -> bool {
        self.attention.load(Ordering::Acquire)
    }

    pub(crate) fn record_exit(&self, event: &ExitEvent) {
        let tag = event.tag();
        self.stats.record(tag);
        let mut control = self.control.lock();
        control.state = VCpuState::ExitPending;
        control.last_exit = Some(LastExit {
            tag,
            rip: event.rip,
        });
    }

    /// Called by the run loop with no arch lock held, between two guest entries.
    ///
    /// Parks the vcpu while a pause is requested, consumes a pending INIT, and otherwise
    /// hands back the work to do before the next entry.
    pub(crate) fn safe_point(&self) -> SafePoint {
        let mut control = self.control.lock();
        loop {
            if control.stop {
                return SafePoint::Stop;
            }
            if let Some(latch) = control.pause.clone() {
                if control.state != VCpuState::Paused {
                    debug_assert_eq!(self.hold_count(), 0);
                    control.state = VCpuState::Paused;
                    latch.arrive(self.id);
                    trace!("vcpu {} parked", self.id);
                }
                self.cond.wait(&mut control);
                continue;
            }
            if control.init_pending {
                control.init_pending = false;
                control.interrupts.clear();
                control.state = VCpuState::Suspended;
                return SafePoint::Init;
            }
            self.attention.store(false, Ordering::Release);
            control.state = VCpuState::Running;
            return SafePoint::Proceed(EntryWork {
                interrupts: control.interrupts.drain(..).collect(),
                suspended: control.machine_suspended,
            });
        }
    }

    /// Blocks an idle vcpu thread until it is started again. Returns `None` once the vcpu
    /// will never run again.
    pub(crate) fn wait_for_startup(&self) -> Option<StartupRequest> {
        let mut control = self.control.lock();
        loop {
            if control.stop || control.machine_suspended.is_some() {
                return None;
            }
            if let Some(request) = control.startup.take() {
                return Some(request);
            }
            if let Some(latch) = &control.pause {
                latch.arrive(self.id);
            }
            self.cond.wait(&mut control);
        }
    }

    pub(crate) fn deliver_startup(&self, request: StartupRequest) -> StartupDelivery {
        let mut control = self.control.lock();
        if control.state != VCpuState::Suspended
            || control.startup.is_some()
            || control.stop
            || control.machine_suspended.is_some()
        {
            debug!("vcpu {}: startup ignored in {:?}", self.id, control.state);
            return StartupDelivery::Ignored;
        }
        control.state = VCpuState::Running;
        control.startup = Some(request);
        self.cond.notify_all();
        if control.started {
            StartupDelivery::Woken
        } else {
            control.started = true;
            self.spawns.fetch_add(1, Ordering::AcqRel);
            StartupDelivery::Spawn
        }
    }

    /// Undoes a [`StartupDelivery::Spawn`] whose thread could not be created.
    pub(crate) fn cancel_spawn(&self) {
        let mut control = self.control.lock();
        control.started = false;
        control.startup = None;
        control.state = VCpuState::Suspended;
        self.spawns.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn request_init(&self) {
        let mut control = self.control.lock();
        if control.state == VCpuState::Suspended {
            return;
        }
        if control.startup.take().is_some() {
            control.state = VCpuState::Suspended;
            return;
        }
        control.init_pending = true;
        self.attention.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub(crate) fn queue_interrupt(&self, vector: u8) {
        let mut control = self.control.lock();
        if control.state == VCpuState::Suspended {
            debug!("vcpu {}: interrupt {vector:#x} dropped while suspended", self.id);
            return;
        }
        control.interrupts.push_back(vector);
        self.attention.store(true, Ordering::Release);
    }

    pub(crate) fn request_pause(&self, latch: &Arc<PauseLatch>) {
        let mut control = self.control.lock();
        if control.state == VCpuState::Suspended {
            latch.arrive(self.id);
        }
        control.pause = Some(latch.clone());
        self.attention.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Lifts the pause requested with `latch`. Only the coordinator that requested it may
    /// move the vcpu out of [`VCpuState::Paused`].
    pub(crate) fn resume(&self, latch: &Arc<PauseLatch>) {
        let mut control = self.control.lock();
        if control
            .pause
            .as_ref()
            .is_some_and(|pause| Arc::ptr_eq(pause, latch))
        {
            control.pause = None;
            if control.state == VCpuState::Paused {
                control.state = VCpuState::Running;
            }
            self.cond.notify_all();
        }
    }

    /// Stops a vcpu parked by `latch` without letting it re-enter the guest.
    pub(crate) fn stop_paused(&self, latch: &Arc<PauseLatch>) {
        let mut control = self.control.lock();
        control.stop = true;
        if control
            .pause
            .as_ref()
            .is_some_and(|pause| Arc::ptr_eq(pause, latch))
        {
            control.pause = None;
        }
        if control.state == VCpuState::Paused {
            control.state = VCpuState::Suspended;
        }
        self.cond.notify_all();
    }

    pub(crate) fn request_stop(&self) {
        let mut control = self.control.lock();
        control.stop = true;
        self.attention.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub(crate) fn notify_machine_suspended(&self, reason: SuspendReason) {
        let mut control = self.control.lock();
        control.machine_suspended.get_or_insert(reason);
        self.attention.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    /// Marks the vcpu suspended after its run loop returned.
    pub(crate) fn enter_suspended(&self) {
        let mut control = self.control.lock();
        control.state = VCpuState::Suspended;
        if let Some(latch) = &control.pause {
            latch.arrive(self.id);
        }
    }

    pub(crate) fn set_thread(&self, handle: JoinHandle<()>) {
        *self.thread.lock() = Some(handle);
    }

    pub(crate) fn take_thread(&self) -> Option<JoinHandle<()>> {
        self.thread.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use axerrno::AxError;

    use super::*;
    use crate::exit::{Backend, RawExit};
    use crate::ipi::CpuSet;
    use crate::regs::CpuRegisterState;

    struct Idle(CpuRegisterState);

    impl AxArchVCpu for Idle {
        type CreateConfig = ();

        fn new(_vcpu_id: usize, _config: ()) -> AxResult<Self> {
            Ok(Self(CpuRegisterState::reset()))
        }

        fn backend(&self) -> Backend {
            Backend::Monitor
        }

        fn set_entry(&mut self, entry: GuestPhysAddr) -> AxResult {
            self.0.rip = entry.as_usize() as u64;
            Ok(())
        }

        fn reset(&mut self) -> AxResult {
            self.0 = CpuRegisterState::reset();
            Ok(())
        }

        fn run(&mut self) -> AxResult<RawExit> {
            Err(AxError::Unsupported)
        }

        fn regs(&self) -> &CpuRegisterState {
            &self.0
        }

        fn regs_mut(&mut self) -> &mut CpuRegisterState {
            &mut self.0
        }

        fn fetch_instruction(&self, _rip: u64, _buf: &mut [u8]) -> AxResult<usize> {
            Err(AxError::Unsupported)
        }

        fn inject_interrupt(&mut self, _vector: u8) -> AxResult {
            Ok(())
        }

        fn inject_exception(&mut self, _vector: u8, _error_code: Option<u32>) -> AxResult {
            Ok(())
        }

        fn set_single_step(&mut self, _enabled: bool) -> AxResult {
            Ok(())
        }
    }

    fn vcpu() -> VirtualCpu<Idle> {
        VirtualCpu::new(1, ()).unwrap()
    }

    #[test]
    fn starts_suspended() {
        let vcpu = vcpu();
        assert_eq!(vcpu.state(), VCpuState::Suspended);
        assert!(!vcpu.is_bsp());
        assert!(vcpu.transition_state(VCpuState::Running, VCpuState::Paused).is_err());
        assert_eq!(vcpu.state(), VCpuState::Suspended);
    }

    #[test]
    fn failed_transition_keeps_state() {
        let vcpu = vcpu();
        let result: AxResult<()> =
            vcpu.with_state_transition(VCpuState::Suspended, VCpuState::Running, || {
                Err(AxError::BadState)
            });
        assert!(result.is_err());
        assert_eq!(vcpu.state(), VCpuState::Suspended);
    }

    #[test]
    fn startup_spawns_once() {
        let vcpu = vcpu();
        assert_eq!(vcpu.deliver_startup(StartupRequest::Vector(0x10)), StartupDelivery::Spawn);
        assert_eq!(vcpu.deliver_startup(StartupRequest::Vector(0x10)), StartupDelivery::Ignored);
        assert_eq!(vcpu.wait_for_startup(), Some(StartupRequest::Vector(0x10)));
        assert_eq!(vcpu.spawn_count(), 1);

        // INIT is consumed at the next safe point; the next STARTUP wakes the same thread.
        vcpu.request_init();
        assert!(vcpu.needs_attention());
        assert!(matches!(vcpu.safe_point(), SafePoint::Init));
        assert_eq!(vcpu.state(), VCpuState::Suspended);
        assert_eq!(vcpu.deliver_startup(StartupRequest::Vector(0x20)), StartupDelivery::Woken);
        assert_eq!(vcpu.spawn_count(), 1);
    }

    #[test]
    fn interrupts_are_drained_at_safe_point() {
        let vcpu = vcpu();
        vcpu.queue_interrupt(0x30);
        vcpu.deliver_startup(StartupRequest::Resume);
        vcpu.queue_interrupt(0x40);
        vcpu.queue_interrupt(0x41);
        let SafePoint::Proceed(work) = vcpu.safe_point() else {
            panic!("vcpu should proceed");
        };
        assert_eq!(work.interrupts, vec![0x40, 0x41]);
        assert_eq!(work.suspended, None);
        assert!(!vcpu.needs_attention());
    }

    #[test]
    fn pause_and_resume() {
        let vcpu = Arc::new(vcpu());
        vcpu.deliver_startup(StartupRequest::Resume);
        let latch = Arc::new(PauseLatch::new(CpuSet::single(1)));
        vcpu.request_pause(&latch);

        let parked = {
            let vcpu = vcpu.clone();
            std::thread::spawn(move || matches!(vcpu.safe_point(), SafePoint::Proceed(_)))
        };
        assert_eq!(latch.wait(std::time::Duration::from_secs(10)), Ok(()));
        assert_eq!(vcpu.state(), VCpuState::Paused);
        assert_eq!(vcpu.hold_count(), 0);
        vcpu.resume(&latch);
        assert!(parked.join().unwrap());
        assert_eq!(vcpu.state(), VCpuState::Running);
    }

    #[test]
    fn stop_wins_over_pause() {
        let vcpu = vcpu();
        vcpu.deliver_startup(StartupRequest::Resume);
        let latch = Arc::new(PauseLatch::new(CpuSet::single(1)));
        vcpu.request_pause(&latch);
        vcpu.stop_paused(&latch);
        assert!(matches!(vcpu.safe_point(), SafePoint::Stop));
        assert_eq!(vcpu.wait_for_startup(), None);
    }
}
