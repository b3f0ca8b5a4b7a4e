//! Inter-processor interrupts.
//!
//! IPIs arrive as guest writes to the x2APIC interrupt command register and are delivered
//! cooperatively: INIT and fixed interrupts are flagged on the target and consumed at its next
//! safe point, STARTUP brings an idle core to life. Nothing here blocks on the target core.

use std::fmt;
use std::sync::Arc;

use log::{debug, warn};

use crate::arch_vcpu::AxArchVCpu;
use crate::error::ExitError;
use crate::machine::Machine;
use crate::vcpu::StartupRequest;

/// A set of vCPU ids. A machine has at most [`CpuSet::MAX_CPUS`] vCPUs.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuSet(u64);

impl CpuSet {
    /// The largest number of vCPUs a set can describe.
    pub const MAX_CPUS: usize = 64;

    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The set `{id}`.
    pub const fn single(id: usize) -> Self {
        Self(1 << id)
    }

    /// The set `{0, .., count - 1}`.
    pub const fn first(count: usize) -> Self {
        if count >= Self::MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    pub fn insert(&mut self, id: usize) {
        self.0 |= 1 << id;
    }

    pub fn remove(&mut self, id: usize) {
        self.0 &= !(1 << id);
    }

    pub const fn contains(&self, id: usize) -> bool {
        id < Self::MAX_CPUS && self.0 & (1 << id) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// `self \ other`.
    pub const fn difference(&self, other: CpuSet) -> Self {
        Self(self.0 & !other.0)
    }

    /// Ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..Self::MAX_CPUS).filter(move |id| bits & (1 << id) != 0)
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = Self::empty();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// IPI delivery mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpiMode {
    /// A fixed interrupt with the given vector.
    Fixed(u8),
    Nmi,
    /// Reset the target to its INIT state; it stays idle until a STARTUP.
    Init,
    /// Start an idle target at `vector << 12`.
    Startup(u8),
    /// A delivery the monitor does not model (INIT de-assert, SMI, ExtINT, reserved). The
    /// ICR write is accepted and dropped.
    Ignored,
}

/// IPI destination, after destination shorthand decoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpiDestination {
    /// A physical x2APIC id. vCPU ids double as APIC ids.
    Physical(u32),
    SelfOnly,
    AllIncludingSelf,
    AllExcludingSelf,
}

/// One decoded IPI.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpiRequest {
    pub mode: IpiMode,
    pub destination: IpiDestination,
}

const ICR_DELIVERY_FIXED: u64 = 0;
const ICR_DELIVERY_LOWEST: u64 = 1;
const ICR_DELIVERY_NMI: u64 = 4;
const ICR_DELIVERY_INIT: u64 = 5;
const ICR_DELIVERY_STARTUP: u64 = 6;
const ICR_LEVEL_ASSERT: u64 = 1 << 14;
const ICR_TRIGGER_LEVEL: u64 = 1 << 15;

/// The vector the monitor uses for NMIs queued on a target.
pub const NMI_VECTOR: u8 = 2;

impl IpiRequest {
    /// Decodes a 64-bit x2APIC ICR value: vector in bits 0..=7, delivery mode in bits
    /// 8..=10, shorthand in bits 18..=19, destination in bits 32..=63.
    ///
    /// Delivery modes the monitor does not model (SMI, ExtINT, reserved) and INIT level
    /// de-assert, which has no effect on modern processors, decode to [`IpiMode::Ignored`].
    pub fn decode_icr(icr: u64) -> Self {
        let vector = icr as u8;
        let mode = match (icr >> 8) & 0x7 {
            ICR_DELIVERY_FIXED | ICR_DELIVERY_LOWEST => IpiMode::Fixed(vector),
            ICR_DELIVERY_NMI => IpiMode::Nmi,
            ICR_DELIVERY_INIT => {
                if icr & ICR_TRIGGER_LEVEL != 0 && icr & ICR_LEVEL_ASSERT == 0 {
                    IpiMode::Ignored
                } else {
                    IpiMode::Init
                }
            }
            ICR_DELIVERY_STARTUP => IpiMode::Startup(vector),
            _ => IpiMode::Ignored,
        };
        let destination = match (icr >> 18) & 0x3 {
            0 => IpiDestination::Physical((icr >> 32) as u32),
            1 => IpiDestination::SelfOnly,
            2 => IpiDestination::AllIncludingSelf,
            _ => IpiDestination::AllExcludingSelf,
        };
        Self { mode, destination }
    }

    /// Resolves the destination to vCPU ids of a machine with `vcpu_count` vCPUs.
    /// A physical id outside the machine resolves to the empty set.
    pub fn targets(&self, origin: usize, vcpu_count: usize) -> CpuSet {
        let all = CpuSet::first(vcpu_count);
        match self.destination {
            IpiDestination::Physical(id) if (id as usize) < vcpu_count => {
                CpuSet::single(id as usize)
            }
            IpiDestination::Physical(_) => CpuSet::empty(),
            IpiDestination::SelfOnly => CpuSet::single(origin),
            IpiDestination::AllIncludingSelf => all,
            IpiDestination::AllExcludingSelf => all.difference(CpuSet::single(origin)),
        }
    }
}

/// Delivers IPIs between the vCPUs of one machine.
pub struct IpiController;

impl IpiController {
    /// Delivers `mode` from `origin` to every vCPU in `targets`.
    ///
    /// STARTUP to a core that is not suspended and INIT to a core that already is are benign
    /// no-ops. A core's run-loop thread is spawned by its first STARTUP and reused afterwards.
    pub fn handle_ipi<A: AxArchVCpu>(
        machine: &Arc<Machine<A>>,
        origin: usize,
        targets: CpuSet,
        mode: IpiMode,
    ) -> Result<(), ExitError> {
        if mode == IpiMode::Ignored {
            debug!("vcpu {origin}: ignored ICR write");
            return Ok(());
        }
        if targets.is_empty() {
            warn!("vcpu {origin}: {mode:?} IPI has no valid destination");
            return Ok(());
        }
        for id in targets.iter() {
            let Some(target) = machine.vcpu(id) else {
                continue;
            };
            debug!("vcpu {origin}: {mode:?} IPI to vcpu {id}");
            match mode {
                IpiMode::Fixed(vector) => target.queue_interrupt(vector),
                IpiMode::Nmi => target.queue_interrupt(NMI_VECTOR),
                IpiMode::Init => target.request_init(),
                IpiMode::Ignored => {}
                IpiMode::Startup(vector) => {
                    machine
                        .start_vcpu(id, StartupRequest::Vector(vector))
                        .map_err(|e| ExitError::Vcpu {
                            vcpu: id,
                            reason: e.to_string(),
                        })?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icr_decoding() {
        let init = IpiRequest::decode_icr((5 << 8) | ICR_LEVEL_ASSERT | (3 << 32));
        assert_eq!(init.mode, IpiMode::Init);
        assert_eq!(init.destination, IpiDestination::Physical(3));

        let deassert = (5 << 8) | ICR_TRIGGER_LEVEL;
        assert_eq!(IpiRequest::decode_icr(deassert).mode, IpiMode::Ignored);

        let sipi = IpiRequest::decode_icr((6 << 8) | 0x9a | (3 << 18));
        assert_eq!(sipi.mode, IpiMode::Startup(0x9a));
        assert_eq!(sipi.destination, IpiDestination::AllExcludingSelf);

        let lowest = IpiRequest::decode_icr((1 << 8) | 0x30 | (1 << 18));
        assert_eq!(lowest.mode, IpiMode::Fixed(0x30));
        assert_eq!(lowest.destination, IpiDestination::SelfOnly);

        // SMI
        assert_eq!(IpiRequest::decode_icr(2 << 8).mode, IpiMode::Ignored);
    }

    #[test]
    fn destination_resolution() {
        let req = |destination| IpiRequest {
            mode: IpiMode::Fixed(0x20),
            destination,
        };
        assert_eq!(
            req(IpiDestination::AllExcludingSelf).targets(1, 4),
            [0, 2, 3].into_iter().collect()
        );
        assert_eq!(req(IpiDestination::AllIncludingSelf).targets(1, 4).len(), 4);
        assert_eq!(req(IpiDestination::SelfOnly).targets(2, 4), CpuSet::single(2));
        assert_eq!(req(IpiDestination::Physical(9)).targets(0, 4), CpuSet::empty());
    }

    #[test]
    fn cpu_set_operations() {
        let mut set = CpuSet::first(3);
        assert_eq!(set.iter().collect::<Vec<_>>(), [0, 1, 2]);
        set.remove(1);
        assert!(!set.contains(1));
        set.insert(63);
        assert!(set.contains(63));
        assert_eq!(set.len(), 3);
        assert_eq!(CpuSet::first(64).len(), 64);
        assert_eq!(format!("{set:?}"), "{0, 2, 63}");
    }
}
