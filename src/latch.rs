use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::ipi::CpuSet;

/// Countdown latch for a machine-wide pause.
///
/// The coordinator creates one latch per pause request naming the vCPUs it waits for. Each
/// of them calls [`PauseLatch::arrive`] once it is parked at a safe point (or has gone
/// suspended); the coordinator blocks in [`PauseLatch::wait`] with a deadline.
#[derive(Debug)]
pub struct PauseLatch {
    expected: CpuSet,
    arrived: Mutex<CpuSet>,
    cond: Condvar,
}

impl PauseLatch {
    pub fn new(expected: CpuSet) -> Self {
        Self {
            expected,
            arrived: Mutex::new(CpuSet::empty()),
            cond: Condvar::new(),
        }
    }

    /// The vCPUs this latch waits for.
    pub fn expected(&self) -> CpuSet {
        self.expected
    }

    /// Records that `vcpu` is quiesced. Idempotent; ids outside the expected set are ignored.
    pub fn arrive(&self, vcpu: usize) {
        if !self.expected.contains(vcpu) {
            return;
        }
        let mut arrived = self.arrived.lock();
        arrived.insert(vcpu);
        if *arrived == self.expected {
            self.cond.notify_all();
        }
    }

    /// Waits until every expected vCPU arrived, or `timeout` elapsed. On timeout returns the
    /// vCPUs that never arrived.
    pub fn wait(&self, timeout: Duration) -> Result<(), CpuSet> {
        let deadline = Instant::now() + timeout;
        let mut arrived = self.arrived.lock();
        while *arrived != self.expected {
            if self.cond.wait_until(&mut arrived, deadline).timed_out() {
                break;
            }
        }
        let missing = self.expected.difference(*arrived);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn completes_when_all_arrive() {
        let latch = Arc::new(PauseLatch::new(CpuSet::first(4)));
        let handles: Vec<_> = (0..4)
            .map(|id| {
                let latch = latch.clone();
                thread::spawn(move || {
                    latch.arrive(id);
                    latch.arrive(id);
                })
            })
            .collect();
        assert_eq!(latch.wait(Duration::from_secs(10)), Ok(()));
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn reports_missing_on_timeout() {
        let latch = PauseLatch::new(CpuSet::first(3));
        latch.arrive(0);
        latch.arrive(2);
        latch.arrive(7);
        assert_eq!(latch.wait(Duration::from_millis(20)), Err(CpuSet::single(1)));
    }

    #[test]
    fn empty_latch_is_open() {
        let latch = PauseLatch::new(CpuSet::empty());
        assert_eq!(latch.wait(Duration::ZERO), Ok(()));
    }
}
