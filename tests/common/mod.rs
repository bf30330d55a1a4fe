//! Shared fakes for driving the timer and sweep controller deterministically.
#![allow(dead_code)]

use memprobe_rs::environment::Affinity;
use memprobe_rs::timer::{Clock, LatencyUnit};
use memprobe_rs::{ProbeError, Result};
use std::cell::Cell;

/// Advances by `step` ticks (one tick = 1 ns) on every read.
pub struct SteppingClock {
    ticks: Cell<u64>,
    step: u64,
}

impl SteppingClock {
    pub fn new(step: u64) -> Self {
        SteppingClock {
            ticks: Cell::new(0),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> u64 {
        let now = self.ticks.get() + self.step;
        self.ticks.set(now);
        now
    }

    fn unit(&self) -> LatencyUnit {
        LatencyUnit::Nanoseconds
    }

    fn convert(&self, ticks: u64) -> f64 {
        ticks as f64
    }
}

/// Frozen for the first `stalled_reads` reads, then advances by `step` per read.
pub struct StallingClock {
    reads: Cell<u64>,
    stalled_reads: u64,
    step: u64,
}

impl StallingClock {
    pub fn new(stalled_reads: u64, step: u64) -> Self {
        StallingClock {
            reads: Cell::new(0),
            stalled_reads,
            step,
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads.get()
    }
}

impl Clock for StallingClock {
    fn now(&self) -> u64 {
        let reads = self.reads.get() + 1;
        self.reads.set(reads);
        reads.saturating_sub(self.stalled_reads) * self.step
    }

    fn unit(&self) -> LatencyUnit {
        LatencyUnit::Cycles
    }

    fn convert(&self, ticks: u64) -> f64 {
        ticks as f64
    }
}

impl Clock for &StallingClock {
    fn now(&self) -> u64 {
        (**self).now()
    }

    fn unit(&self) -> LatencyUnit {
        (**self).unit()
    }

    fn convert(&self, ticks: u64) -> f64 {
        (**self).convert(ticks)
    }
}

/// Never reads a new value.
pub struct FrozenClock;

impl Clock for FrozenClock {
    fn now(&self) -> u64 {
        42
    }

    fn unit(&self) -> LatencyUnit {
        LatencyUnit::Nanoseconds
    }

    fn convert(&self, ticks: u64) -> f64 {
        ticks as f64
    }
}

pub struct RefusingAffinity;

impl Affinity for RefusingAffinity {
    fn pin_to_core(&self, core: usize) -> Result<()> {
        Err(ProbeError::AffinityFailure { core })
    }
}
