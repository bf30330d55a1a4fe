//! Latency timing of chain traversals.
//!
//! A measurement is a warmup traversal (untimed, faults pages in and lets the working set settle
//! into whatever cache level it fits) followed by a fixed number of timed hops. Only two clock
//! reads bracket the timed region; nothing is logged or allocated between them.
use crate::error::{ProbeError, Result};
use log::warn;
#[cfg(target_arch = "x86_64")]
use std::time::Duration;
use std::time::Instant;

/// Timed hops needed before fixed clock-read overhead becomes negligible.
pub const MIN_RECOMMENDED_HOPS: usize = 1_000_000;

/// Something that can be walked hop by hop with data-dependent accesses.
pub trait Traversal {
    /// Hops in one complete cycle.
    fn lap(&self) -> usize;

    /// Perform (at least) `hops` hops from the start of the cycle, returning how many were
    /// actually performed.
    fn chase(&self, hops: usize) -> usize;
}

/// Unit a clock reports latencies in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LatencyUnit {
    Nanoseconds,
    Cycles,
}

impl LatencyUnit {
    pub fn suffix(&self) -> &'static str {
        match self {
            LatencyUnit::Nanoseconds => "ns",
            LatencyUnit::Cycles => "cycles",
        }
    }
}

/// A monotonic tick source.
pub trait Clock {
    /// Current reading in clock ticks.
    fn now(&self) -> u64;
    /// Unit of [`Clock::convert`] results.
    fn unit(&self) -> LatencyUnit;
    /// Convert a tick delta into [`Clock::unit`].
    fn convert(&self, ticks: u64) -> f64;
}

impl Clock for Box<dyn Clock> {
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

/// OS monotonic clock, nanosecond ticks.
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        MonotonicClock {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn unit(&self) -> LatencyUnit {
        LatencyUnit::Nanoseconds
    }

    fn convert(&self, ticks: u64) -> f64 {
        ticks as f64
    }
}

/// x86-64 timestamp counter, read between load fences.
///
/// Reports raw counter ticks, or nanoseconds once calibrated against the monotonic clock.
#[cfg(target_arch = "x86_64")]
pub struct CycleCounter {
    ns_per_tick: Option<f64>,
}

#[cfg(target_arch = "x86_64")]
impl CycleCounter {
    /// Report latencies in counter ticks.
    pub fn raw() -> Self {
        CycleCounter { ns_per_tick: None }
    }

    /// Measure the counter frequency over `window` and report latencies in nanoseconds.
    pub fn calibrated(window: Duration) -> Result<Self> {
        let started = Instant::now();
        let start = Self::read();
        while started.elapsed() < window {
            std::hint::spin_loop();
        }
        let ticks = Self::read().saturating_sub(start);
        let elapsed_ns = started.elapsed().as_nanos() as f64;
        if ticks == 0 {
            return Err(ProbeError::TimingUnavailable);
        }
        let ns_per_tick = elapsed_ns / ticks as f64;
        log::info!("timestamp counter runs at {:.3} GHz", 1.0 / ns_per_tick);
        Ok(CycleCounter {
            ns_per_tick: Some(ns_per_tick),
        })
    }

    #[inline(always)]
    #[allow(unused_unsafe)]
    fn read() -> u64 {
        use std::arch::x86_64::{_mm_lfence, _rdtsc};
        // SAFETY: lfence/rdtsc are available on every x86-64 CPU
        unsafe {
            _mm_lfence();
            let tsc = _rdtsc();
            _mm_lfence();
            tsc
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Clock for CycleCounter {
    fn now(&self) -> u64 {
        Self::read()
    }

    fn unit(&self) -> LatencyUnit {
        match self.ns_per_tick {
            Some(_) => LatencyUnit::Nanoseconds,
            None => LatencyUnit::Cycles,
        }
    }

    fn convert(&self, ticks: u64) -> f64 {
        match self.ns_per_tick {
            Some(scale) => ticks as f64 * scale,
            None => ticks as f64,
        }
    }
}

/// Clock capability selected at configuration time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ClockKind {
    /// OS monotonic clock (nanoseconds)
    #[default]
    Monotonic,
    /// Hardware cycle counter (raw cycles)
    Cycles,
    /// Hardware cycle counter converted to nanoseconds
    CyclesNs,
}

impl ClockKind {
    /// Instantiate the clock, failing if the capability isn't available on this target.
    pub fn open(self) -> Result<Box<dyn Clock>> {
        match self {
            ClockKind::Monotonic => Ok(Box::new(MonotonicClock::new())),
            #[cfg(target_arch = "x86_64")]
            ClockKind::Cycles => Ok(Box::new(CycleCounter::raw())),
            #[cfg(target_arch = "x86_64")]
            ClockKind::CyclesNs => Ok(Box::new(CycleCounter::calibrated(
                Duration::from_millis(50),
            )?)),
            #[cfg(not(target_arch = "x86_64"))]
            ClockKind::Cycles | ClockKind::CyclesNs => Err(ProbeError::invalid(
                "cycle counter timing is only available on x86_64",
            )),
        }
    }
}

/// Hop counts for one measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerConfig {
    /// Untimed hops before timing; `None` means one full lap of the chain.
    pub warmup_hops: Option<usize>,
    pub timed_hops: usize,
    /// Timed runs per measurement, the median is reported.
    pub samples: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        TimerConfig {
            warmup_hops: None,
            timed_hops: MIN_RECOMMENDED_HOPS,
            samples: 1,
        }
    }
}

/// Warm up, then time exactly `timed_hops` hops and return the average latency per hop.
pub fn measure<C, T>(clock: &C, chain: &T, warmup_hops: usize, timed_hops: usize) -> Result<f64>
where
    C: Clock + ?Sized,
    T: Traversal + ?Sized,
{
    chain.chase(warmup_hops);
    timed_run(clock, chain, timed_hops)
}

fn timed_run<C, T>(clock: &C, chain: &T, timed_hops: usize) -> Result<f64>
where
    C: Clock + ?Sized,
    T: Traversal + ?Sized,
{
    let start = clock.now();
    let hops = chain.chase(timed_hops);
    let end = clock.now();

    if end <= start || hops == 0 {
        return Err(ProbeError::TimingUnavailable);
    }
    let latency = clock.convert(end - start) / hops as f64;
    if !latency.is_finite() || latency <= 0.0 {
        return Err(ProbeError::TimingUnavailable);
    }
    Ok(latency)
}

/// A clock paired with hop counts, reused for every step of a sweep.
pub struct LatencyTimer<C> {
    clock: C,
    config: TimerConfig,
}

impl<C: Clock> LatencyTimer<C> {
    pub fn new(clock: C, config: TimerConfig) -> Result<Self> {
        if config.timed_hops == 0 {
            return Err(ProbeError::invalid("timed hops must be at least 1"));
        }
        if config.samples == 0 {
            return Err(ProbeError::invalid("samples must be at least 1"));
        }
        if config.timed_hops < MIN_RECOMMENDED_HOPS {
            warn!(
                "{} timed hops may not amortize clock overhead (recommended >= {MIN_RECOMMENDED_HOPS})",
                config.timed_hops
            );
        }
        Ok(LatencyTimer { clock, config })
    }

    pub fn unit(&self) -> LatencyUnit {
        self.clock.unit()
    }

    pub fn config(&self) -> &TimerConfig {
        &self.config
    }

    /// Average latency per hop, the median over the configured samples.
    pub fn measure<T: Traversal + ?Sized>(&self, chain: &T) -> Result<f64> {
        let warmup = self.config.warmup_hops.unwrap_or_else(|| chain.lap());
        chain.chase(warmup);

        let mut samples = Vec::with_capacity(self.config.samples);
        for _ in 0..self.config.samples {
            samples.push(timed_run(&self.clock, chain, self.config.timed_hops)?);
        }
        samples.sort_by(f64::total_cmp);
        Ok(samples[samples.len() / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    /// Advances by a fixed number of ticks on every read.
    struct SteppingClock {
        ticks: Cell<u64>,
        step: u64,
    }

    impl Clock for SteppingClock {
        fn now(&self) -> u64 {
            self.ticks.set(self.ticks.get() + self.step);
            self.ticks.get()
        }

        fn unit(&self) -> LatencyUnit {
            LatencyUnit::Nanoseconds
        }

        fn convert(&self, ticks: u64) -> f64 {
            ticks as f64
        }
    }

    /// Counts hops instead of touching memory.
    struct Counting {
        lap: usize,
        hops: Cell<usize>,
    }

    impl Traversal for Counting {
        fn lap(&self) -> usize {
            self.lap
        }

        fn chase(&self, hops: usize) -> usize {
            self.hops.set(self.hops.get() + hops);
            hops
        }
    }

    fn counting(lap: usize) -> Counting {
        Counting {
            lap,
            hops: Cell::new(0),
        }
    }

    #[test]
    fn average_is_elapsed_over_hops() {
        let clock = SteppingClock {
            ticks: Cell::new(0),
            step: 500,
        };
        let chain = counting(10);
        let latency = measure(&clock, &chain, 10, 100).unwrap();
        assert_eq!(latency, 5.0);
        assert_eq!(chain.hops.get(), 110);
    }

    #[test]
    fn stalled_clock_is_timing_unavailable() {
        let clock = SteppingClock {
            ticks: Cell::new(42),
            step: 0,
        };
        let err = measure(&clock, &counting(4), 4, 1000).err().unwrap();
        assert!(matches!(err, ProbeError::TimingUnavailable));
    }

    #[test]
    fn default_warmup_is_one_lap() {
        let clock = SteppingClock {
            ticks: Cell::new(0),
            step: 1,
        };
        let timer = LatencyTimer::new(
            clock,
            TimerConfig {
                warmup_hops: None,
                timed_hops: 8,
                samples: 3,
            },
        )
        .unwrap();
        let chain = counting(37);
        timer.measure(&chain).unwrap();
        assert_eq!(chain.hops.get(), 37 + 3 * 8);
    }

    #[test]
    fn zero_hops_or_samples_are_invalid() {
        let zero_hops = TimerConfig {
            timed_hops: 0,
            ..TimerConfig::default()
        };
        assert!(LatencyTimer::new(MonotonicClock::new(), zero_hops).is_err());
        let zero_samples = TimerConfig {
            samples: 0,
            ..TimerConfig::default()
        };
        assert!(LatencyTimer::new(MonotonicClock::new(), zero_samples).is_err());
    }

    #[test]
    fn monotonic_clock_moves_forward() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(1));
        assert!(clock.now() > a);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn cycle_counter_advances() {
        let counter = CycleCounter::raw();
        let a = counter.now();
        std::thread::sleep(Duration::from_millis(1));
        assert!(counter.now() > a);
        assert_eq!(counter.unit(), LatencyUnit::Cycles);
    }
}
