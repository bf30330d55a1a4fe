//! # Sweep
//!
//! A sweep walks one parameter (working-set size, stride, page count, way count or code size)
//! across a [`ParamSpace`] and produces one [`Measurement`] per value, in increasing order. Each
//! step runs `Allocate -> Link -> Warmup -> Time -> Release -> Emit` on a buffer it owns alone;
//! the buffer is dropped before the next step begins.
//!
//! Step failures (allocation refused, buffer too small for two cells, clock not advancing) don't
//! stop the sweep: they are recorded as [`Outcome::Skipped`] and the next value is tried.
//! Configuration errors are caught before the first step.
use crate::buffer::{ProbeBuffer, page_size};
use crate::chain::{self, LinkPolicy, WORD};
use crate::environment::{self, Affinity, Pinning};
use crate::error::{ProbeError, Result, SkipReason};
use crate::timer::{Clock, LatencyTimer, LatencyUnit};
use log::{debug, info, trace, warn};

/// One contiguous arithmetic scan, `start..=end` by `step`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub end: usize,
    pub step: usize,
}

/// Parameter domain of a sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamSpace {
    /// `start`, doubling while `<= max`
    Geometric { start: usize, max: usize },
    /// Concatenated windows, coarse then fine around an expected boundary
    Windows(Vec<Window>),
    /// Explicit, hardware-meaningful values
    List(Vec<usize>),
}

impl ParamSpace {
    /// A literal table cut at its first zero.
    pub fn terminated(values: &[usize]) -> Self {
        ParamSpace::List(values.iter().copied().take_while(|&v| v != 0).collect())
    }

    /// Every value in sweep order.
    ///
    /// Values must be positive and strictly increasing, otherwise the space is rejected with
    /// [`ProbeError::InvalidConfiguration`].
    pub fn values(&self) -> Result<Vec<usize>> {
        let values = match self {
            ParamSpace::Geometric { start, max } => {
                if *start == 0 {
                    return Err(ProbeError::invalid("geometric sweep must start above zero"));
                }
                let mut values = Vec::new();
                let mut value = Some(*start);
                while let Some(v) = value.filter(|v| v <= max) {
                    values.push(v);
                    value = v.checked_mul(2);
                }
                values
            }
            ParamSpace::Windows(windows) => {
                let mut values = Vec::new();
                for w in windows {
                    if w.step == 0 || w.start > w.end {
                        return Err(ProbeError::invalid(format!(
                            "window {}..={} step {} is empty",
                            w.start, w.end, w.step
                        )));
                    }
                    values.extend((w.start..=w.end).step_by(w.step));
                }
                values
            }
            ParamSpace::List(values) => values.clone(),
        };

        if values.is_empty() {
            return Err(ProbeError::invalid("parameter space is empty"));
        }
        if values.contains(&0) {
            return Err(ProbeError::invalid("sweep parameters must be positive"));
        }
        if values.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(ProbeError::invalid(
                "sweep parameters must be strictly increasing",
            ));
        }
        Ok(values)
    }

    /// Working-set sizes around common L1/L2/L3 capacities, 4 KiB to 64 MiB.
    pub fn cache_boundaries() -> Self {
        const KIB: usize = 1024;
        ParamSpace::terminated(&[
            4 * KIB, 8 * KIB, 16 * KIB, 24 * KIB, 32 * KIB, 40 * KIB, 48 * KIB, 56 * KIB,
            64 * KIB, 80 * KIB, 96 * KIB, 128 * KIB, 256 * KIB, 512 * KIB, 768 * KIB,
            1024 * KIB, 1280 * KIB, 1536 * KIB, 2048 * KIB, 3072 * KIB, 4096 * KIB, 8192 * KIB,
            12288 * KIB, 16384 * KIB, 20480 * KIB, 24576 * KIB, 28672 * KIB, 32768 * KIB,
            49152 * KIB, 65536 * KIB, 0,
        ])
    }

    /// Fine scans across the L1, L2 and L3 transitions.
    pub fn boundary_windows() -> Self {
        const KIB: usize = 1024;
        ParamSpace::Windows(vec![
            Window { start: 16 * KIB, end: 128 * KIB, step: 4 * KIB },
            Window { start: 256 * KIB, end: 3072 * KIB, step: 64 * KIB },
            Window { start: 4096 * KIB, end: 65536 * KIB, step: 1024 * KIB },
        ])
    }

    /// TLB entry counts worth probing.
    pub fn tlb_entries() -> Self {
        ParamSpace::terminated(&[
            8, 16, 32, 48, 64, 72, 96, 128, 256, 512, 1024, 1500, 1536, 1600, 2000, 2048, 2100,
            2500, 0,
        ])
    }
}

/// Data-chain linking for modes that cover the whole buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Linking {
    Sequential { stride_cells: usize },
    Random { seed: u64 },
}

impl Linking {
    pub fn policy(self) -> LinkPolicy {
        match self {
            Linking::Sequential { stride_cells } => LinkPolicy::Sequential { stride_cells },
            Linking::Random { seed } => LinkPolicy::Random { seed },
        }
    }
}

/// Buffer extent of a stride sweep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Footprint {
    /// Same number of bytes at every stride
    Bytes(usize),
    /// Same number of cells (accesses per lap) at every stride
    Cells(usize),
}

/// What the swept parameter means.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parameter {
    SizeBytes,
    StrideBytes,
    Entries,
    Ways,
    CodeBytes,
}

impl Parameter {
    pub fn label(&self) -> &'static str {
        match self {
            Parameter::SizeBytes => "size",
            Parameter::StrideBytes => "stride_bytes",
            Parameter::Entries => "entries",
            Parameter::Ways => "ways",
            Parameter::CodeBytes => "code_size",
        }
    }

    /// Whether the parameter is a byte quantity worth printing with a binary unit.
    pub fn is_size(&self) -> bool {
        matches!(self, Parameter::SizeBytes | Parameter::CodeBytes)
    }
}

/// Probe mode: how a parameter value turns into a buffer and a chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Probe {
    /// Parameter is the working-set size in bytes.
    WorkingSet { cell_size: usize, linking: Linking },
    /// Parameter is the stride in bytes; every stride is one cell, walked in order.
    Stride { footprint: Footprint },
    /// Parameter is the number of pages touched, one cell per page.
    Pages { page_size: usize, linking: Linking },
    /// Parameter is the number of ways in a conflict set `stride_bytes` apart.
    Ways { stride_bytes: usize },
    /// Parameter is the size of an executable code chain in bytes.
    Code { block_size: usize, linking: Linking },
}

impl Probe {
    pub fn parameter(&self) -> Parameter {
        match self {
            Probe::WorkingSet { .. } => Parameter::SizeBytes,
            Probe::Stride { .. } => Parameter::StrideBytes,
            Probe::Pages { .. } => Parameter::Entries,
            Probe::Ways { .. } => Parameter::Ways,
            Probe::Code { .. } => Parameter::CodeBytes,
        }
    }

    fn validate(&self, params: &[usize]) -> Result<()> {
        let word_multiple = |bytes: usize, what: &str| {
            if bytes < WORD || bytes % WORD != 0 {
                Err(ProbeError::invalid(format!(
                    "{what} of {bytes} bytes must be a positive multiple of {WORD}"
                )))
            } else {
                Ok(())
            }
        };
        let linking = |linking: &Linking| match linking {
            Linking::Sequential { stride_cells: 0 } => Err(ProbeError::invalid(
                "sequential stride must be at least one cell",
            )),
            _ => Ok(()),
        };

        match self {
            Probe::WorkingSet { cell_size, linking: l } => {
                word_multiple(*cell_size, "cell size")?;
                linking(l)
            }
            Probe::Stride { .. } => params
                .iter()
                .try_for_each(|&stride| word_multiple(stride, "stride")),
            Probe::Pages { page_size, linking: l } => {
                word_multiple(*page_size, "page size")?;
                linking(l)
            }
            Probe::Ways { stride_bytes } if *stride_bytes < WORD => Err(ProbeError::invalid(
                format!("stride of {stride_bytes} bytes cannot hold a {WORD} byte link"),
            )),
            Probe::Ways { .. } => Ok(()),
            Probe::Code { linking: l, .. } => {
                if cfg!(not(all(target_arch = "x86_64", unix))) {
                    return Err(ProbeError::invalid(
                        "instruction-cache chains need x86_64 and executable mappings",
                    ));
                }
                linking(l)
            }
        }
    }
}

/// A probe mode and the values to sweep it over.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SweepPlan {
    pub probe: Probe,
    pub params: ParamSpace,
}

impl SweepPlan {
    /// Random-chain working-set sweep over 64-byte cells.
    pub fn working_set(params: ParamSpace, seed: u64) -> Self {
        SweepPlan {
            probe: Probe::WorkingSet {
                cell_size: 64,
                linking: Linking::Random { seed },
            },
            params,
        }
    }

    /// Line-size probe: strides 16..=512 bytes over a 64 MiB region.
    pub fn line_size() -> Self {
        SweepPlan {
            probe: Probe::Stride {
                footprint: Footprint::Bytes(64 * 1024 * 1024),
            },
            params: ParamSpace::Geometric { start: 16, max: 512 },
        }
    }

    /// Page-size probe: 10 000 accesses per lap at strides 512 B..16 KiB.
    pub fn page_size() -> Self {
        SweepPlan {
            probe: Probe::Stride {
                footprint: Footprint::Cells(10_000),
            },
            params: ParamSpace::terminated(&[512, 1024, 2048, 4096, 8192, 16384, 0]),
        }
    }

    /// TLB reach probe: one access per OS page over the usual entry counts.
    pub fn tlb() -> Self {
        SweepPlan {
            probe: Probe::Pages {
                page_size: page_size(),
                linking: Linking::Sequential { stride_cells: 1 },
            },
            params: ParamSpace::tlb_entries(),
        }
    }

    /// Associativity probe: conflict sets of 1..=`max_ways` lines `stride_bytes` apart.
    pub fn associativity(stride_bytes: usize, max_ways: usize) -> Result<Self> {
        if max_ways == 0 {
            return Err(ProbeError::invalid("maximum way count must be at least 1"));
        }
        let probe = Probe::Ways { stride_bytes };
        probe.validate(&[])?;
        Ok(SweepPlan {
            probe,
            params: ParamSpace::Windows(vec![Window {
                start: 1,
                end: max_ways,
                step: 1,
            }]),
        })
    }

    /// Instruction-cache probe: 2..=128 KiB of code in 64-byte blocks.
    pub fn instruction_cache() -> Self {
        SweepPlan {
            probe: Probe::Code {
                block_size: 64,
                linking: Linking::Sequential { stride_cells: 1 },
            },
            params: ParamSpace::Windows(vec![Window {
                start: 2 * 1024,
                end: 128 * 1024,
                step: 2 * 1024,
            }]),
        }
    }
}

/// Result of one sweep step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outcome {
    /// Average latency per access, in the timer's unit
    Latency(f64),
    Skipped(SkipReason),
}

/// One emitted (parameter, latency) point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Measurement {
    pub param: usize,
    pub outcome: Outcome,
}

impl Measurement {
    pub fn latency(&self) -> Option<f64> {
        match self.outcome {
            Outcome::Latency(latency) => Some(latency),
            Outcome::Skipped(_) => None,
        }
    }
}

/// Drives sweep plans step by step on the calling thread.
pub struct SweepController<C> {
    timer: LatencyTimer<C>,
    pinning: Option<(Box<dyn Affinity>, Pinning)>,
}

impl<C: Clock> SweepController<C> {
    pub fn new(timer: LatencyTimer<C>) -> Self {
        SweepController {
            timer,
            pinning: None,
        }
    }

    /// Pin through `affinity` once at the start of every [`run`](Self::run).
    pub fn with_pinning(mut self, affinity: Box<dyn Affinity>, pinning: Pinning) -> Self {
        self.pinning = Some((affinity, pinning));
        self
    }

    pub fn unit(&self) -> LatencyUnit {
        self.timer.unit()
    }

    /// Run `plan`, collecting every measurement.
    pub fn run(&self, plan: &SweepPlan) -> Result<Vec<Measurement>> {
        self.run_with(plan, &mut |_| Ok(()))
    }

    /// Run `plan`, handing each measurement to `emit` as soon as its step completes.
    pub fn run_with(
        &self,
        plan: &SweepPlan,
        emit: &mut dyn FnMut(&Measurement) -> Result<()>,
    ) -> Result<Vec<Measurement>> {
        let params = plan.params.values()?;
        plan.probe.validate(&params)?;
        // values() guarantees a non-empty increasing sequence
        let max_param = params[params.len() - 1];

        if let Some((affinity, pinning)) = &self.pinning {
            environment::pin(affinity.as_ref(), pinning)?;
        }

        info!(
            "sweeping {} over {} values with {:?}",
            plan.probe.parameter().label(),
            params.len(),
            plan.probe
        );

        let mut measurements = Vec::with_capacity(params.len());
        for param in params {
            let outcome = match self.step_with_retry(&plan.probe, param, max_param) {
                Ok(latency) => Outcome::Latency(latency),
                Err(err) => match err.skip_reason() {
                    Some(reason) => {
                        warn!(
                            "{} {param}: step skipped, {err}",
                            plan.probe.parameter().label()
                        );
                        Outcome::Skipped(reason)
                    }
                    None => return Err(err),
                },
            };
            let measurement = Measurement { param, outcome };
            trace!("{param}: emit {outcome:?}");
            emit(&measurement)?;
            measurements.push(measurement);
        }
        Ok(measurements)
    }

    fn step_with_retry(&self, probe: &Probe, param: usize, max_param: usize) -> Result<f64> {
        match self.step(probe, param, max_param) {
            Err(ProbeError::TimingUnavailable) => {
                warn!("{param}: clock did not advance, retrying once");
                self.step(probe, param, max_param)
            }
            other => other,
        }
    }

    /// Allocate, link, warm up and time one parameter value; the buffer is released on return.
    fn step(&self, probe: &Probe, param: usize, max_param: usize) -> Result<f64> {
        let too_big = || ProbeError::AllocationFailure {
            size_bytes: usize::MAX,
        };

        let (bytes, cell_size, policy) = match *probe {
            Probe::WorkingSet { cell_size, linking } => (param, cell_size, linking.policy()),
            Probe::Stride { footprint } => {
                let bytes = match footprint {
                    Footprint::Bytes(bytes) => bytes,
                    Footprint::Cells(cells) => cells.checked_mul(param).ok_or_else(too_big)?,
                };
                (bytes, param, LinkPolicy::Sequential { stride_cells: 1 })
            }
            Probe::Pages { page_size, linking } => (
                param.checked_mul(page_size).ok_or_else(too_big)?,
                page_size,
                linking.policy(),
            ),
            Probe::Ways { stride_bytes } => (
                max_param
                    .max(2)
                    .checked_mul(stride_bytes)
                    .ok_or_else(too_big)?,
                stride_bytes,
                LinkPolicy::ConflictSet { ways: param },
            ),
            Probe::Code {
                block_size,
                linking,
            } => return self.code_step(param, block_size, linking),
        };

        trace!("{param}: allocate {bytes} bytes");
        let mut buffer = ProbeBuffer::allocate(bytes)?;
        trace!("{param}: link {cell_size} byte cells");
        let chain = chain::build(&mut buffer, cell_size, policy)?;
        let latency = self.timer.measure(&chain)?;
        debug!("{param}: {latency:.3} {}", self.timer.unit().suffix());
        Ok(latency)
    }

    #[cfg(all(target_arch = "x86_64", unix))]
    fn code_step(&self, param: usize, block_size: usize, linking: Linking) -> Result<f64> {
        let chain = crate::icache::build(param, block_size, linking.policy())?;
        let latency = self.timer.measure(&chain)?;
        debug!("{param}: {latency:.3} {} per block", self.timer.unit().suffix());
        Ok(latency)
    }

    #[cfg(not(all(target_arch = "x86_64", unix)))]
    fn code_step(&self, _param: usize, _block_size: usize, _linking: Linking) -> Result<f64> {
        Err(ProbeError::invalid(
            "instruction-cache chains need x86_64 and executable mappings",
        ))
    }
}
