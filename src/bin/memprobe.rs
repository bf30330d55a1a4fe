//! Memory hierarchy latency prober.
//!
//! Every probe mode is one sweep of the pointer-chasing engine with a different parameter:
//! working-set size, stride, page count, conflict-set ways or code size. Rows go to stdout in the
//! selected format; diagnostics go to stderr through the logger (`RUST_LOG` to adjust).

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use std::process;

use memprobe_rs::buffer::page_size;
use memprobe_rs::environment::{self, CoreAffinity, PinPolicy, Pinning};
use memprobe_rs::report::{Columns, Format, Report, stdout_reporter};
use memprobe_rs::sweep::{Linking, Measurement, ParamSpace, Probe, SweepController, SweepPlan};
use memprobe_rs::timer::{ClockKind, LatencyTimer, MIN_RECOMMENDED_HOPS, TimerConfig};
use memprobe_rs::{Result, parse_size, topology};

// use faster/smaller `mimalloc` allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Fisher-Yates seed used when none is given, so repeated runs walk the same permutation
const DEFAULT_SEED: u64 = 0xDEAD_BEEF;

#[derive(Parser, Debug)]
#[command(
    name = "memprobe",
    version,
    about = "Measure memory hierarchy latencies by pointer chasing",
    long_about = "Measure memory hierarchy latencies by pointer chasing.\n\nEach mode sweeps one parameter and prints (parameter, latency) rows; cache and TLB boundaries show up as steps in the curve.\n\nExamples:\n  memprobe size --preset boundaries --core 2\n  memprobe line --format csv > line.csv\n  memprobe assoc 4096 --max-ways 24\n  memprobe topology"
)]
struct Cli {
    #[command(flatten)]
    opts: Options,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct Options {
    /// Pin the probe thread to this logical core before sweeping.
    #[arg(long, global = true)]
    core: Option<usize>,

    /// Abort instead of sweeping unpinned when pinning fails.
    #[arg(long, global = true, requires = "core")]
    require_pin: bool,

    /// Run the probe thread at maximum scheduling priority.
    #[arg(long, global = true)]
    max_priority: bool,

    /// Time source for measurements.
    #[arg(long, global = true, value_enum, default_value_t = ClockKind::Monotonic)]
    clock: ClockKind,

    /// Timed hops per sample.
    #[arg(long, global = true, default_value_t = MIN_RECOMMENDED_HOPS)]
    hops: usize,

    /// Untimed hops before timing (default: one full lap of the chain).
    #[arg(long, global = true)]
    warmup: Option<usize>,

    /// Timed samples per step; the median is reported.
    #[arg(long, global = true, default_value_t = 1)]
    samples: usize,

    /// Output format.
    #[arg(long, global = true, value_enum, env = "MEMPROBE_FORMAT", default_value_t = Format::Plain)]
    format: Format,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Working-set size sweep (cache capacities).
    Size {
        /// Smallest working set of the doubling sweep.
        #[arg(long, default_value = "4K", value_parser = size_arg)]
        min: usize,

        /// Largest working set of the doubling sweep.
        #[arg(long, default_value = "256M", value_parser = size_arg)]
        max: usize,

        /// Use a built-in list of sizes instead of doubling.
        #[arg(long, value_enum, conflicts_with = "list")]
        preset: Option<Preset>,

        /// Explicit comma separated sizes, e.g. `32K,48K,1M`.
        #[arg(long, value_delimiter = ',', value_parser = size_arg)]
        list: Vec<usize>,

        /// Bytes per chain cell.
        #[arg(long, default_value = "64", value_parser = size_arg)]
        cell_size: usize,

        /// Walk cells in address order instead of a random permutation.
        #[arg(long)]
        sequential: bool,

        /// Seed for the random permutation.
        #[arg(long, default_value_t = DEFAULT_SEED, conflicts_with = "sequential")]
        seed: u64,
    },

    /// Stride sweep over a 64 MiB region (cache line size).
    Line,

    /// Stride sweep over 10 000 accesses (page size).
    Page,

    /// Page-count sweep, one access per page (TLB reach).
    Tlb,

    /// Conflict-set sweep at a fixed stride (associativity).
    Assoc {
        /// Bytes between conflicting lines, typically a power of two such as 4096.
        #[arg(allow_negative_numbers = true)]
        stride: i64,

        /// Largest conflict set to try.
        #[arg(long, default_value_t = 32)]
        max_ways: usize,
    },

    /// Code-size sweep through chained jump blocks (instruction cache).
    Icache,

    /// Print the cache topology the OS reports.
    Topology {
        /// Logical CPU to describe.
        #[arg(long, default_value_t = 0)]
        cpu: usize,
    },

    /// Print TLB descriptors from the processor's identification leaves.
    TlbInfo,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Preset {
    /// Sizes around common L1/L2/L3 capacities
    Boundaries,
    /// Fine scans across each expected transition
    Fine,
}

fn size_arg(text: &str) -> std::result::Result<usize, String> {
    parse_size(text).map_err(|err| err.to_string())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        error!("{err}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let opts = cli.opts;
    match cli.command {
        Commands::Size {
            min,
            max,
            preset,
            list,
            cell_size,
            sequential,
            seed,
        } => {
            let params = match (preset, list.is_empty()) {
                (_, false) => ParamSpace::List(list),
                (Some(Preset::Boundaries), true) => ParamSpace::cache_boundaries(),
                (Some(Preset::Fine), true) => ParamSpace::boundary_windows(),
                (None, true) => ParamSpace::Geometric { start: min, max },
            };
            let linking = if sequential {
                Linking::Sequential { stride_cells: 1 }
            } else {
                Linking::Random { seed }
            };
            sweep(
                &opts,
                SweepPlan {
                    probe: Probe::WorkingSet { cell_size, linking },
                    params,
                },
            )
        }
        Commands::Line => sweep(&opts, SweepPlan::line_size()),
        Commands::Page => sweep(&opts, SweepPlan::page_size()),
        Commands::Tlb => sweep(&opts, SweepPlan::tlb()),
        Commands::Assoc { stride, max_ways } => {
            if stride <= 0 {
                usage_error(&format!("stride must be positive, got {stride}"));
            }
            let plan = usize::try_from(stride)
                .map_err(|err| err.to_string())
                .and_then(|stride| {
                    SweepPlan::associativity(stride, max_ways).map_err(|err| err.to_string())
                });
            match plan {
                Ok(plan) => sweep(&opts, plan),
                Err(msg) => usage_error(&msg),
            }
        }
        Commands::Icache => sweep(&opts, SweepPlan::instruction_cache()),
        Commands::Topology { cpu } => {
            let levels = topology::cache_levels(cpu)?;
            if levels.is_empty() {
                warn!("no cache information exposed for cpu{cpu}");
            }
            println!("{}", topology::render(&levels, page_size()));
            Ok(())
        }
        Commands::TlbInfo => tlb_info(),
    }
}

/// Print `msg` with the usage line and exit before any measurement.
fn usage_error(msg: &str) -> ! {
    eprintln!("error: {msg}\n\n{}", Cli::command().render_usage());
    process::exit(1);
}

fn sweep(opts: &Options, plan: SweepPlan) -> Result<()> {
    if opts.max_priority {
        environment::raise_priority();
    }

    let timer = LatencyTimer::new(
        opts.clock.open()?,
        TimerConfig {
            warmup_hops: opts.warmup,
            timed_hops: opts.hops,
            samples: opts.samples,
        },
    )?;
    let mut controller = SweepController::new(timer);
    if let Some(core) = opts.core {
        let policy = if opts.require_pin {
            PinPolicy::Required
        } else {
            PinPolicy::BestEffort
        };
        controller = controller.with_pinning(Box::new(CoreAffinity), Pinning { core, policy });
    }

    info!(
        "{:?} clock, {} timed hops x {} sample(s) per step",
        opts.clock, opts.hops, opts.samples
    );

    let mut report = stdout_reporter(opts.format);
    report.begin(&Columns {
        parameter: plan.probe.parameter(),
        unit: controller.unit(),
    })?;
    let measurements = controller.run_with(&plan, &mut |m: &Measurement| report.emit(m))?;
    report.finish()?;

    let skipped = measurements.iter().filter(|m| m.latency().is_none()).count();
    if skipped > 0 {
        warn!("{skipped} of {} steps skipped", measurements.len());
    }
    Ok(())
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn tlb_info() -> Result<()> {
    for line in memprobe_rs::vendor::tlb_report() {
        println!("{line}");
    }
    Ok(())
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn tlb_info() -> Result<()> {
    Err(memprobe_rs::ProbeError::InvalidConfiguration(
        "TLB descriptors are only decoded on x86 processors".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn assoc_requires_stride() {
        assert!(Cli::try_parse_from(["memprobe", "assoc"]).is_err());
    }

    #[test]
    fn assoc_accepts_negative_stride_for_later_rejection() {
        let cli = Cli::try_parse_from(["memprobe", "assoc", "-4096"]).unwrap();
        assert!(matches!(cli.command, Commands::Assoc { stride: -4096, .. }));
    }

    #[test]
    fn sizes_take_suffixes() {
        let cli = Cli::try_parse_from(["memprobe", "size", "--min", "32K", "--max", "4M"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Size {
                min: 32768,
                max: 4194304,
                ..
            }
        ));
    }

    #[test]
    fn global_options_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "memprobe", "line", "--core", "3", "--require-pin", "--format", "csv",
        ])
        .unwrap();
        assert_eq!(cli.opts.core, Some(3));
        assert!(cli.opts.require_pin);
        assert_eq!(cli.opts.format, Format::Csv);
    }

    #[test]
    fn require_pin_needs_core() {
        assert!(Cli::try_parse_from(["memprobe", "line", "--require-pin"]).is_err());
    }
}
