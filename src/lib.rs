//! Pointer-chasing probes for characterizing a CPU's memory hierarchy.
//!
//! A [`sweep::SweepController`] walks one parameter across a [`sweep::ParamSpace`]; for every
//! value it allocates a fresh [`buffer::ProbeBuffer`], links it into a single-cycle
//! [`chain::Chain`], and times dependent loads along it with a [`timer::LatencyTimer`]. The
//! resulting (parameter, latency) curve is handed to a [`report::Report`]. Reading cache
//! boundaries off the curve is left to whoever reads it.
pub mod buffer;
pub mod chain;
pub mod environment;
pub mod error;
#[cfg(all(target_arch = "x86_64", unix))]
pub mod icache;
pub mod report;
pub mod sweep;
pub mod timer;
pub mod topology;
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub mod vendor;

pub use error::{ProbeError, Result};

const KB: u64 = 1024;
const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;

/// Convert number of bytes to formatted string, whole units without decimals
pub fn format_size(bytes: u64) -> String {
    let (scale, unit) = if bytes >= GB {
        (GB, "GiB")
    } else if bytes >= MB {
        (MB, "MiB")
    } else if bytes >= KB {
        (KB, "KiB")
    } else {
        return format!("{bytes} B");
    };

    if bytes % scale == 0 {
        format!("{} {unit}", bytes / scale)
    } else {
        format!("{:.2} {unit}", bytes as f64 / scale as f64)
    }
}

/// Parse a byte count with an optional binary suffix: `4096`, `32K`, `32KiB`, `4M`, `1G`.
pub fn parse_size(text: &str) -> Result<usize> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, suffix) = text.split_at(split);
    let invalid = || ProbeError::InvalidConfiguration(format!("unrecognized size {text:?}"));

    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let scale = match suffix.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => KB,
        "M" | "MB" | "MIB" => MB,
        "G" | "GB" | "GIB" => GB,
        _ => return Err(invalid()),
    };
    value
        .checked_mul(scale)
        .and_then(|bytes| usize::try_from(bytes).ok())
        .ok_or_else(invalid)
}
