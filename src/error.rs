//! Error taxonomy shared by every probe stage.
//!
//! Step-level failures (allocation, too few cells, unusable timing) never abort a sweep; the
//! controller turns them into [`SkipReason`] sentinels. Everything else is fatal to the caller.
use std::fmt;
use std::io;
use thiserror::Error;

/// Errors produced while allocating, linking, timing or reporting a probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The OS refused the memory request for a probe buffer.
    #[error("failed to allocate a {size_bytes} byte probe buffer")]
    AllocationFailure { size_bytes: usize },

    /// The buffer cannot hold the cells a chain needs.
    #[error(
        "{size_bytes} bytes holds {cells} cell(s) of {cell_size} bytes, need at least {required}"
    )]
    InsufficientCells {
        size_bytes: usize,
        cell_size: usize,
        cells: usize,
        required: usize,
    },

    /// The clock did not advance across the timed traversal.
    #[error("clock reported no forward progress across the timed traversal")]
    TimingUnavailable,

    /// Bad user or caller input, detected before any measurement starts.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Pinning the current thread to a logical core failed.
    #[error("could not pin execution to logical core {core}")]
    AffinityFailure { core: usize },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl ProbeError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        ProbeError::InvalidConfiguration(msg.into())
    }

    /// Maps failures that only invalidate a single sweep step to their sentinel.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            ProbeError::AllocationFailure { .. } => Some(SkipReason::AllocationFailure),
            ProbeError::InsufficientCells { .. } => Some(SkipReason::InsufficientCells),
            ProbeError::TimingUnavailable => Some(SkipReason::TimingUnavailable),
            _ => None,
        }
    }
}

/// Why a sweep step produced no latency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    AllocationFailure,
    InsufficientCells,
    TimingUnavailable,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::AllocationFailure => "allocation-failure",
            SkipReason::InsufficientCells => "insufficient-cells",
            SkipReason::TimingUnavailable => "timing-unavailable",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;
