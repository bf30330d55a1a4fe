//! One-time execution environment setup before a sweep: core pinning and thread priority.
//!
//! Both touch process-wide scheduler state, so they are explicit calls with a result rather than
//! ambient configuration, and they happen before the first step, never during one.
use crate::error::{ProbeError, Result};
use log::{info, warn};

/// Pins the current thread to a logical core.
pub trait Affinity {
    fn pin_to_core(&self, core: usize) -> Result<()>;
}

/// [`Affinity`] backed by the OS scheduler through `core_affinity`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CoreAffinity;

impl Affinity for CoreAffinity {
    fn pin_to_core(&self, core: usize) -> Result<()> {
        let known = core_affinity::get_core_ids()
            .map(|ids| ids.iter().any(|id| id.id == core))
            .unwrap_or(true);
        if !known || !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
            return Err(ProbeError::AffinityFailure { core });
        }
        Ok(())
    }
}

/// What to do when pinning fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PinPolicy {
    /// Log and keep going unpinned
    #[default]
    BestEffort,
    /// Abort before any measurement
    Required,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pinning {
    pub core: usize,
    pub policy: PinPolicy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinStatus {
    Pinned(usize),
    Unpinned,
}

/// Apply `pinning` through `affinity`, honouring its failure policy.
pub fn pin(affinity: &dyn Affinity, pinning: &Pinning) -> Result<PinStatus> {
    match affinity.pin_to_core(pinning.core) {
        Ok(()) => {
            info!("pinned to logical core {}", pinning.core);
            Ok(PinStatus::Pinned(pinning.core))
        }
        Err(err) => match pinning.policy {
            PinPolicy::Required => Err(err),
            PinPolicy::BestEffort => {
                warn!("{err}, sweeping unpinned (NOTE: this is expected on macOS)");
                Ok(PinStatus::Unpinned)
            }
        },
    }
}

/// Raise the current thread to maximum scheduling priority, returning whether it worked.
pub fn raise_priority() -> bool {
    if thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max).is_err()
    {
        warn!("Couldn't raise probe thread to maximum priority");
        return false;
    }
    info!("probe thread running at maximum priority");
    true
}
