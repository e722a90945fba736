//! Inter-cycle sleep planning.
//!
//! Two separate facts decide the pause after a cycle:
//!
//! - **topology**: whether the only domain the cycle touched belongs to a
//!   dataset with `isolation_required`, so there is nothing to interleave
//!   with and the whole batch must be spaced out
//! - **availability**: whether some domains were skipped because the
//!   resilience engine had them backed off or paced
//!
//! A single touched domain on its own never implies isolation, and
//! contended domains never lengthen the sleep: the engine's backoff already
//! protects them.

use crate::config::PacingConfig;
use crate::utils::jitter_up;
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepReason {
    /// One isolation-required domain was worked: long, jittered pause.
    IsolatedDataset,
    /// Work was dispatched or deferred on unavailable domains.
    Short,
    /// Nothing was pending.
    Idle,
}

impl fmt::Display for SleepReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SleepReason::IsolatedDataset => "isolated_dataset",
            SleepReason::Short => "short",
            SleepReason::Idle => "idle",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepPlan {
    pub duration: Duration,
    pub reason: SleepReason,
}

/// What one cycle did, as far as pacing is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleFacts {
    /// Network-touching domains that received requests, with whether their
    /// dataset requires isolation.
    pub domains_touched: BTreeMap<String, bool>,
    /// Domains skipped because they were backed off, paced or failing.
    pub domains_contended: usize,
    /// Items handed to stage handlers, networked or not.
    pub items_dispatched: usize,
}

impl CycleFacts {
    pub fn touch(&mut self, domain: &str, isolation_required: bool) {
        let flag = self.domains_touched.entry(domain.to_string()).or_insert(false);
        *flag |= isolation_required;
    }

    /// Exactly one domain was worked and its dataset requires isolation.
    pub fn isolated_single_domain(&self) -> bool {
        self.domains_touched.len() == 1 && self.domains_touched.values().all(|iso| *iso)
    }
}

pub fn plan_sleep<R: Rng + ?Sized>(facts: &CycleFacts, pacing: &PacingConfig, rng: &mut R) -> SleepPlan {
    if facts.isolated_single_domain() {
        return SleepPlan {
            duration: jitter_up(pacing.batch_sleep_base(), pacing.batch_sleep_jitter_pct, rng),
            reason: SleepReason::IsolatedDataset,
        };
    }
    if facts.items_dispatched > 0 || facts.domains_contended > 0 {
        return SleepPlan {
            duration: pacing.short_sleep(),
            reason: SleepReason::Short,
        };
    }
    SleepPlan {
        duration: pacing.idle_sleep(),
        reason: SleepReason::Idle,
    }
}
