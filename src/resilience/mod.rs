//! Domain Resilience Engine.
//!
//! The single source of truth for "may we contact domain D right now". It
//! tracks one [`DomainState`] per host, rebuilt from observed traffic for the
//! lifetime of the process and never persisted, so a redeploy does not carry
//! stale punishment forward.
//!
//! # Locking
//!
//! States live in a [`DashMap`] of per-domain mutexes. Looking up a domain
//! touches one map shard briefly; all reads and writes of a state happen
//! under that domain's own lock, so unrelated domains never contend.
//!
//! # Admission
//!
//! A request to a domain needs a [`DomainLease`]. [`try_acquire`] grants one
//! only when the domain is out of backoff, its inter-request interval has
//! elapsed and no other lease is outstanding. Granting a lease draws the
//! next interval uniformly from `[inter_request_min, inter_request_max]`.
//! The lease clears the in-flight flag when dropped, so at most one request
//! per domain is ever in flight.
//!
//! # Backoff
//!
//! | Outcome | Backoff | Sensitivity |
//! |---------|---------|-------------|
//! | `Success` | none | decays by one every N consecutive successes |
//! | `RateLimited` | `rate_limited` policy, exponent = consecutive transient failures | unchanged |
//! | `BotProtectionDetected` | `bot_protection` policy, exponent = consecutive bot signals | +1, capped at 10 |
//! | `TransientFailure` | `transient` policy, exponent = consecutive transient failures | unchanged |
//! | `PermanentFailure` | none | unchanged |
//!
//! Delays are `min(base * 2^n * jitter, cap)` and `backoff_until` is only
//! ever pushed later, never earlier.
//!
//! [`try_acquire`]: DomainResilienceEngine::try_acquire

pub mod classify;
pub mod fingerprint;

pub use classify::classify_response;
pub use fingerprint::{ProfilePool, RequestProfile};

use crate::config::{BackoffConfig, BackoffPolicy, PacingConfig, PipelineStepConfig};
use crate::utils::uniform_between;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};

/// Upper bound of [`DomainState::sensitivity_level`].
pub const MAX_SENSITIVITY: u8 = 10;

/// Exponents above this would only ever hit the cap.
const MAX_BACKOFF_EXPONENT: u32 = 24;

/// Poll interval while another lease on the same domain is outstanding.
const IN_FLIGHT_POLL: Duration = Duration::from_millis(250);

/// Result of one request as far as the domain's health is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Outcome {
    Success,
    RateLimited,
    BotProtectionDetected,
    TransientFailure,
    PermanentFailure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Success => "success",
            Outcome::RateLimited => "rate_limited",
            Outcome::BotProtectionDetected => "bot_protection_detected",
            Outcome::TransientFailure => "transient_failure",
            Outcome::PermanentFailure => "permanent_failure",
        };
        f.write_str(name)
    }
}

/// Everything the engine knows about one domain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainState {
    /// 0–10. Rises with bot signals, decays slowly on sustained success.
    pub sensitivity_level: u8,
    pub backoff_until: Option<Instant>,
    pub consecutive_bot_signals: u32,
    pub consecutive_transient_failures: u32,
    pub consecutive_successes: u32,
    pub last_success_at: Option<Instant>,
    pub last_request_at: Option<Instant>,
    /// Earliest instant the inter-request interval allows another request.
    pub next_allowed_at: Option<Instant>,
    pub in_flight: bool,
    last_user_agent: Option<usize>,
}

impl DomainState {
    fn admission(&self, now: Instant) -> Admission {
        if let Some(until) = self.backoff_until {
            if now < until {
                return Admission::BackedOff(until - now);
            }
        }
        if self.in_flight {
            return Admission::InFlight;
        }
        match self.next_allowed_at {
            Some(at) if now < at => Admission::Pacing(at - now),
            _ => Admission::Ready,
        }
    }
}

/// Why a domain can or cannot be contacted right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Ready,
    /// The inter-request interval has not elapsed; remaining time attached.
    Pacing(Duration),
    /// `backoff_until` lies in the future; remaining time attached.
    BackedOff(Duration),
    /// Another request to the domain is outstanding.
    InFlight,
}

impl Admission {
    /// How long until this admission could turn into `Ready`, if known.
    pub fn remaining(&self) -> Duration {
        match self {
            Admission::Ready => Duration::ZERO,
            Admission::Pacing(d) | Admission::BackedOff(d) => *d,
            Admission::InFlight => IN_FLIGHT_POLL,
        }
    }
}

/// Exclusive permission to have one request in flight to a domain.
pub struct DomainLease {
    domain: String,
    slot: Arc<Mutex<DomainState>>,
}

impl DomainLease {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Debug for DomainLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainLease").field("domain", &self.domain).finish()
    }
}

impl Drop for DomainLease {
    fn drop(&mut self) {
        self.slot.lock().in_flight = false;
    }
}

/// The domain could not be leased within the caller's patience.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unavailable {
    pub admission: Admission,
}

/// Per-domain admission control, bot-signal bookkeeping and backoff.
pub struct DomainResilienceEngine {
    domains: DashMap<String, Arc<Mutex<DomainState>>>,
    pacing: PacingConfig,
    backoff: BackoffConfig,
    decay_after_successes: u32,
    profiles: ProfilePool,
}

impl fmt::Debug for DomainResilienceEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DomainResilienceEngine")
            .field("domains", &self.domains.len())
            .field("pacing", &self.pacing)
            .field("backoff", &self.backoff)
            .field("decay_after_successes", &self.decay_after_successes)
            .finish()
    }
}

impl DomainResilienceEngine {
    pub fn new(config: &PipelineStepConfig) -> Self {
        Self {
            domains: DashMap::new(),
            pacing: config.pacing,
            backoff: config.backoff,
            decay_after_successes: config.resilience.decay_after_successes.max(1),
            profiles: ProfilePool,
        }
    }

    fn slot(&self, domain: &str) -> Arc<Mutex<DomainState>> {
        if let Some(slot) = self.domains.get(domain) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.domains
                .entry(domain.to_string())
                .or_default()
                .value(),
        )
    }

    /// Snapshot of a domain's state, `None` if it has never been seen.
    pub fn state(&self, domain: &str) -> Option<DomainState> {
        self.domains.get(domain).map(|slot| slot.lock().clone())
    }

    /// Whether a request to `domain` would be admitted right now.
    ///
    /// Unknown domains are always admitted: there is no cold-start penalty.
    /// This is a query only; it neither leases the domain nor schedules the
    /// next request. Use [`try_acquire`](Self::try_acquire) or
    /// [`wait_for_lease`](Self::wait_for_lease) before sending anything.
    ///
    /// # Arguments
    ///
    /// * `domain` - Host the request would go to
    ///
    /// # Returns
    ///
    /// `true` when the domain is outside any backoff, past its pacing
    /// interval and has no request in flight.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let dre = DomainResilienceEngine::new(&config);
    /// assert!(dre.should_allow("fresh.example"));
    /// dre.record_outcome("fresh.example", Outcome::BotProtectionDetected);
    /// assert!(!dre.should_allow("fresh.example"));
    /// ```
    pub fn should_allow(&self, domain: &str) -> bool {
        self.admission(domain) == Admission::Ready
    }

    pub fn admission(&self, domain: &str) -> Admission {
        match self.domains.get(domain) {
            Some(slot) => slot.lock().admission(Instant::now()),
            None => Admission::Ready,
        }
    }

    /// Lease `domain` for one request if it is admissible right now.
    pub fn try_acquire(&self, domain: &str) -> Result<DomainLease, Admission> {
        let slot = self.slot(domain);
        {
            let mut state = slot.lock();
            let now = Instant::now();
            match state.admission(now) {
                Admission::Ready => {
                    let gap = uniform_between(
                        self.pacing.inter_request_min(),
                        self.pacing.inter_request_max(),
                        &mut rand::rng(),
                    );
                    state.in_flight = true;
                    state.last_request_at = Some(now);
                    state.next_allowed_at = Some(now + gap);
                    debug!(domain, gap_secs = gap.as_secs_f64(), "Domain leased");
                }
                denied => return Err(denied),
            }
        }
        Ok(DomainLease {
            domain: domain.to_string(),
            slot,
        })
    }

    /// Lease `domain`, waiting for pacing, a short backoff or an outstanding
    /// lease as long as the total wait stays within `max_wait`.
    #[instrument(level = "debug", skip(self))]
    pub async fn wait_for_lease(
        &self,
        domain: &str,
        max_wait: Duration,
    ) -> Result<DomainLease, Unavailable> {
        let deadline = Instant::now() + max_wait;
        loop {
            let admission = match self.try_acquire(domain) {
                Ok(lease) => return Ok(lease),
                Err(admission) => admission,
            };
            let wait = admission.remaining();
            if Instant::now() + wait > deadline {
                debug!(domain, ?admission, "Domain unavailable within admission window");
                return Err(Unavailable { admission });
            }
            sleep(wait).await;
        }
    }

    /// Request profile for the next request to `domain`.
    pub fn fingerprint(&self, domain: &str) -> RequestProfile {
        let slot = self.slot(domain);
        let mut state = slot.lock();
        let profile = self.profiles.draw(
            domain,
            state.sensitivity_level,
            state.last_user_agent,
            &mut rand::rng(),
        );
        state.last_user_agent = Some(profile.user_agent_index);
        profile
    }

    /// Fold one request outcome into the domain's state.
    ///
    /// # Arguments
    ///
    /// * `domain` - Host the request went to
    /// * `outcome` - Classified result of the request
    ///
    /// # Backoff
    ///
    /// Failure classes push `backoff_until` out to
    /// ```text
    /// now + min(base * 2^consecutive * jitter, cap)
    /// ```
    /// using the class's own policy. An existing later deadline is kept.
    /// Bot signals also raise the sensitivity level; successes lower it by
    /// one only after `decay_after_successes` in a row. Permanent failures
    /// leave the state alone.
    pub fn record_outcome(&self, domain: &str, outcome: Outcome) {
        let slot = self.slot(domain);
        let mut state = slot.lock();
        let now = Instant::now();
        let jitter = rand::rng().random_range(self.backoff.jitter_min..=self.backoff.jitter_max);

        match outcome {
            Outcome::Success => {
                state.consecutive_bot_signals = 0;
                state.consecutive_transient_failures = 0;
                state.consecutive_successes += 1;
                state.last_success_at = Some(now);
                if state.consecutive_successes >= self.decay_after_successes {
                    state.consecutive_successes = 0;
                    if state.sensitivity_level > 0 {
                        state.sensitivity_level -= 1;
                        info!(domain, sensitivity = state.sensitivity_level, "Domain sensitivity decayed");
                    }
                }
            }
            Outcome::RateLimited => {
                state.consecutive_successes = 0;
                let delay = backoff_delay(
                    &self.backoff.rate_limited,
                    state.consecutive_transient_failures,
                    jitter,
                );
                state.consecutive_transient_failures += 1;
                extend_backoff(&mut state, now + delay);
                warn!(domain, delay_secs = delay.as_secs_f64(), "Domain rate limited; backing off");
            }
            Outcome::BotProtectionDetected => {
                state.consecutive_successes = 0;
                let delay = backoff_delay(
                    &self.backoff.bot_protection,
                    state.consecutive_bot_signals,
                    jitter,
                );
                state.consecutive_bot_signals += 1;
                state.sensitivity_level = (state.sensitivity_level + 1).min(MAX_SENSITIVITY);
                extend_backoff(&mut state, now + delay);
                warn!(
                    domain,
                    sensitivity = state.sensitivity_level,
                    signals = state.consecutive_bot_signals,
                    delay_secs = delay.as_secs_f64(),
                    "Bot protection detected; backing off"
                );
            }
            Outcome::TransientFailure => {
                state.consecutive_successes = 0;
                let delay = backoff_delay(
                    &self.backoff.transient,
                    state.consecutive_transient_failures,
                    jitter,
                );
                state.consecutive_transient_failures += 1;
                extend_backoff(&mut state, now + delay);
                debug!(domain, delay_secs = delay.as_secs_f64(), "Transient failure; short backoff");
            }
            Outcome::PermanentFailure => {
                debug!(domain, "Permanent failure; no backoff scheduled");
            }
        }
    }
}

/// `min(base * 2^exponent * jitter, cap)`
fn backoff_delay(policy: &BackoffPolicy, exponent: u32, jitter: f64) -> Duration {
    let factor = 2f64.powi(exponent.min(MAX_BACKOFF_EXPONENT) as i32);
    let raw = policy.base().as_secs_f64() * factor * jitter;
    Duration::from_secs_f64(raw.min(policy.cap().as_secs_f64()))
}

fn extend_backoff(state: &mut DomainState, until: Instant) {
    state.backoff_until = Some(match state.backoff_until {
        Some(current) if current > until => current,
        _ => until,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn engine_with(yaml: &str) -> DomainResilienceEngine {
        DomainResilienceEngine::new(&PipelineStepConfig::from_yaml(yaml).unwrap())
    }

    fn engine() -> DomainResilienceEngine {
        engine_with("")
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_domain_is_admitted_without_penalty() {
        let dre = engine();
        assert!(dre.should_allow("fresh.example"));
        assert!(dre.state("fresh.example").is_none());
        let lease = dre.try_acquire("fresh.example").unwrap();
        let state = dre.state("fresh.example").unwrap();
        assert_eq!(state.sensitivity_level, 0);
        assert!(state.in_flight);
        drop(lease);
        assert!(!dre.state("fresh.example").unwrap().in_flight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_is_exclusive_per_domain() {
        let dre = engine_with("pacing: { inter_request_min_secs: 0, inter_request_max_secs: 0 }");
        let lease = dre.try_acquire("a.example").unwrap();
        assert_eq!(dre.try_acquire("a.example").unwrap_err(), Admission::InFlight);
        assert!(!dre.should_allow("a.example"));
        assert!(dre.try_acquire("b.example").is_ok());
        drop(lease);
        assert!(dre.try_acquire("a.example").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampled_gaps_fall_within_configured_interval() {
        let dre = engine_with("pacing: { inter_request_min_secs: 90, inter_request_max_secs: 180 }");
        let step = Duration::from_secs(1);
        let mut gaps = Vec::with_capacity(1000);
        let mut last = None;
        while gaps.len() < 1000 {
            if dre.should_allow("example.com") {
                let lease = dre.try_acquire("example.com").unwrap();
                let now = Instant::now();
                if let Some(prev) = last {
                    gaps.push(now - prev);
                }
                last = Some(now);
                drop(lease);
            }
            advance(step).await;
        }
        // One-second polling can overshoot the drawn gap by up to one step.
        let tolerance = step;
        for gap in &gaps {
            assert!(*gap >= Duration::from_secs(90), "{gap:?}");
            assert!(*gap <= Duration::from_secs(180) + tolerance, "{gap:?}");
        }
        let mean = gaps.iter().map(|g| g.as_secs_f64()).sum::<f64>() / gaps.len() as f64;
        assert!((mean - 135.5).abs() < 6.0, "mean gap {mean}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bot_backoff_is_non_decreasing_and_capped() {
        let dre = engine_with(
            "backoff: { bot_protection: { base_secs: 60, cap_secs: 3600 } }",
        );
        let cap = Duration::from_secs(3600);
        let mut previous: Option<Instant> = None;
        for _ in 0..15 {
            let before = Instant::now();
            dre.record_outcome("example.com", Outcome::BotProtectionDetected);
            let until = dre.state("example.com").unwrap().backoff_until.unwrap();
            assert!(until - before <= cap);
            if let Some(prev) = previous {
                assert!(until >= prev);
            }
            previous = Some(until);
            advance(Duration::from_secs(5)).await;
        }
        assert_eq!(dre.state("example.com").unwrap().sensitivity_level, MAX_SENSITIVITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bot_backoff_is_longer_than_rate_limit_backoff() {
        let dre = engine();
        dre.record_outcome("bot.example", Outcome::BotProtectionDetected);
        dre.record_outcome("busy.example", Outcome::RateLimited);
        let bot = dre.state("bot.example").unwrap().backoff_until.unwrap();
        let busy = dre.state("busy.example").unwrap().backoff_until.unwrap();
        assert!(bot > busy);
        assert!(matches!(dre.admission("bot.example"), Admission::BackedOff(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_backoff_is_shorter_and_keeps_sensitivity() {
        let dre = engine();
        dre.record_outcome("flaky.example", Outcome::TransientFailure);
        dre.record_outcome("busy.example", Outcome::RateLimited);
        let flaky = dre.state("flaky.example").unwrap();
        let busy = dre.state("busy.example").unwrap();
        assert!(flaky.backoff_until.unwrap() < busy.backoff_until.unwrap());
        assert_eq!(flaky.sensitivity_level, 0);
        assert_eq!(flaky.consecutive_transient_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_schedules_no_backoff() {
        let dre = engine();
        dre.record_outcome("gone.example", Outcome::PermanentFailure);
        let state = dre.state("gone.example").unwrap();
        assert!(state.backoff_until.is_none());
        assert!(dre.should_allow("gone.example"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_does_not_shorten_backoff() {
        let dre = engine();
        dre.record_outcome("example.com", Outcome::RateLimited);
        let until = dre.state("example.com").unwrap().backoff_until;
        dre.record_outcome("example.com", Outcome::Success);
        let state = dre.state("example.com").unwrap();
        assert_eq!(state.backoff_until, until);
        assert_eq!(state.consecutive_transient_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensitivity_scenario_and_slow_decay() {
        let dre = engine();
        let domain = "example.com";
        dre.record_outcome(domain, Outcome::Success);
        dre.record_outcome(domain, Outcome::Success);
        assert_eq!(dre.state(domain).unwrap().sensitivity_level, 0);

        dre.record_outcome(domain, Outcome::BotProtectionDetected);
        let first = dre.state(domain).unwrap().backoff_until.unwrap();
        assert_eq!(dre.state(domain).unwrap().sensitivity_level, 1);

        advance(Duration::from_secs(1)).await;
        dre.record_outcome(domain, Outcome::BotProtectionDetected);
        let second = dre.state(domain).unwrap().backoff_until.unwrap();
        assert_eq!(dre.state(domain).unwrap().sensitivity_level, 2);
        assert!(second > first);

        dre.record_outcome(domain, Outcome::Success);
        let state = dre.state(domain).unwrap();
        assert_eq!(state.sensitivity_level, 2);
        assert_eq!(state.consecutive_bot_signals, 0);

        for _ in 0..9 {
            dre.record_outcome(domain, Outcome::Success);
        }
        assert_eq!(dre.state(domain).unwrap().sensitivity_level, 1);
        for _ in 0..10 {
            dre.record_outcome(domain, Outcome::Success);
        }
        assert_eq!(dre.state(domain).unwrap().sensitivity_level, 0);
        for _ in 0..10 {
            dre.record_outcome(domain, Outcome::Success);
        }
        assert_eq!(dre.state(domain).unwrap().sensitivity_level, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_interrupts_decay_streak() {
        let dre = engine();
        let domain = "example.com";
        dre.record_outcome(domain, Outcome::BotProtectionDetected);
        for _ in 0..9 {
            dre.record_outcome(domain, Outcome::Success);
        }
        dre.record_outcome(domain, Outcome::TransientFailure);
        dre.record_outcome(domain, Outcome::Success);
        assert_eq!(dre.state(domain).unwrap().sensitivity_level, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_lease_waits_out_pacing() {
        let dre = engine_with("pacing: { inter_request_min_secs: 10, inter_request_max_secs: 20 }");
        drop(dre.try_acquire("example.com").unwrap());
        let started = Instant::now();
        let lease = dre
            .wait_for_lease("example.com", Duration::from_secs(30))
            .await
            .unwrap();
        let waited = Instant::now() - started;
        assert!(waited >= Duration::from_secs(10) && waited <= Duration::from_secs(20));
        assert_eq!(lease.domain(), "example.com");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_lease_gives_up_on_long_backoff() {
        let dre = engine();
        dre.record_outcome("example.com", Outcome::BotProtectionDetected);
        let started = Instant::now();
        let err = dre
            .wait_for_lease("example.com", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err.admission, Admission::BackedOff(_)));
        assert_eq!(Instant::now(), started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fingerprint_avoids_repeats_at_high_sensitivity() {
        let dre = engine();
        for _ in 0..10 {
            dre.record_outcome("wary.example", Outcome::BotProtectionDetected);
        }
        let mut last = dre.fingerprint("wary.example").user_agent;
        for _ in 0..50 {
            let next = dre.fingerprint("wary.example").user_agent;
            assert_ne!(next, last);
            last = next;
        }
    }

    #[test]
    fn test_backoff_delay_formula() {
        let policy = BackoffPolicy {
            base_secs: 10.0,
            cap_secs: 100.0,
        };
        assert_eq!(backoff_delay(&policy, 0, 1.0), Duration::from_secs(10));
        assert_eq!(backoff_delay(&policy, 2, 1.0), Duration::from_secs(40));
        assert_eq!(backoff_delay(&policy, 3, 1.0), Duration::from_secs(80));
        assert_eq!(backoff_delay(&policy, 4, 1.0), Duration::from_secs(100));
        assert_eq!(backoff_delay(&policy, 1_000, 1.2), Duration::from_secs(100));
    }
}
