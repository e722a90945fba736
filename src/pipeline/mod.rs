//! Pipeline Orchestrator.
//!
//! The top-level control loop and the only component with timing
//! authority. One cycle (`tick`) walks the enabled stages in priority order:
//!
//! 1. count pending items for the stage (cron-enabled datasets, or the one
//!    explicitly targeted dataset)
//! 2. claim `min(pending, batch_size ± jitter)` of them
//! 3. group them by domain, holding back extra domains of isolated datasets
//!    and domains the resilience engine has backed off
//! 4. run each domain's items sequentially, domains concurrently up to the
//!    concurrency cap
//! 5. move every item to the status its handler's disposition implies
//!
//! After the last stage the cycle plans its sleep (see [`sleep`]). A
//! shutdown signal is honoured only once that sleep has begun, so a batch
//! that started always finishes.
//!
//! Per-item failures never leave a cycle. A [`WorkStoreError`] does: the
//! cycle lets in-flight domain groups finish, then returns the error. The
//! long-running loop survives it, returning stranded claims to pending and
//! trying again after a short sleep.

pub mod handlers;
pub mod links;
pub mod sleep;

use crate::config::PipelineStepConfig;
use crate::errors::{PipelineError, StageError, WorkStoreError};
use crate::models::{Dataset, DatasetId, Stage, WorkItem};
use crate::outputs::json;
use crate::resilience::{Admission, DomainResilienceEngine};
use crate::store::{ClaimFilter, WorkStore};
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use crate::utils::jitter_count;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use handlers::{Disposition, HandledItem, StageHandler};
use sleep::{CycleFacts, SleepPlan, SleepReason, plan_sleep};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Per-stage tallies for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub pending: usize,
    pub claimed: usize,
    pub advanced: usize,
    pub rejected: usize,
    pub retried: usize,
    pub failed: usize,
    pub deferred: usize,
    /// Items returned to pending without being handled.
    pub released: usize,
    /// Domains that sat out the rest of the batch after repeated failures.
    pub domains_skipped: Vec<String>,
}

impl StageReport {
    fn count(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Advance => self.advanced += 1,
            Disposition::Reject => self.rejected += 1,
            Disposition::Retry => self.retried += 1,
            Disposition::Fail => self.failed += 1,
            Disposition::Deferred => self.deferred += 1,
        }
    }

    fn handled(&self) -> usize {
        self.advanced + self.rejected + self.retried + self.failed + self.deferred
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub stages: BTreeMap<Stage, StageReport>,
    pub facts: CycleFacts,
    pub sleep: SleepPlan,
    pub elapsed: Duration,
}

/// Items of one domain within a batch, in claim order.
struct DomainGroup {
    domain: String,
    isolated: bool,
    items: Vec<(WorkItem, Arc<Dataset>)>,
}

#[derive(Default)]
struct GroupResult {
    report: StageReport,
    contacted: bool,
    contended: bool,
    store_error: Option<WorkStoreError>,
}

pub struct Orchestrator {
    config: Arc<PipelineStepConfig>,
    store: Arc<dyn WorkStore>,
    dre: Arc<DomainResilienceEngine>,
    telemetry: Arc<dyn TelemetrySink>,
    handlers: BTreeMap<Stage, Box<dyn StageHandler>>,
    filter: ClaimFilter,
    export_dir: Option<String>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<PipelineStepConfig>,
        store: Arc<dyn WorkStore>,
        dre: Arc<DomainResilienceEngine>,
        telemetry: Arc<dyn TelemetrySink>,
        filter: ClaimFilter,
    ) -> Self {
        Self {
            config,
            store,
            dre,
            telemetry,
            handlers: BTreeMap::new(),
            filter,
            export_dir: None,
        }
    }

    pub fn with_handler(mut self, handler: Box<dyn StageHandler>) -> Self {
        self.handlers.insert(handler.stage(), handler);
        self
    }

    /// Export fully processed articles to `dir` after every cycle.
    pub fn with_export_dir(mut self, dir: impl Into<String>) -> Self {
        self.export_dir = Some(dir.into());
        self
    }

    /// Initialise every handler's collaborators.
    pub async fn init(&self) -> Result<(), StageError> {
        for handler in self.handlers.values() {
            handler.init().await?;
        }
        Ok(())
    }

    /// Release every handler's collaborators, logging failures.
    pub async fn teardown(&self) {
        for (stage, handler) in &self.handlers {
            if let Err(e) = handler.teardown().await {
                error!(%stage, error = %e, "Stage teardown failed");
            }
        }
    }

    /// Run one cycle: every enabled stage in priority order, then plan the
    /// sleep before the next cycle.
    ///
    /// # Returns
    ///
    /// A [`CycleReport`] with per-stage tallies for every stage that claimed
    /// work, plus the planned sleep.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Store`] when the work store fails. Domain groups
    /// already running finish first; later stages do not run. Items the
    /// failure left claimed stay claimed until
    /// [`WorkStore::release_claimed`] runs, which [`run`](Self::run) does.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let report = orchestrator.tick().await?;
    /// orchestrator.after_cycle(&report).await?;
    /// tokio::time::sleep(report.sleep.duration).await;
    /// ```
    #[instrument(level = "info", skip_all)]
    pub async fn tick(&self) -> Result<CycleReport, PipelineError> {
        let t0 = Instant::now();
        let mut facts = CycleFacts::default();
        let mut stages = BTreeMap::new();

        for stage in self.config.stages.enabled() {
            let Some(handler) = self.handlers.get(&stage) else {
                debug!(%stage, "No handler registered; skipping stage");
                continue;
            };
            let report = self.run_stage(stage, handler.as_ref(), &mut facts).await?;
            if report.claimed > 0 {
                stages.insert(stage, report);
            }
        }

        let sleep = plan_sleep(&facts, &self.config.pacing, &mut rand::rng());
        let elapsed = t0.elapsed();
        info!(
            stages = stages.len(),
            dispatched = facts.items_dispatched,
            domains_touched = facts.domains_touched.len(),
            domains_contended = facts.domains_contended,
            sleep_secs = sleep.duration.as_secs_f64(),
            sleep_reason = %sleep.reason,
            elapsed_ms = elapsed.as_millis() as u64,
            "Cycle complete"
        );
        Ok(CycleReport {
            stages,
            facts,
            sleep,
            elapsed,
        })
    }

    #[instrument(level = "info", skip_all, fields(stage = %stage))]
    async fn run_stage(
        &self,
        stage: Stage,
        handler: &dyn StageHandler,
        facts: &mut CycleFacts,
    ) -> Result<StageReport, PipelineError> {
        let mut report = StageReport {
            pending: self.store.count_pending(stage, &self.filter).await?,
            ..StageReport::default()
        };
        if report.pending == 0 {
            return Ok(report);
        }

        let settings = self.config.stages.get(stage);
        let batch = jitter_count(settings.batch_size, settings.batch_jitter_pct, &mut rand::rng())
            .min(report.pending);
        let claimed = self.store.claim(stage, &self.filter, batch).await?;
        report.claimed = claimed.len();
        info!(pending = report.pending, claimed = report.claimed, "Dispatching batch");

        let (groups, held) = self.group(stage, claimed).await?;
        for item in &held {
            self.release(stage, item).await?;
        }
        report.released += held.len();

        let mut dispatch = Vec::with_capacity(groups.len());
        for group in groups {
            if stage.touches_network() && !self.reachable(&group.domain) {
                debug!(domain = %group.domain, "Domain backed off; releasing its items");
                facts.domains_contended += 1;
                for (item, _) in &group.items {
                    self.release(stage, item).await?;
                }
                report.released += group.items.len();
                continue;
            }
            dispatch.push(group);
        }

        let cap = self.config.resilience.concurrency_cap.max(1);
        let results: Vec<(String, bool, GroupResult)> = stream::iter(dispatch)
            .map(|group| async move {
                let domain = group.domain.clone();
                let isolated = group.isolated;
                (domain, isolated, self.run_group(stage, handler, group).await)
            })
            .buffer_unordered(cap)
            .collect()
            .await;

        let mut first_error = None;
        for (domain, isolated, result) in results {
            if result.contacted {
                facts.touch(&domain, isolated);
            }
            if result.contended {
                facts.domains_contended += 1;
            }
            facts.items_dispatched += result.report.handled();
            merge_reports(&mut report, result.report);
            if let Some(e) = result.store_error {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            error!(error = %e, "Work store failed; aborting cycle");
            return Err(e.into());
        }

        info!(
            advanced = report.advanced,
            rejected = report.rejected,
            retried = report.retried,
            failed = report.failed,
            deferred = report.deferred,
            released = report.released,
            skipped = ?report.domains_skipped,
            "Stage batch finished"
        );
        Ok(report)
    }

    /// Whether a domain could be leased within the admission window.
    fn reachable(&self, domain: &str) -> bool {
        match self.dre.admission(domain) {
            Admission::BackedOff(remaining) => remaining <= self.config.pacing.max_admission_wait(),
            _ => true,
        }
    }

    /// Group claimed items by domain in claim order. Items of isolated
    /// datasets on any domain other than the dataset's first are held back.
    async fn group(
        &self,
        stage: Stage,
        claimed: Vec<WorkItem>,
    ) -> Result<(Vec<DomainGroup>, Vec<WorkItem>), PipelineError> {
        let mut datasets: HashMap<DatasetId, Arc<Dataset>> = HashMap::new();
        let mut isolated_domain: HashMap<DatasetId, String> = HashMap::new();
        let mut groups: Vec<DomainGroup> = Vec::new();
        let mut held = Vec::new();

        for item in claimed {
            let dataset = match datasets.get(&item.dataset_id) {
                Some(d) => Arc::clone(d),
                None => {
                    let d = Arc::new(self.store.dataset(&item.dataset_id).await?);
                    datasets.insert(item.dataset_id.clone(), Arc::clone(&d));
                    d
                }
            };

            let isolated = stage.touches_network() && dataset.isolation_required;
            if isolated {
                let chosen = isolated_domain
                    .entry(dataset.id.clone())
                    .or_insert_with(|| item.domain.clone());
                if *chosen != item.domain {
                    held.push(item);
                    continue;
                }
            }

            match groups.iter_mut().find(|g| g.domain == item.domain) {
                Some(group) => {
                    group.isolated |= isolated;
                    group.items.push((item, dataset));
                }
                None => groups.push(DomainGroup {
                    domain: item.domain.clone(),
                    isolated,
                    items: vec![(item, dataset)],
                }),
            }
        }
        Ok((groups, held))
    }

    async fn release(&self, stage: Stage, item: &WorkItem) -> Result<(), WorkStoreError> {
        self.store
            .transition(item.id, stage.claimed_status(), stage.pending_status())
            .await
    }

    /// Work one domain's items in order. Stops early when the domain keeps
    /// failing, turns out to be unavailable, or the store fails.
    async fn run_group(&self, stage: Stage, handler: &dyn StageHandler, group: DomainGroup) -> GroupResult {
        let threshold = self.config.resilience.batch_domain_failure_threshold.max(1);
        let mut result = GroupResult::default();
        let mut consecutive_failures = 0u32;
        let mut stop = false;

        for (item, dataset) in &group.items {
            if stop {
                if let Err(e) = self.release(stage, item).await {
                    result.store_error = Some(e);
                    break;
                }
                result.report.released += 1;
                continue;
            }

            let t0 = Instant::now();
            let mut errored = false;
            let handled = match handler.handle(item, dataset).await {
                Ok(handled) => handled,
                Err(StageError::Store(e)) => {
                    result.store_error = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(item_id = item.id, url = %item.url, error = %e, "Stage handler failed; failing item");
                    errored = true;
                    HandledItem {
                        outcome: "handler_error".into(),
                        ..HandledItem::local(Disposition::Fail)
                    }
                }
            };
            let elapsed = t0.elapsed();

            let to = handled.disposition.target(stage);
            if let Err(e) = self.store.transition(item.id, stage.claimed_status(), to).await {
                result.store_error = Some(e);
                break;
            }
            result.report.count(handled.disposition);
            result.contacted |= handled.contacted;
            self.emit(stage, item, &handled, elapsed);

            if handled.disposition == Disposition::Deferred {
                result.contended = true;
                stop = true;
                continue;
            }
            if errored || handled.disposition.counts_against_domain() {
                consecutive_failures += 1;
            } else {
                consecutive_failures = 0;
            }
            if consecutive_failures >= threshold {
                warn!(domain = %group.domain, failures = consecutive_failures, "Domain keeps failing; skipping it for this batch");
                result.report.domains_skipped.push(group.domain.clone());
                result.contended = true;
                stop = true;
            }
        }
        result
    }

    fn emit(&self, stage: Stage, item: &WorkItem, handled: &HandledItem, elapsed: Duration) {
        self.telemetry.emit(TelemetryEvent {
            at: Utc::now(),
            stage,
            item_id: item.id,
            domain: item.domain.clone(),
            outcome: handled.outcome.clone(),
            response_bytes: handled.response_bytes,
            elapsed_ms: elapsed.as_millis() as u64,
            strategy: handled.strategy,
        });
    }

    /// Cycle until `shutdown` turns true (or its sender goes away).
    ///
    /// The signal is only looked at once a cycle's sleep has begun; it cuts
    /// the sleep short but never a dispatch. A cycle that fails on the work
    /// store is logged, its stranded claims are released, and the loop
    /// sleeps short before trying again.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), PipelineError> {
        loop {
            let pause = match self.cycle().await {
                Ok(pause) => pause,
                Err(e) => {
                    error!(error = %e, "Cycle failed on the work store; retrying after a short sleep");
                    match self.store.release_claimed().await {
                        Ok(released) => debug!(released, "Released stranded claims"),
                        Err(e) => error!(error = %e, "Failed to release stranded claims"),
                    }
                    self.config.pacing.short_sleep()
                }
            };

            let stop = tokio::select! {
                _ = tokio::time::sleep(pause) => *shutdown.borrow(),
                changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
            };
            if stop {
                info!("Shutdown requested; leaving pipeline loop");
                return Ok(());
            }
        }
    }

    async fn cycle(&self) -> Result<Duration, PipelineError> {
        let report = self.tick().await?;
        self.after_cycle(&report).await?;
        Ok(report.sleep.duration)
    }

    /// Export finished articles, and re-arm seeds once the pipeline idles.
    pub async fn after_cycle(&self, report: &CycleReport) -> Result<(), PipelineError> {
        if let Some(dir) = &self.export_dir {
            if let Err(e) = json::export_linked(self.store.as_ref(), dir).await {
                error!(error = %e, "Failed to export articles");
            }
        }
        if report.sleep.reason == SleepReason::Idle {
            let rearmed = self.store.rearm_seeds().await?;
            debug!(rearmed, "Re-armed seeds for the next discovery pass");
        }
        Ok(())
    }
}

fn merge_reports(into: &mut StageReport, from: StageReport) {
    into.advanced += from.advanced;
    into.rejected += from.rejected;
    into.retried += from.retried;
    into.failed += from.failed;
    into.deferred += from.deferred;
    into.released += from.released;
    into.domains_skipped.extend(from.domains_skipped);
}
