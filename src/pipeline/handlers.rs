//! Stage handlers.
//!
//! A handler processes one claimed item and reports a [`Disposition`]; the
//! orchestrator turns that into the item's next status. Handlers never
//! change an item's status themselves.
//!
//! Discovery and verification make one guarded request: lease the domain,
//! draw a request profile, fetch, classify and record the outcome.
//! Extraction runs the fallback chain. The last three stages call model
//! collaborators and never touch the network.

use crate::api::ScoringModel;
use crate::errors::StageError;
use crate::extraction::ExtractionChain;
use crate::extraction::parsers::looks_like_article;
use crate::fetch::{FetchedPage, Fetcher};
use crate::models::{
    ArticleRecord, Classification, Dataset, DatasetId, ExtractionMethod, ExtractionStatus, Field, FieldMap,
    NamedEntity, NewWorkItem, Stage, WorkItem, WorkStatus,
};
use crate::pipeline::links;
use crate::resilience::{DomainResilienceEngine, Outcome, classify_response};
use crate::store::WorkStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// What should happen to a handled item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stage done; move to the stage's done status.
    Advance,
    /// Not worth processing further (e.g. not an article).
    Reject,
    /// Retryable failure; back to pending.
    Retry,
    /// Terminal failure.
    Fail,
    /// The domain could not be contacted; back to pending, untouched.
    Deferred,
}

impl Disposition {
    pub fn target(self, stage: Stage) -> WorkStatus {
        match self {
            Disposition::Advance => stage.done_status(),
            Disposition::Reject => WorkStatus::Rejected,
            Disposition::Retry | Disposition::Deferred => stage.pending_status(),
            Disposition::Fail => WorkStatus::Failed,
        }
    }

    /// Counts towards a domain's consecutive failures within a batch.
    pub fn counts_against_domain(self) -> bool {
        matches!(self, Disposition::Retry)
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Disposition::Advance => "advance",
            Disposition::Reject => "reject",
            Disposition::Retry => "retry",
            Disposition::Fail => "fail",
            Disposition::Deferred => "deferred",
        })
    }
}

/// A handler's verdict on one item plus what telemetry needs.
#[derive(Debug, Clone, PartialEq)]
pub struct HandledItem {
    pub disposition: Disposition,
    /// Outcome kind for telemetry, snake_case.
    pub outcome: String,
    pub response_bytes: usize,
    pub strategy: Option<ExtractionMethod>,
    /// At least one request reached the domain.
    pub contacted: bool,
}

impl HandledItem {
    pub fn local(disposition: Disposition) -> Self {
        Self {
            disposition,
            outcome: disposition.to_string(),
            response_bytes: 0,
            strategy: None,
            contacted: false,
        }
    }
}

#[async_trait(?Send)]
pub trait StageHandler {
    fn stage(&self) -> Stage;

    async fn init(&self) -> Result<(), StageError> {
        Ok(())
    }

    async fn handle(&self, item: &WorkItem, dataset: &Dataset) -> Result<HandledItem, StageError>;

    async fn teardown(&self) -> Result<(), StageError> {
        Ok(())
    }
}

/// One request through the resilience engine.
enum Guarded {
    Unavailable,
    Failed,
    Page(FetchedPage, Outcome),
}

/// Single-request fetch path shared by discovery and verification.
#[derive(Clone)]
pub struct GuardedFetch {
    dre: Arc<DomainResilienceEngine>,
    fetcher: Arc<dyn Fetcher>,
    max_wait: Duration,
}

impl GuardedFetch {
    pub fn new(dre: Arc<DomainResilienceEngine>, fetcher: Arc<dyn Fetcher>, max_wait: Duration) -> Self {
        Self {
            dre,
            fetcher,
            max_wait,
        }
    }

    async fn get(&self, item: &WorkItem) -> Guarded {
        let Ok(lease) = self.dre.wait_for_lease(&item.domain, self.max_wait).await else {
            return Guarded::Unavailable;
        };
        let profile = self.dre.fingerprint(&item.domain);
        let fetched = self.fetcher.fetch(&item.url, &profile).await;
        drop(lease);
        match fetched {
            Ok(page) => {
                let outcome = classify_response(page.status, &page.body);
                self.dre.record_outcome(&item.domain, outcome);
                Guarded::Page(page, outcome)
            }
            Err(e) => {
                warn!(url = %item.url, error = %e, "Request failed");
                self.dre.record_outcome(&item.domain, Outcome::TransientFailure);
                Guarded::Failed
            }
        }
    }
}

fn networked(disposition: Disposition, outcome: impl fmt::Display, bytes: usize) -> HandledItem {
    HandledItem {
        disposition,
        outcome: outcome.to_string(),
        response_bytes: bytes,
        strategy: None,
        contacted: true,
    }
}

/// Non-success outcome of a single guarded request.
fn failed_request(outcome: Outcome, bytes: usize) -> HandledItem {
    let disposition = match outcome {
        Outcome::PermanentFailure => Disposition::Fail,
        _ => Disposition::Retry,
    };
    networked(disposition, outcome, bytes)
}

pub struct DiscoveryHandler {
    fetch: GuardedFetch,
    store: Arc<dyn WorkStore>,
    /// Compiled `link_pattern` per dataset.
    patterns: Mutex<HashMap<DatasetId, Regex>>,
}

impl DiscoveryHandler {
    pub fn new(fetch: GuardedFetch, store: Arc<dyn WorkStore>) -> Self {
        Self {
            fetch,
            store,
            patterns: Mutex::new(HashMap::new()),
        }
    }

    fn link_pattern(&self, dataset: &Dataset) -> Result<Option<Regex>, StageError> {
        let Some(source) = dataset.link_pattern.as_deref() else {
            return Ok(None);
        };
        let mut patterns = self.patterns.lock();
        if let Some(pattern) = patterns.get(&dataset.id) {
            return Ok(Some(pattern.clone()));
        }
        let pattern = Regex::new(source)
            .map_err(|e| StageError::Handler(format!("bad link_pattern: {e}")))?;
        patterns.insert(dataset.id.clone(), pattern.clone());
        Ok(Some(pattern))
    }
}

#[async_trait(?Send)]
impl StageHandler for DiscoveryHandler {
    fn stage(&self) -> Stage {
        Stage::Discovery
    }

    #[instrument(level = "info", skip_all, fields(seed = %item.url))]
    async fn handle(&self, item: &WorkItem, dataset: &Dataset) -> Result<HandledItem, StageError> {
        let (page, outcome) = match self.fetch.get(item).await {
            Guarded::Unavailable => return Ok(HandledItem::local(Disposition::Deferred)),
            Guarded::Failed => return Ok(networked(Disposition::Retry, Outcome::TransientFailure, 0)),
            Guarded::Page(page, outcome) => (page, outcome),
        };
        if outcome != Outcome::Success {
            return Ok(failed_request(outcome, page.body.len()));
        }

        let pattern = self.link_pattern(dataset)?;
        let found = links::discover(&item.url, &page.body, dataset, pattern.as_ref());
        let candidates: Vec<NewWorkItem> = found
            .iter()
            .map(|url| NewWorkItem {
                url: url.clone(),
                dataset_id: item.dataset_id.clone(),
            })
            .collect();
        let inserted = self.store.insert_candidates(candidates).await?;
        info!(found = found.len(), inserted, "Discovered candidates");
        Ok(networked(Disposition::Advance, outcome, page.body.len()))
    }
}

pub struct VerificationHandler {
    fetch: GuardedFetch,
}

impl VerificationHandler {
    pub fn new(fetch: GuardedFetch) -> Self {
        Self { fetch }
    }
}

#[async_trait(?Send)]
impl StageHandler for VerificationHandler {
    fn stage(&self) -> Stage {
        Stage::Verification
    }

    #[instrument(level = "debug", skip_all, fields(url = %item.url))]
    async fn handle(&self, item: &WorkItem, _dataset: &Dataset) -> Result<HandledItem, StageError> {
        match self.fetch.get(item).await {
            Guarded::Unavailable => Ok(HandledItem::local(Disposition::Deferred)),
            Guarded::Failed => Ok(networked(Disposition::Retry, Outcome::TransientFailure, 0)),
            Guarded::Page(page, Outcome::Success) => {
                let disposition = if looks_like_article(&page.body) {
                    Disposition::Advance
                } else {
                    debug!("Candidate is not an article");
                    Disposition::Reject
                };
                Ok(networked(disposition, Outcome::Success, page.body.len()))
            }
            Guarded::Page(page, outcome) => Ok(failed_request(outcome, page.body.len())),
        }
    }
}

pub struct ExtractionHandler {
    chain: Arc<ExtractionChain>,
    store: Arc<dyn WorkStore>,
}

impl ExtractionHandler {
    pub fn new(chain: Arc<ExtractionChain>, store: Arc<dyn WorkStore>) -> Self {
        Self { chain, store }
    }
}

#[async_trait(?Send)]
impl StageHandler for ExtractionHandler {
    fn stage(&self) -> Stage {
        Stage::Extraction
    }

    async fn handle(&self, item: &WorkItem, _dataset: &Dataset) -> Result<HandledItem, StageError> {
        let result = self.chain.extract(&item.url).await;
        if result.attempted.is_empty() {
            return Ok(HandledItem::local(Disposition::Deferred));
        }
        let disposition = match result.status {
            ExtractionStatus::Success => Disposition::Advance,
            ExtractionStatus::PartialSuccess if result.fields.contains_key(&Field::Body) => {
                Disposition::Advance
            }
            ExtractionStatus::PartialSuccess => Disposition::Fail,
            ExtractionStatus::BotProtectionDetected | ExtractionStatus::TransientFailure => {
                Disposition::Retry
            }
            ExtractionStatus::NotFound | ExtractionStatus::PermanentFailure => Disposition::Fail,
        };
        if disposition == Disposition::Advance {
            self.store
                .put_record(item.id, ArticleRecord::from_extraction(&result))
                .await?;
        }
        Ok(HandledItem {
            disposition,
            outcome: result.status.as_str().to_string(),
            response_bytes: result.response_bytes,
            strategy: result.primary_method(),
            contacted: true,
        })
    }
}

/// Applies a scoring model's output to an article record.
pub type Apply<O> = fn(&mut ArticleRecord, O) -> Result<(), StageError>;

/// Cleaning, classification and entity linking: load the record, score it,
/// store the updated record.
pub struct ScoringHandler<O> {
    stage: Stage,
    store: Arc<dyn WorkStore>,
    model: Box<dyn ScoringModel<Output = O>>,
    apply: Apply<O>,
}

impl<O> ScoringHandler<O> {
    pub fn new(
        stage: Stage,
        store: Arc<dyn WorkStore>,
        model: Box<dyn ScoringModel<Output = O>>,
        apply: Apply<O>,
    ) -> Self {
        Self {
            stage,
            store,
            model,
            apply,
        }
    }
}

fn apply_cleaned(record: &mut ArticleRecord, fields: FieldMap) -> Result<(), StageError> {
    if !fields.contains_key(&Field::Body) {
        return Err(StageError::Handler("cleaning left no body".into()));
    }
    record.fields = fields;
    Ok(())
}

fn apply_classification(record: &mut ArticleRecord, classification: Classification) -> Result<(), StageError> {
    record.classification = Some(classification);
    Ok(())
}

fn apply_entities(record: &mut ArticleRecord, entities: Vec<NamedEntity>) -> Result<(), StageError> {
    record.named_entities = entities;
    Ok(())
}

impl ScoringHandler<FieldMap> {
    pub fn cleaning(store: Arc<dyn WorkStore>, model: Box<dyn ScoringModel<Output = FieldMap>>) -> Self {
        Self::new(Stage::Cleaning, store, model, apply_cleaned)
    }
}

impl ScoringHandler<Classification> {
    pub fn classification(
        store: Arc<dyn WorkStore>,
        model: Box<dyn ScoringModel<Output = Classification>>,
    ) -> Self {
        Self::new(Stage::Classification, store, model, apply_classification)
    }
}

impl ScoringHandler<Vec<NamedEntity>> {
    pub fn entity_linking(
        store: Arc<dyn WorkStore>,
        model: Box<dyn ScoringModel<Output = Vec<NamedEntity>>>,
    ) -> Self {
        Self::new(Stage::EntityLinking, store, model, apply_entities)
    }
}

#[async_trait(?Send)]
impl<O: 'static> StageHandler for ScoringHandler<O> {
    fn stage(&self) -> Stage {
        self.stage
    }

    async fn init(&self) -> Result<(), StageError> {
        info!(stage = %self.stage, model = self.model.name(), "Initialising model");
        self.model.init().await
    }

    #[instrument(level = "debug", skip_all, fields(stage = %self.stage, item_id = item.id))]
    async fn handle(&self, item: &WorkItem, _dataset: &Dataset) -> Result<HandledItem, StageError> {
        let Some(mut record) = self.store.record(item.id).await? else {
            return Err(StageError::Handler(format!("no article record for item {}", item.id)));
        };
        let output = self.model.score(&record).await?;
        (self.apply)(&mut record, output)?;
        self.store.put_record(item.id, record).await?;
        Ok(HandledItem::local(Disposition::Advance))
    }

    async fn teardown(&self) -> Result<(), StageError> {
        self.model.teardown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{BasicCleaner, KeywordClassifier, PhraseEntityLinker};
    use crate::config::PipelineStepConfig;
    use crate::extraction::tests::{ScriptedFetcher, full_article};
    use crate::models::Catalog;
    use crate::store::{ClaimFilter, MemoryWorkStore};

    const FAST: &str = "pacing: { inter_request_min_secs: 1, inter_request_max_secs: 2 }";

    fn catalog() -> Catalog {
        Catalog::from_yaml(
            r#"
datasets:
  - id: metro
    domains: [metro.example]
    seeds: [https://metro.example/]
    link_pattern: '/20\d\d/'
"#,
        )
        .unwrap()
    }

    struct Fixture {
        store: Arc<MemoryWorkStore>,
        dre: Arc<DomainResilienceEngine>,
        config: Arc<PipelineStepConfig>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(PipelineStepConfig::from_yaml(FAST).unwrap());
        Fixture {
            store: Arc::new(MemoryWorkStore::from_catalog(&catalog())),
            dre: Arc::new(DomainResilienceEngine::new(&config)),
            config,
        }
    }

    impl Fixture {
        fn guarded(&self, fetcher: Arc<ScriptedFetcher>) -> GuardedFetch {
            GuardedFetch::new(Arc::clone(&self.dre), fetcher, Duration::from_secs(30))
        }

        async fn claim_one(&self, stage: Stage) -> (WorkItem, Dataset) {
            let item = self
                .store
                .claim(stage, &ClaimFilter::default(), 1)
                .await
                .unwrap()
                .remove(0);
            let dataset = self.store.dataset(&item.dataset_id).await.unwrap();
            (item, dataset)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_inserts_matching_candidates() {
        let f = fixture();
        let seed = r#"<html><body><a href="/2025/05/06/tram">Tram</a><a href="/about">About</a></body></html>"#;
        let fetcher = ScriptedFetcher::new(vec![Ok((200, seed.to_string()))]);
        let handler = DiscoveryHandler::new(f.guarded(fetcher), f.store.clone());
        let (item, dataset) = f.claim_one(Stage::Discovery).await;
        let handled = handler.handle(&item, &dataset).await.unwrap();
        assert_eq!(handled.disposition, Disposition::Advance);
        assert!(handled.contacted);
        let candidates = f.store.items_in(WorkStatus::Candidate).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].url, "https://metro.example/2025/05/06/tram");
    }

    #[tokio::test]
    async fn test_discovery_compiles_link_pattern_once_per_dataset() {
        let f = fixture();
        let handler = DiscoveryHandler::new(f.guarded(ScriptedFetcher::new(vec![])), f.store.clone());
        let dataset = f.store.dataset("metro").await.unwrap();
        let first = handler.link_pattern(&dataset).unwrap().unwrap();
        let second = handler.link_pattern(&dataset).unwrap().unwrap();
        assert_eq!(first.as_str(), second.as_str());
        assert_eq!(handler.patterns.lock().len(), 1);

        let unpatterned = Dataset {
            id: "open".into(),
            link_pattern: None,
            ..dataset
        };
        assert!(handler.link_pattern(&unpatterned).unwrap().is_none());
        assert_eq!(handler.patterns.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_defers_backed_off_domain() {
        let f = fixture();
        f.dre.record_outcome("metro.example", Outcome::BotProtectionDetected);
        let fetcher = ScriptedFetcher::new(vec![]);
        let handler = DiscoveryHandler::new(f.guarded(fetcher.clone()), f.store.clone());
        let (item, dataset) = f.claim_one(Stage::Discovery).await;
        let handled = handler.handle(&item, &dataset).await.unwrap();
        assert_eq!(handled.disposition, Disposition::Deferred);
        assert!(!handled.contacted);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verification_accepts_articles_and_rejects_listings() {
        let f = fixture();
        f.store.insert_with_status("https://metro.example/2025/a", "metro", WorkStatus::Candidate);
        f.store.insert_with_status("https://metro.example/2025/b", "metro", WorkStatus::Candidate);
        f.store.insert_with_status("https://metro.example/2025/c", "metro", WorkStatus::Candidate);
        let fetcher = ScriptedFetcher::new(vec![
            Ok((200, full_article())),
            Ok((200, "<html><body><ul><li>Index</li></ul></body></html>".into())),
            Ok((410, "Gone".into())),
        ]);
        let handler = VerificationHandler::new(f.guarded(fetcher));
        let mut dispositions = Vec::new();
        for _ in 0..3 {
            let (item, dataset) = f.claim_one(Stage::Verification).await;
            dispositions.push(handler.handle(&item, &dataset).await.unwrap().disposition);
        }
        assert_eq!(
            dispositions,
            vec![Disposition::Advance, Disposition::Reject, Disposition::Fail]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_extraction_stores_record_and_reports_strategy() {
        let f = fixture();
        f.store.insert_with_status("https://metro.example/2025/a", "metro", WorkStatus::Verified);
        let fetcher = ScriptedFetcher::new(vec![Ok((200, full_article()))]);
        let chain = Arc::new(ExtractionChain::new(
            Arc::clone(&f.dre),
            fetcher,
            None,
            Arc::clone(&f.config),
        ));
        let handler = ExtractionHandler::new(chain, f.store.clone());
        let (item, dataset) = f.claim_one(Stage::Extraction).await;
        let handled = handler.handle(&item, &dataset).await.unwrap();
        assert_eq!(handled.disposition, Disposition::Advance);
        assert_eq!(handled.outcome, "success");
        assert_eq!(handled.strategy, Some(ExtractionMethod::Lightweight));
        let record = f.store.record(item.id).await.unwrap().unwrap();
        assert_eq!(record.field(Field::Headline), Some("Tram crosses bridge"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extraction_not_found_fails_item() {
        let f = fixture();
        f.store.insert_with_status("https://metro.example/2025/a", "metro", WorkStatus::Verified);
        let fetcher = ScriptedFetcher::new(vec![Ok((404, "Not Found".into()))]);
        let chain = Arc::new(ExtractionChain::new(
            Arc::clone(&f.dre),
            fetcher,
            None,
            Arc::clone(&f.config),
        ));
        let handler = ExtractionHandler::new(chain, f.store.clone());
        let (item, dataset) = f.claim_one(Stage::Extraction).await;
        let handled = handler.handle(&item, &dataset).await.unwrap();
        assert_eq!(handled.disposition, Disposition::Fail);
        assert_eq!(handled.outcome, "not_found");
        assert!(f.store.record(item.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scoring_handlers_enrich_record() {
        let f = fixture();
        let id = f
            .store
            .insert_with_status("https://metro.example/2025/a", "metro", WorkStatus::Extracted)
            .unwrap();
        let mut record = ArticleRecord {
            url: "https://metro.example/2025/a".into(),
            ..ArticleRecord::default()
        };
        record.fields.insert(Field::Headline, "Dana Smith opens tram bridge | Metro".into());
        record.fields.insert(
            Field::Body,
            "Advertisement\n\nMayor Dana Smith opened the tram bridge on Saturday.".into(),
        );
        f.store.put_record(id, record).await.unwrap();

        let store: Arc<dyn WorkStore> = f.store.clone();
        let cleaning = ScoringHandler::cleaning(store.clone(), Box::new(BasicCleaner));
        let classification = ScoringHandler::classification(store.clone(), Box::new(KeywordClassifier));
        let linking = ScoringHandler::entity_linking(store.clone(), Box::new(PhraseEntityLinker::default()));

        let (item, dataset) = f.claim_one(Stage::Cleaning).await;
        cleaning.handle(&item, &dataset).await.unwrap();
        classification.handle(&item, &dataset).await.unwrap();
        linking.handle(&item, &dataset).await.unwrap();

        let record = f.store.record(id).await.unwrap().unwrap();
        assert_eq!(record.field(Field::Headline), Some("Dana Smith opens tram bridge"));
        assert!(!record.field(Field::Body).unwrap().contains("Advertisement"));
        assert_eq!(record.classification.unwrap().category, "transport");
        assert!(record.named_entities.iter().any(|e| e.name == "Dana Smith"));
    }

    #[tokio::test]
    async fn test_scoring_handler_without_record_is_an_item_error() {
        let f = fixture();
        f.store.insert_with_status("https://metro.example/2025/a", "metro", WorkStatus::Extracted);
        let handler = ScoringHandler::cleaning(f.store.clone(), Box::new(BasicCleaner));
        let (item, dataset) = f.claim_one(Stage::Cleaning).await;
        let err = handler.handle(&item, &dataset).await.unwrap_err();
        assert!(matches!(err, StageError::Handler(_)));
    }
}
