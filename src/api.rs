//! Model collaborators for the cleaning, classification and entity-linking
//! stages.
//!
//! Every collaborator implements [`ScoringModel`] and is created once at
//! startup, initialised with [`ScoringModel::init`] before the first cycle
//! and released with [`ScoringModel::teardown`] at shutdown. The stage
//! handlers treat them as opaque scoring functions.
//!
//! - [`BasicCleaner`]: whitespace and boilerplate removal
//! - [`KeywordClassifier`]: keyword-table categorisation
//! - [`PhraseEntityLinker`]: capitalised-phrase entity extraction
//! - [`LlmScorer`]: classification or entity linking through an
//!   OpenAI-compatible LLM via `awful_aj`, wrapped in [`RetryAsk`]
//!
//! # Retry Strategy
//!
//! LLM requests are retried up to 5 times with exponential backoff starting
//! at 1 second, capped at 30 seconds, plus 0-250ms of random jitter.

use crate::errors::StageError;
use crate::models::{ArticleRecord, Classification, Field, FieldMap, NamedEntity};
use crate::utils::{looks_truncated, normalize_whitespace, truncate_for_log};
use async_trait::async_trait;
use awful_aj::api::ask;
use awful_aj::{config::AwfulJadeConfig, config_dir, template, template::ChatTemplate};
use itertools::Itertools;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::{Rng, rng};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

/// An opaque scoring collaborator with an explicit lifecycle.
#[async_trait(?Send)]
pub trait ScoringModel {
    type Output;

    fn name(&self) -> &str;

    async fn init(&self) -> Result<(), StageError> {
        Ok(())
    }

    async fn score(&self, record: &ArticleRecord) -> Result<Self::Output, StageError>;

    async fn teardown(&self) -> Result<(), StageError> {
        Ok(())
    }
}

/// Trait for async LLM interaction.
pub trait AskAsync {
    type Response;

    async fn ask(&self, text: &str) -> Result<Self::Response, Box<dyn Error>>;
}

/// Adds exponential backoff retries to any [`AskAsync`] implementation.
///
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
/// ```
pub struct RetryAsk<T> {
    inner: T,
    max_retries: usize,
    base_delay: StdDuration,
    max_delay: StdDuration,
}

impl<T> RetryAsk<T>
where
    T: AskAsync,
{
    pub fn new(inner: T, max_retries: usize, base_delay: StdDuration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: StdDuration::from_secs(30),
        }
    }
}

impl<T> fmt::Debug for RetryAsk<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryAsk")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl<T> AskAsync for RetryAsk<T>
where
    T: AskAsync,
{
    type Response = T::Response;

    #[instrument(level = "info", skip_all)]
    async fn ask(&self, text: &str) -> Result<Self::Response, Box<dyn Error>> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            let attempt_t0 = Instant::now();
            match self.inner.ask(text).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    attempt += 1;
                    let attempt_dt = attempt_t0.elapsed();
                    let total_dt = total_t0.elapsed();

                    if attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                            elapsed_ms_total = total_dt.as_millis() as u64,
                            error = %e,
                            "ask() exhausted retries"
                        );
                        return Err(e);
                    }

                    let delay = self
                        .base_delay
                        .saturating_mul(1 << (attempt - 1).min(16))
                        .min(self.max_delay);
                    let jitter_ms: u64 = rng().random_range(0..=250);
                    let delay = delay + StdDuration::from_millis(jitter_ms);

                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_attempt = attempt_dt.as_millis() as u64,
                        ?delay,
                        error = %e,
                        "ask() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Adapts `awful_aj::api::ask` to [`AskAsync`].
#[derive(Debug)]
pub struct AskFnWrapper<'a> {
    pub config: &'a AwfulJadeConfig,
    pub template: &'a ChatTemplate,
}

impl<'a> AskAsync for AskFnWrapper<'a> {
    type Response = String;

    #[instrument(level = "debug", skip_all)]
    async fn ask(&self, text: &str) -> Result<Self::Response, Box<dyn Error>> {
        let t0 = Instant::now();
        let res = ask(self.config, text.to_string(), self.template, None, None).await;
        if let Err(e) = &res {
            warn!(elapsed_ms = t0.elapsed().as_millis() as u64, error = %e, "API call failed");
        }
        res
    }
}

/// Prompt text for an article: headline, blank line, body.
fn prompt_for(record: &ArticleRecord) -> String {
    let headline = record.field(Field::Headline).unwrap_or_default();
    let body = record.field(Field::Body).unwrap_or_default();
    format!("{headline}\n\n{body}")
}

/// Parsing of a model's JSON reply into a stage output.
pub trait FromModelReply: Sized {
    fn from_reply(json: &str) -> Result<Self, serde_json::Error>;
}

impl FromModelReply for Classification {
    fn from_reply(json: &str) -> Result<Self, serde_json::Error> {
        let mut classification: Classification = serde_json::from_str(json)?;
        classification.category = classification.category.trim().to_lowercase();
        classification.tags = classification.tags.into_iter().unique().collect();
        Ok(classification)
    }
}

#[allow(non_snake_case)]
#[derive(Deserialize)]
struct EntityReply {
    #[serde(default)]
    namedEntities: Vec<NamedEntity>,
}

impl FromModelReply for Vec<NamedEntity> {
    fn from_reply(json: &str) -> Result<Self, serde_json::Error> {
        let reply: EntityReply = serde_json::from_str(json)?;
        Ok(reply
            .namedEntities
            .into_iter()
            .unique_by(|e| e.name.clone())
            .collect())
    }
}

struct LlmHandle {
    config: AwfulJadeConfig,
    template: ChatTemplate,
}

/// LLM-backed scorer. `O` is the stage output parsed from the reply.
pub struct LlmScorer<O> {
    name: String,
    template_name: String,
    config_path: Option<String>,
    handle: Mutex<Option<Arc<LlmHandle>>>,
    _output: PhantomData<fn() -> O>,
}

impl<O> LlmScorer<O> {
    /// `config_path` defaults to `config.yaml` in the awful_aj config directory.
    pub fn new(name: &str, template_name: &str, config_path: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            template_name: template_name.to_string(),
            config_path,
            handle: Mutex::new(None),
            _output: PhantomData,
        }
    }

    fn handle(&self) -> Result<Arc<LlmHandle>, StageError> {
        self.handle
            .lock()
            .clone()
            .ok_or_else(|| StageError::Model(format!("{} used before init", self.name)))
    }
}

impl<O> fmt::Debug for LlmScorer<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmScorer")
            .field("name", &self.name)
            .field("template_name", &self.template_name)
            .field("ready", &self.handle.lock().is_some())
            .finish()
    }
}

fn model_error(e: impl fmt::Display) -> StageError {
    StageError::Model(e.to_string())
}

#[async_trait(?Send)]
impl<O> ScoringModel for LlmScorer<O>
where
    O: FromModelReply,
{
    type Output = O;

    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(level = "info", skip_all, fields(name = %self.name))]
    async fn init(&self) -> Result<(), StageError> {
        let template = template::load_template(&self.template_name)
            .await
            .map_err(model_error)?;
        let config_path = match &self.config_path {
            Some(path) => path.clone(),
            None => config_dir()
                .map_err(model_error)?
                .join("config.yaml")
                .to_string_lossy()
                .into_owned(),
        };
        let config = awful_aj::config::load_config(&config_path).map_err(model_error)?;
        info!(template = %self.template_name, %config_path, "LLM scorer ready");
        *self.handle.lock() = Some(Arc::new(LlmHandle { config, template }));
        Ok(())
    }

    #[instrument(level = "info", skip_all, fields(name = %self.name, url = %record.url))]
    async fn score(&self, record: &ArticleRecord) -> Result<O, StageError> {
        let handle = self.handle()?;
        let client = RetryAsk::new(
            AskFnWrapper {
                config: &handle.config,
                template: &handle.template,
            },
            5,
            StdDuration::from_secs(1),
        );
        let prompt = prompt_for(record);
        let reply = client.ask(&prompt).await.map_err(model_error)?;
        match O::from_reply(&reply) {
            Ok(out) => Ok(out),
            Err(e) if looks_truncated(&e) => {
                warn!(error = %e, "EOF while parsing; re-asking once");
                let reply = client.ask(&prompt).await.map_err(model_error)?;
                O::from_reply(&reply).map_err(model_error)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    response_preview = %truncate_for_log(&reply, 300),
                    "Model returned non-conforming JSON"
                );
                Err(model_error(e))
            }
        }
    }

    async fn teardown(&self) -> Result<(), StageError> {
        if self.handle.lock().take().is_some() {
            info!(name = %self.name, "LLM scorer released");
        }
        Ok(())
    }
}

static BOILERPLATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(advertisement|sponsored content|subscribe( now| today)?\b|sign up for\b|read more:?|related:|share this( article| story)?|follow us on\b|click here\b|(all rights reserved|copyright)\b)",
    )
    .expect("boilerplate regex is valid")
});

static SITE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+[|–-]\s+[^|–-]{2,40}$").expect("site suffix regex is valid"));

/// Whitespace and boilerplate removal.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicCleaner;

impl BasicCleaner {
    pub fn clean_body(body: &str) -> String {
        body.split("\n\n")
            .map(normalize_whitespace)
            .filter(|p| !p.is_empty() && !BOILERPLATE.is_match(p))
            .dedup()
            .join("\n\n")
    }

    pub fn clean_headline(headline: &str) -> String {
        let headline = normalize_whitespace(headline);
        SITE_SUFFIX.replace(&headline, "").into_owned()
    }
}

#[async_trait(?Send)]
impl ScoringModel for BasicCleaner {
    type Output = FieldMap;

    fn name(&self) -> &str {
        "basic_cleaner"
    }

    async fn score(&self, record: &ArticleRecord) -> Result<FieldMap, StageError> {
        let mut fields = FieldMap::new();
        for (field, value) in &record.fields {
            let cleaned = match field {
                Field::Body => Self::clean_body(value),
                Field::Headline => Self::clean_headline(value),
                _ => normalize_whitespace(value),
            };
            if !cleaned.is_empty() {
                fields.insert(*field, cleaned);
            }
        }
        Ok(fields)
    }
}

const CATEGORIES: &[(&str, &[&str])] = &[
    (
        "politics",
        &["election", "minister", "parliament", "senate", "congress", "president", "vote", "campaign", "governor", "council"],
    ),
    (
        "business",
        &["market", "shares", "company", "economy", "inflation", "bank", "profit", "revenue", "investors", "budget"],
    ),
    (
        "technology",
        &["software", "ai", "startup", "app", "chip", "cyber", "internet", "data", "robot", "smartphone"],
    ),
    (
        "sports",
        &["match", "league", "season", "coach", "goal", "championship", "tournament", "player", "cup", "team"],
    ),
    (
        "health",
        &["hospital", "vaccine", "disease", "patients", "doctors", "health", "virus", "medical", "drug", "outbreak"],
    ),
    (
        "science",
        &["research", "scientists", "study", "climate", "space", "nasa", "species", "experiment", "telescope", "fossil"],
    ),
    (
        "transport",
        &["tram", "rail", "bus", "airport", "traffic", "bridge", "road", "train", "transit", "station"],
    ),
];

/// Categorises by counting keyword hits per category.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn classify(text: &str) -> Classification {
        let mut words: HashMap<String, usize> = HashMap::new();
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            *words.entry(word.to_lowercase()).or_insert(0) += 1;
        }

        let scored: Vec<(&str, usize, Vec<&str>)> = CATEGORIES
            .iter()
            .map(|(category, keywords)| {
                let hits: Vec<&str> = keywords
                    .iter()
                    .copied()
                    .filter(|k| words.contains_key(*k))
                    .collect();
                let score = hits.iter().map(|k| words[*k]).sum();
                (*category, score, hits)
            })
            .collect();

        match scored
            .into_iter()
            .filter(|(_, score, _)| *score > 0)
            .max_by_key(|(_, score, _)| *score)
        {
            Some((category, _, hits)) => Classification {
                category: category.to_string(),
                tags: hits.into_iter().take(5).map(str::to_string).collect(),
            },
            None => Classification {
                category: "general".into(),
                tags: Vec::new(),
            },
        }
    }
}

#[async_trait(?Send)]
impl ScoringModel for KeywordClassifier {
    type Output = Classification;

    fn name(&self) -> &str {
        "keyword_classifier"
    }

    async fn score(&self, record: &ArticleRecord) -> Result<Classification, StageError> {
        Ok(Self::classify(&prompt_for(record)))
    }
}

static CAPITALISED_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Z][a-z]+(?:[ ]+(?:of[ ]+|de[ ]+)?[A-Z][a-z]+)+\b").expect("phrase regex is valid")
});

/// Extracts multi-word capitalised phrases as named entities.
#[derive(Debug, Clone, Copy)]
pub struct PhraseEntityLinker {
    pub max_entities: usize,
}

impl Default for PhraseEntityLinker {
    fn default() -> Self {
        Self { max_entities: 10 }
    }
}

impl PhraseEntityLinker {
    pub fn link(&self, headline: &str, body: &str) -> Vec<NamedEntity> {
        let text = format!("{headline}\n\n{body}");
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut order = Vec::new();
        for m in CAPITALISED_PHRASE.find_iter(&text) {
            let count = counts.entry(m.as_str()).or_insert(0);
            if *count == 0 {
                order.push(m.as_str());
            }
            *count += 1;
        }
        order
            .into_iter()
            .sorted_by_key(|name| std::cmp::Reverse(counts[name]))
            .take(self.max_entities)
            .map(|name| {
                let mentions = counts[name];
                NamedEntity {
                    name: name.to_string(),
                    whatIsThisEntity: format!("Proper noun mentioned {mentions} time(s)"),
                    whyIsThisEntityRelevantToTheArticle: if headline.contains(name) {
                        "Named in the headline".into()
                    } else {
                        "Named in the article body".into()
                    },
                }
            })
            .collect()
    }
}

#[async_trait(?Send)]
impl ScoringModel for PhraseEntityLinker {
    type Output = Vec<NamedEntity>;

    fn name(&self) -> &str {
        "phrase_entity_linker"
    }

    async fn score(&self, record: &ArticleRecord) -> Result<Vec<NamedEntity>, StageError> {
        Ok(self.link(
            record.field(Field::Headline).unwrap_or_default(),
            record.field(Field::Body).unwrap_or_default(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    struct Flaky {
        failures: Cell<usize>,
        calls: Cell<usize>,
    }

    impl AskAsync for Flaky {
        type Response = String;

        async fn ask(&self, text: &str) -> Result<String, Box<dyn Error>> {
            self.calls.set(self.calls.get() + 1);
            if self.failures.get() > 0 {
                self.failures.set(self.failures.get() - 1);
                return Err("503 from upstream".into());
            }
            Ok(text.to_uppercase())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ask_recovers_after_failures() {
        let retry = RetryAsk::new(
            Flaky {
                failures: Cell::new(3),
                calls: Cell::new(0),
            },
            5,
            StdDuration::from_secs(1),
        );
        let t0 = tokio::time::Instant::now();
        assert_eq!(retry.ask("ok").await.unwrap(), "OK");
        assert_eq!(retry.inner.calls.get(), 4);
        // 1s + 2s + 4s of backoff, plus jitter.
        assert!(t0.elapsed() >= StdDuration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_ask_gives_up_after_max_retries() {
        let retry = RetryAsk::new(
            Flaky {
                failures: Cell::new(100),
                calls: Cell::new(0),
            },
            2,
            StdDuration::from_millis(10),
        );
        assert!(retry.ask("x").await.is_err());
        assert_eq!(retry.inner.calls.get(), 3);
    }

    fn record(headline: &str, body: &str) -> ArticleRecord {
        let mut record = ArticleRecord {
            url: "https://example.com/a".into(),
            ..ArticleRecord::default()
        };
        record.fields.insert(Field::Headline, headline.into());
        record.fields.insert(Field::Body, body.into());
        record
    }

    #[tokio::test]
    async fn test_cleaner_strips_boilerplate_and_site_suffix() {
        let body = "First   paragraph of the story.\n\nAdvertisement\n\n\
                    First paragraph of the story.\n\nSubscribe now for more\n\nClosing line.";
        let cleaned = BasicCleaner
            .score(&record("Tram crosses bridge | Example News", body))
            .await
            .unwrap();
        assert_eq!(cleaned[&Field::Headline], "Tram crosses bridge");
        assert_eq!(
            cleaned[&Field::Body],
            "First paragraph of the story.\n\nClosing line."
        );
    }

    #[test]
    fn test_keyword_classifier_picks_dominant_category() {
        let c = KeywordClassifier::classify(
            "The council approved the tram budget. The new tram line and the bridge open in May.",
        );
        assert_eq!(c.category, "transport");
        assert!(c.tags.contains(&"tram".to_string()));
        assert_eq!(KeywordClassifier::classify("Nothing to see.").category, "general");
    }

    #[test]
    fn test_phrase_linker_ranks_by_mentions() {
        let linker = PhraseEntityLinker::default();
        let entities = linker.link(
            "Dana Smith opens River Line",
            "Mayor Dana Smith said the River Line would open. Dana Smith thanked the Port of Leith.",
        );
        assert_eq!(entities[0].name, "Dana Smith");
        assert!(entities.iter().any(|e| e.name == "Port of Leith"));
        assert_eq!(entities[0].whyIsThisEntityRelevantToTheArticle, "Named in the headline");
    }

    #[test]
    fn test_entity_reply_dedupes_by_name() {
        let json = r#"{"namedEntities":[{"name":"NASA"},{"name":"NASA","whatIsThisEntity":"agency"},{"name":"ESA"}]}"#;
        let entities = Vec::<NamedEntity>::from_reply(json).unwrap();
        assert_eq!(entities.len(), 2);
    }

    #[test]
    fn test_classification_reply_is_normalised() {
        let c = Classification::from_reply(r#"{"category":" Politics ","tags":["vote","vote"]}"#).unwrap();
        assert_eq!(c.category, "politics");
        assert_eq!(c.tags, vec!["vote"]);
    }

    #[tokio::test]
    async fn test_llm_scorer_requires_init() {
        let scorer: LlmScorer<Classification> = LlmScorer::new("llm_classifier", "news_classifier", None);
        let err = scorer.score(&record("a", "b")).await.unwrap_err();
        assert!(matches!(err, StageError::Model(_)));
    }
}
