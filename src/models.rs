//! Data models shared by the orchestrator, the resilience engine and the
//! extraction chain.
//!
//! - [`WorkItem`] / [`WorkStatus`] / [`Stage`]: units of work and the
//!   pipeline state machine they move through
//! - [`Dataset`] / [`Catalog`]: groupings of publisher domains under one
//!   retrieval policy
//! - [`ExtractionResult`] and friends: per-URL output of the extraction chain
//! - [`NamedEntity`] / [`Classification`]: annotations produced by the
//!   classification and entity-linking collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Work store identifier of a [`WorkItem`].
pub type ItemId = u64;

/// Identifier of a [`Dataset`].
pub type DatasetId = String;

/// The six pipeline stages, declared in priority order.
///
/// Earlier stages feed later ones, so the orchestrator visits them in this
/// order every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovery,
    Verification,
    Extraction,
    Cleaning,
    Classification,
    EntityLinking,
}

impl Stage {
    /// All stages in priority order.
    pub const ALL: [Stage; 6] = [
        Stage::Discovery,
        Stage::Verification,
        Stage::Extraction,
        Stage::Cleaning,
        Stage::Classification,
        Stage::EntityLinking,
    ];

    /// Status an item waits in before this stage claims it.
    pub fn pending_status(self) -> WorkStatus {
        match self {
            Stage::Discovery => WorkStatus::Seed,
            Stage::Verification => WorkStatus::Candidate,
            Stage::Extraction => WorkStatus::Verified,
            Stage::Cleaning => WorkStatus::Extracted,
            Stage::Classification => WorkStatus::Cleaned,
            Stage::EntityLinking => WorkStatus::Classified,
        }
    }

    /// Status an item holds while this stage works on it.
    pub fn claimed_status(self) -> WorkStatus {
        match self {
            Stage::Discovery => WorkStatus::Discovering,
            Stage::Verification => WorkStatus::Verifying,
            Stage::Extraction => WorkStatus::Extracting,
            Stage::Cleaning => WorkStatus::Cleaning,
            Stage::Classification => WorkStatus::Classifying,
            Stage::EntityLinking => WorkStatus::Linking,
        }
    }

    /// Status an item moves to when this stage succeeds.
    pub fn done_status(self) -> WorkStatus {
        match self {
            Stage::Discovery => WorkStatus::Scanned,
            Stage::Verification => WorkStatus::Verified,
            Stage::Extraction => WorkStatus::Extracted,
            Stage::Cleaning => WorkStatus::Cleaned,
            Stage::Classification => WorkStatus::Classified,
            Stage::EntityLinking => WorkStatus::Linked,
        }
    }

    /// Whether the stage's handler contacts publisher domains.
    pub fn touches_network(self) -> bool {
        matches!(
            self,
            Stage::Discovery | Stage::Verification | Stage::Extraction
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Discovery => "discovery",
            Stage::Verification => "verification",
            Stage::Extraction => "extraction",
            Stage::Cleaning => "cleaning",
            Stage::Classification => "classification",
            Stage::EntityLinking => "entity_linking",
        };
        f.write_str(name)
    }
}

/// Status of a [`WorkItem`]. An item holds exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkStatus {
    Seed,
    Discovering,
    Scanned,
    Candidate,
    Verifying,
    Verified,
    Rejected,
    Extracting,
    Extracted,
    Cleaning,
    Cleaned,
    Classifying,
    Classified,
    Linking,
    Linked,
    Failed,
}

/// A discoverable unit: a seed listing page, a candidate link or an article.
///
/// Owned by the work store. The orchestrator only ever reads and writes
/// `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub url: String,
    /// Lowercased host of `url`.
    pub domain: String,
    pub dataset_id: DatasetId,
    pub status: WorkStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A candidate link produced by discovery, not yet stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkItem {
    pub url: String,
    pub dataset_id: DatasetId,
}

/// A logical grouping of publisher domains under one retrieval policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    #[serde(default)]
    pub name: String,
    /// Unscoped scheduling only considers datasets with this flag set.
    #[serde(default = "default_true")]
    pub cron_enabled: bool,
    /// Forces domain-exclusive batch pacing, for single-publisher datasets.
    #[serde(default)]
    pub isolation_required: bool,
    /// Hosts that belong to this dataset.
    #[serde(default)]
    pub domains: Vec<String>,
    /// Listing pages, feeds or sitemaps that discovery starts from.
    #[serde(default)]
    pub seeds: Vec<String>,
    /// Discovered links must match this regex to become candidates.
    #[serde(default)]
    pub link_pattern: Option<String>,
}

fn default_true() -> bool {
    true
}

/// The set of datasets the work store is seeded from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub datasets: Vec<Dataset>,
}

/// Structured fields the extraction chain produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Headline,
    Body,
    Author,
    PublishedAt,
}

impl Field {
    /// The fields counted towards "enough fields extracted".
    pub const CORE: [Field; 3] = [Field::Headline, Field::Body, Field::Author];

    /// Text fields are compared by word count when merging.
    pub fn is_text(self) -> bool {
        matches!(self, Field::Headline | Field::Body)
    }
}

/// Fetch/parse strategies of the extraction chain, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    Lightweight,
    Structural,
    Browser,
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExtractionMethod::Lightweight => "lightweight",
            ExtractionMethod::Structural => "structural",
            ExtractionMethod::Browser => "browser",
        };
        f.write_str(name)
    }
}

/// Overall status of one extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractionStatus {
    Success,
    PartialSuccess,
    BotProtectionDetected,
    NotFound,
    TransientFailure,
    PermanentFailure,
}

impl ExtractionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionStatus::Success => "success",
            ExtractionStatus::PartialSuccess => "partial_success",
            ExtractionStatus::BotProtectionDetected => "bot_protection_detected",
            ExtractionStatus::NotFound => "not_found",
            ExtractionStatus::TransientFailure => "transient_failure",
            ExtractionStatus::PermanentFailure => "permanent_failure",
        }
    }
}

/// Field values keyed by [`Field`].
pub type FieldMap = BTreeMap<Field, String>;

/// Output of the extraction chain for one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub url: String,
    pub fields: FieldMap,
    /// Which strategy produced each kept field.
    pub contributing_method: BTreeMap<Field, ExtractionMethod>,
    pub status: ExtractionStatus,
    /// Strategies that actually ran, in order.
    pub attempted: Vec<ExtractionMethod>,
    /// Bytes of response bodies received across all attempts.
    pub response_bytes: usize,
}

impl ExtractionResult {
    /// The strategy that contributed the body, else the last one attempted.
    pub fn primary_method(&self) -> Option<ExtractionMethod> {
        self.contributing_method
            .get(&Field::Body)
            .copied()
            .or_else(|| self.attempted.last().copied())
    }
}

/// Business data accumulated for one article as it moves through the
/// extraction, cleaning, classification and entity-linking stages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub url: String,
    pub fields: FieldMap,
    pub contributing_method: BTreeMap<Field, ExtractionMethod>,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub named_entities: Vec<NamedEntity>,
}

impl ArticleRecord {
    pub fn from_extraction(result: &ExtractionResult) -> Self {
        Self {
            url: result.url.clone(),
            fields: result.fields.clone(),
            contributing_method: result.contributing_method.clone(),
            ..Self::default()
        }
    }

    pub fn field(&self, field: Field) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }
}

/// A named entity (person, organization, place, etc.) linked from an article.
#[allow(non_snake_case)]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NamedEntity {
    /// The name of the entity.
    pub name: String,
    /// A brief description of what this entity is.
    #[serde(default)]
    pub whatIsThisEntity: String,
    /// Why this entity is relevant to the article.
    #[serde(default)]
    pub whyIsThisEntityRelevantToTheArticle: String,
}

/// Category and topic tags assigned by the classification stage.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Classification {
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_statuses_chain_forward() {
        // Discovery finishes seeds; the candidates it inserts start verification.
        assert_eq!(Stage::Discovery.done_status(), WorkStatus::Scanned);
        for pair in Stage::ALL[1..].windows(2) {
            assert_eq!(pair[0].done_status(), pair[1].pending_status());
        }
        assert_eq!(Stage::EntityLinking.done_status(), WorkStatus::Linked);
    }

    #[test]
    fn test_stage_priority_order() {
        let mut shuffled = vec![Stage::Cleaning, Stage::Discovery, Stage::EntityLinking, Stage::Extraction];
        shuffled.sort();
        assert_eq!(
            shuffled,
            vec![Stage::Discovery, Stage::Extraction, Stage::Cleaning, Stage::EntityLinking]
        );
    }

    #[test]
    fn test_only_fetching_stages_touch_network() {
        let networked: Vec<Stage> = Stage::ALL.into_iter().filter(|s| s.touches_network()).collect();
        assert_eq!(networked, vec![Stage::Discovery, Stage::Verification, Stage::Extraction]);
    }

    #[test]
    fn test_dataset_defaults_from_yaml() {
        let yaml = "id: local-news\ndomains: [example.com]\n";
        let dataset: Dataset = serde_yaml::from_str(yaml).unwrap();
        assert!(dataset.cron_enabled);
        assert!(!dataset.isolation_required);
        assert_eq!(dataset.domains, vec!["example.com".to_string()]);
        assert!(dataset.seeds.is_empty());
    }

    #[test]
    fn test_primary_method_prefers_body_contributor() {
        let mut result = ExtractionResult {
            url: "https://example.com/a".into(),
            fields: FieldMap::new(),
            contributing_method: BTreeMap::new(),
            status: ExtractionStatus::Success,
            attempted: vec![ExtractionMethod::Lightweight, ExtractionMethod::Structural],
            response_bytes: 0,
        };
        assert_eq!(result.primary_method(), Some(ExtractionMethod::Structural));
        result
            .contributing_method
            .insert(Field::Body, ExtractionMethod::Lightweight);
        assert_eq!(result.primary_method(), Some(ExtractionMethod::Lightweight));
    }

    #[test]
    fn test_named_entity_serialization() {
        let entity = NamedEntity {
            name: "John Doe".to_string(),
            whatIsThisEntity: "A person".to_string(),
            whyIsThisEntityRelevantToTheArticle: "Main subject".to_string(),
        };
        let json = serde_json::to_string(&entity).unwrap();
        let deserialized: NamedEntity = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, entity);
    }
}
