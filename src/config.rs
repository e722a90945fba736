//! Process-wide configuration.
//!
//! [`PipelineStepConfig`] is loaded once at startup from a YAML file and is
//! never mutated afterwards. Every setting is a plain number or boolean and
//! every field has a default, so an empty file (or no file at all) yields
//! a working configuration.
//!
//! The dataset [`Catalog`] lives in a second YAML file and is only used to
//! seed the work store.

use crate::errors::ConfigError;
use crate::models::{Catalog, Stage};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};

/// Immutable per-run configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineStepConfig {
    pub stages: StageTable,
    pub pacing: PacingConfig,
    pub backoff: BackoffConfig,
    pub resilience: ResilienceConfig,
    pub extraction: ExtractionConfig,
}

/// Settings for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    pub enabled: bool,
    pub batch_size: usize,
    /// Batch size varies by up to this percentage either way.
    pub batch_jitter_pct: u32,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 10,
            batch_jitter_pct: 20,
        }
    }
}

/// One [`StageSettings`] per pipeline stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTable {
    pub discovery: StageSettings,
    pub verification: StageSettings,
    pub extraction: StageSettings,
    pub cleaning: StageSettings,
    pub classification: StageSettings,
    pub entity_linking: StageSettings,
}

impl StageTable {
    pub fn get(&self, stage: Stage) -> &StageSettings {
        match stage {
            Stage::Discovery => &self.discovery,
            Stage::Verification => &self.verification,
            Stage::Extraction => &self.extraction,
            Stage::Cleaning => &self.cleaning,
            Stage::Classification => &self.classification,
            Stage::EntityLinking => &self.entity_linking,
        }
    }

    /// Enabled stages in priority order.
    pub fn enabled(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| self.get(*s).enabled)
            .collect()
    }
}

/// Request spacing and inter-cycle sleep settings, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub inter_request_min_secs: f64,
    pub inter_request_max_secs: f64,
    /// Long pause between batches of an isolated single-domain dataset.
    pub batch_sleep_base_secs: f64,
    /// Added on top of the base, never subtracted.
    pub batch_sleep_jitter_pct: u32,
    /// Pause between cycles when other domains could be interleaved.
    pub short_sleep_secs: f64,
    /// Pause when a cycle found nothing to dispatch.
    pub idle_sleep_secs: f64,
    pub request_timeout_secs: f64,
    /// Handlers wait for a domain at most this long before deferring its items.
    pub max_admission_wait_secs: f64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            inter_request_min_secs: 90.0,
            inter_request_max_secs: 180.0,
            batch_sleep_base_secs: 900.0,
            batch_sleep_jitter_pct: 25,
            short_sleep_secs: 20.0,
            idle_sleep_secs: 60.0,
            request_timeout_secs: 30.0,
            max_admission_wait_secs: 240.0,
        }
    }
}

impl PacingConfig {
    pub fn inter_request_min(&self) -> Duration {
        secs(self.inter_request_min_secs)
    }

    pub fn inter_request_max(&self) -> Duration {
        secs(self.inter_request_max_secs)
    }

    pub fn batch_sleep_base(&self) -> Duration {
        secs(self.batch_sleep_base_secs)
    }

    pub fn short_sleep(&self) -> Duration {
        secs(self.short_sleep_secs)
    }

    pub fn idle_sleep(&self) -> Duration {
        secs(self.idle_sleep_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs)
    }

    pub fn max_admission_wait(&self) -> Duration {
        secs(self.max_admission_wait_secs)
    }
}

/// Exponential backoff for one error class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_secs: f64,
    pub cap_secs: f64,
}

impl BackoffPolicy {
    pub fn base(&self) -> Duration {
        secs(self.base_secs)
    }

    pub fn cap(&self) -> Duration {
        secs(self.cap_secs)
    }
}

/// Backoff policies per error class, plus the multiplicative jitter range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub rate_limited: BackoffPolicy,
    pub bot_protection: BackoffPolicy,
    pub transient: BackoffPolicy,
    pub jitter_min: f64,
    pub jitter_max: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rate_limited: BackoffPolicy {
                base_secs: 60.0,
                cap_secs: 3_600.0,
            },
            bot_protection: BackoffPolicy {
                base_secs: 600.0,
                cap_secs: 86_400.0,
            },
            transient: BackoffPolicy {
                base_secs: 15.0,
                cap_secs: 900.0,
            },
            jitter_min: 0.8,
            jitter_max: 1.2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Sensitivity drops by one after this many consecutive successes.
    pub decay_after_successes: u32,
    /// Consecutive failures after which a domain sits out the rest of a batch.
    pub batch_domain_failure_threshold: u32,
    /// Domains worked on concurrently within one batch.
    pub concurrency_cap: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            decay_after_successes: 10,
            batch_domain_failure_threshold: 2,
            concurrency_cap: 4,
        }
    }
}

/// Per-domain CSS selectors for the structural strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteRule {
    pub domain: String,
    pub headline: Option<String>,
    pub body: Option<String>,
    pub author: Option<String>,
    pub published: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// How many of headline/body/author must be populated (body always is).
    pub min_core_fields: usize,
    /// A later text value replaces a held one only with this many more words.
    pub min_extra_words: usize,
    pub browser_enabled: bool,
    pub site_rules: Vec<SiteRule>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            min_core_fields: 2,
            min_extra_words: 10,
            browser_enabled: false,
            site_rules: Vec::new(),
        }
    }
}

impl ExtractionConfig {
    /// Site rule for `domain`, also matching parent domains (`www.x.com` → `x.com`).
    pub fn site_rule(&self, domain: &str) -> Option<&SiteRule> {
        self.site_rules.iter().find(|rule| {
            domain == rule.domain || domain.ends_with(&format!(".{}", rule.domain))
        })
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl PipelineStepConfig {
    /// Parse and validate a configuration from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineStepConfig = if text.trim().is_empty() {
            PipelineStepConfig::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from `path`, or the defaults when no path is given.
    #[instrument(level = "info")]
    pub async fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            info!("No config file given; using defaults");
            let config = PipelineStepConfig::default();
            config.validate()?;
            return Ok(config);
        };
        let text = read_to_string(path).await?;
        let config = Self::from_yaml(&text)?;
        info!(path, enabled_stages = ?config.stages.enabled(), "Loaded pipeline configuration");
        Ok(config)
    }

    /// Reject settings that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pacing;
        let b = &self.backoff;
        for (name, value) in [
            ("inter_request_min_secs", p.inter_request_min_secs),
            ("inter_request_max_secs", p.inter_request_max_secs),
            ("batch_sleep_base_secs", p.batch_sleep_base_secs),
            ("short_sleep_secs", p.short_sleep_secs),
            ("idle_sleep_secs", p.idle_sleep_secs),
            ("request_timeout_secs", p.request_timeout_secs),
            ("max_admission_wait_secs", p.max_admission_wait_secs),
            ("backoff.rate_limited.base_secs", b.rate_limited.base_secs),
            ("backoff.rate_limited.cap_secs", b.rate_limited.cap_secs),
            ("backoff.bot_protection.base_secs", b.bot_protection.base_secs),
            ("backoff.bot_protection.cap_secs", b.bot_protection.cap_secs),
            ("backoff.transient.base_secs", b.transient.base_secs),
            ("backoff.transient.cap_secs", b.transient.cap_secs),
            ("backoff.jitter_min", b.jitter_min),
            ("backoff.jitter_max", b.jitter_max),
        ] {
            if !value.is_finite() {
                return Err(ConfigError::Invalid(format!("{name} must be a finite number")));
            }
        }

        if p.inter_request_min_secs < 0.0 || p.inter_request_min_secs > p.inter_request_max_secs {
            return Err(ConfigError::Invalid(format!(
                "inter_request_min_secs ({}) must be between 0 and inter_request_max_secs ({})",
                p.inter_request_min_secs, p.inter_request_max_secs
            )));
        }
        if p.batch_sleep_jitter_pct > 100 {
            return Err(ConfigError::Invalid(
                "batch_sleep_jitter_pct must be at most 100".into(),
            ));
        }
        if p.request_timeout_secs <= 0.0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be positive".into()));
        }

        for (name, policy) in [
            ("rate_limited", b.rate_limited),
            ("bot_protection", b.bot_protection),
            ("transient", b.transient),
        ] {
            if policy.base_secs < 0.0 || policy.base_secs > policy.cap_secs {
                return Err(ConfigError::Invalid(format!(
                    "backoff.{name}: base_secs must be between 0 and cap_secs"
                )));
            }
        }
        if b.jitter_min <= 0.0 || b.jitter_min > b.jitter_max {
            return Err(ConfigError::Invalid(
                "backoff jitter range must satisfy 0 < jitter_min <= jitter_max".into(),
            ));
        }
        // A ratio of 2 or more would let the jitter undo one doubling step.
        if b.jitter_max / b.jitter_min >= 2.0 {
            return Err(ConfigError::Invalid(
                "backoff jitter_max / jitter_min must stay below 2".into(),
            ));
        }

        for stage in Stage::ALL {
            let s = self.stages.get(stage);
            if s.batch_size == 0 {
                return Err(ConfigError::Invalid(format!("{stage}: batch_size must be positive")));
            }
            if s.batch_jitter_pct > 100 {
                return Err(ConfigError::Invalid(format!(
                    "{stage}: batch_jitter_pct must be at most 100"
                )));
            }
        }

        if self.resilience.concurrency_cap == 0 {
            return Err(ConfigError::Invalid("concurrency_cap must be positive".into()));
        }
        if self.resilience.decay_after_successes == 0 {
            return Err(ConfigError::Invalid(
                "decay_after_successes must be positive".into(),
            ));
        }
        if self.extraction.min_core_fields > crate::models::Field::CORE.len() {
            return Err(ConfigError::Invalid(
                "min_core_fields cannot exceed the number of core fields".into(),
            ));
        }
        Ok(())
    }
}

impl Catalog {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let catalog: Catalog = serde_yaml::from_str(text)?;
        for dataset in &catalog.datasets {
            if dataset.id.trim().is_empty() {
                return Err(ConfigError::Invalid("dataset id must not be empty".into()));
            }
            if let Some(pattern) = &dataset.link_pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    ConfigError::Invalid(format!("dataset {}: bad link_pattern: {e}", dataset.id))
                })?;
            }
        }
        Ok(catalog)
    }

    #[instrument(level = "info")]
    pub async fn load(path: &str) -> Result<Self, ConfigError> {
        let text = read_to_string(path).await?;
        let catalog = Self::from_yaml(&text)?;
        info!(path, datasets = catalog.datasets.len(), "Loaded dataset catalog");
        Ok(catalog)
    }
}

async fn read_to_string(path: &str) -> Result<String, ConfigError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_yields_defaults() {
        let config = PipelineStepConfig::from_yaml("").unwrap();
        assert_eq!(config, PipelineStepConfig::default());
        assert_eq!(config.stages.enabled(), Stage::ALL.to_vec());
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let yaml = r#"
stages:
  cleaning: { enabled: false }
pacing:
  inter_request_min_secs: 5
  inter_request_max_secs: 10
backoff:
  bot_protection: { base_secs: 1200, cap_secs: 7200 }
"#;
        let config = PipelineStepConfig::from_yaml(yaml).unwrap();
        assert!(!config.stages.cleaning.enabled);
        assert_eq!(config.stages.cleaning.batch_size, 10);
        assert_eq!(config.pacing.inter_request_min(), Duration::from_secs(5));
        assert_eq!(config.backoff.bot_protection.cap(), Duration::from_secs(7200));
        assert_eq!(config.backoff.transient.base(), Duration::from_secs(15));
        assert!(!config.stages.enabled().contains(&Stage::Cleaning));
    }

    #[test]
    fn test_rejects_inverted_interval() {
        let yaml = "pacing: { inter_request_min_secs: 200, inter_request_max_secs: 100 }";
        assert!(matches!(
            PipelineStepConfig::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_base_above_cap() {
        let yaml = "backoff: { transient: { base_secs: 100, cap_secs: 10 } }";
        assert!(PipelineStepConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_wide_jitter() {
        let yaml = "backoff: { jitter_min: 0.5, jitter_max: 1.5 }";
        assert!(PipelineStepConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_non_finite_numbers() {
        for yaml in [
            "backoff: { jitter_min: .nan, jitter_max: .nan }",
            "pacing: { short_sleep_secs: .inf }",
            "pacing: { request_timeout_secs: .inf }",
            "backoff: { bot_protection: { base_secs: 600, cap_secs: .inf } }",
        ] {
            assert!(
                matches!(PipelineStepConfig::from_yaml(yaml), Err(ConfigError::Invalid(_))),
                "accepted {yaml}"
            );
        }
    }

    #[test]
    fn test_rejects_zero_batch() {
        let yaml = "stages: { extraction: { batch_size: 0 } }";
        assert!(PipelineStepConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_site_rule_matches_subdomains() {
        let config = ExtractionConfig {
            site_rules: vec![SiteRule {
                domain: "cnn.com".into(),
                headline: Some(".headline--lite".into()),
                ..SiteRule::default()
            }],
            ..ExtractionConfig::default()
        };
        assert!(config.site_rule("lite.cnn.com").is_some());
        assert!(config.site_rule("cnn.com").is_some());
        assert!(config.site_rule("notcnn.com").is_none());
    }

    #[test]
    fn test_catalog_rejects_bad_pattern() {
        let yaml = "datasets:\n  - id: x\n    link_pattern: \"([\"\n";
        assert!(Catalog::from_yaml(yaml).is_err());
    }

    #[tokio::test]
    async fn test_load_without_path_uses_defaults() {
        let config = PipelineStepConfig::load(None).await.unwrap();
        assert_eq!(config.resilience.decay_after_successes, 10);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_io_error() {
        let err = PipelineStepConfig::load(Some("/definitely/not/here.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
