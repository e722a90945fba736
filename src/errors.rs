//! Error taxonomy for the crawler.
//!
//! Per-item network failures are not errors at this level: they are
//! classified into [`Outcome`](crate::resilience::Outcome) values and
//! recovered locally. The types here cover the failures that cross a
//! component boundary:
//!
//! - [`WorkStoreError`]: the work store is unreachable or refused a
//!   transition. The only error allowed to abort a pipeline cycle.
//! - [`ConfigError`]: configuration or catalog could not be loaded.
//! - [`FetchError`]: transport-level failure of a single request.
//! - [`StageError`]: a stage handler failed for one item.
//! - [`PipelineError`]: what [`Orchestrator::tick`](crate::pipeline::Orchestrator::tick) returns.

use crate::models::{ItemId, WorkStatus};
use thiserror::Error;

/// Failures reported by the work store collaborator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorkStoreError {
    #[error("work store unavailable: {0}")]
    Unavailable(String),
    #[error("item {id} expected in status {expected:?} but found {found:?}")]
    StatusConflict {
        id: ItemId,
        expected: WorkStatus,
        found: WorkStatus,
    },
    #[error("unknown work item {0}")]
    UnknownItem(ItemId),
    #[error("unknown dataset {0}")]
    UnknownDataset(String),
}

/// Configuration and catalog loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Transport failures for one request. All of them are retryable.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("browser rendering failed: {0}")]
    Browser(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout(std::time::Duration::ZERO)
        } else if e.is_connect() {
            FetchError::Connect(e.to_string())
        } else {
            FetchError::Request(e.to_string())
        }
    }
}

/// Failure of a stage handler for a single item.
///
/// `Store` is escalated by the orchestrator; everything else is recorded
/// against the item and the batch carries on.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Store(#[from] WorkStoreError),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("model collaborator failed: {0}")]
    Model(String),
}

/// Errors that abort a pipeline cycle.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] WorkStoreError),
}
