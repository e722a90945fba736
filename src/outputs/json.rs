//! JSON export of finished articles.
//!
//! Items that reached `Linked` are written, with their accumulated
//! [`ArticleRecord`], to one file per local date:
//!
//! ```text
//! json_output_dir/
//! └── 2025-05-06/
//!     └── articles.json
//! ```
//!
//! The file is rewritten on every export, so it always holds the full set
//! of finished articles known to the store.

use crate::errors::WorkStoreError;
use crate::models::{ArticleRecord, DatasetId, ItemId, WorkStatus};
use crate::store::WorkStore;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::error::Error;
use tokio::fs;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedArticle {
    pub id: ItemId,
    pub dataset_id: DatasetId,
    #[serde(flatten)]
    pub record: ArticleRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArticleExport {
    pub local_date: String,
    pub generated_at: DateTime<Utc>,
    pub articles: Vec<ExportedArticle>,
}

/// Gather every `Linked` item that has a record.
pub async fn collect_linked(store: &dyn WorkStore) -> Result<Vec<ExportedArticle>, WorkStoreError> {
    let mut articles = Vec::new();
    for item in store.items_in(WorkStatus::Linked).await? {
        match store.record(item.id).await? {
            Some(record) => articles.push(ExportedArticle {
                id: item.id,
                dataset_id: item.dataset_id,
                record,
            }),
            None => warn!(item_id = item.id, url = %item.url, "Linked item has no record; not exporting"),
        }
    }
    articles.sort_by_key(|a| a.id);
    Ok(articles)
}

/// Write `export` to `{json_output_dir}/{local_date}/articles.json`.
#[instrument(level = "info", skip_all, fields(json_output_dir = %json_output_dir))]
pub async fn write_export(export: &ArticleExport, json_output_dir: &str) -> Result<String, Box<dyn Error>> {
    let json = serde_json::to_string(export)?;

    let full_json_dir = format!("{}/{}", json_output_dir, export.local_date);
    info!(%full_json_dir, "Ensuring JSON directory exists");
    if let Err(e) = fs::create_dir_all(&full_json_dir).await {
        error!(%full_json_dir, error = %e, "Failed to create JSON dir");
        return Err(e.into());
    }

    let path = format!("{}/articles.json", full_json_dir);
    fs::write(&path, json).await?;
    info!(%path, articles = export.articles.len(), "Wrote article export");
    Ok(path)
}

/// Export all finished articles. Returns the written path, or `None` when
/// there was nothing to export.
pub async fn export_linked(store: &dyn WorkStore, json_output_dir: &str) -> Result<Option<String>, Box<dyn Error>> {
    let articles = collect_linked(store).await?;
    if articles.is_empty() {
        return Ok(None);
    }
    let export = ArticleExport {
        local_date: Local::now().date_naive().to_string(),
        generated_at: Utc::now(),
        articles,
    };
    write_export(&export, json_output_dir).await.map(Some)
}
