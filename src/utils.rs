//! Small helpers used across the crawler.
//!
//! - String truncation and word counting for logs and field merging
//! - Host extraction for domain keys
//! - Jitter helpers for batch sizes and sleep intervals
//! - JSON error detection for handling truncated LLM responses
//! - File system validation for output directories

use rand::Rng;
use std::error::Error;
use std::fs as stdfs;
use std::time::Duration;
use tokio::fs;
use tracing::{info, instrument};
use url::Url;

/// Truncate a string for logging purposes.
///
/// Long strings are cut to at most `max` bytes (backing off to a character
/// boundary) with an ellipsis and the number of dropped bytes appended.
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Number of whitespace-separated words.
pub fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased host of `url`, the key the resilience engine tracks domains by.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Vary `value` by up to `pct` percent either way, never below one.
pub fn jitter_count<R: Rng + ?Sized>(value: usize, pct: u32, rng: &mut R) -> usize {
    if pct == 0 || value == 0 {
        return value.max(1);
    }
    let spread = (value as f64 * pct as f64 / 100.0).round() as i64;
    let delta = rng.random_range(-spread..=spread);
    (value as i64 + delta).max(1) as usize
}

/// `base` plus a random extra of up to `pct` percent of it.
pub fn jitter_up<R: Rng + ?Sized>(base: Duration, pct: u32, rng: &mut R) -> Duration {
    if pct == 0 {
        return base;
    }
    let extra = rng.random_range(0.0..=pct as f64 / 100.0);
    base + base.mul_f64(extra)
}

/// Uniform duration in `[min, max]`.
pub fn uniform_between<R: Rng + ?Sized>(min: Duration, max: Duration, rng: &mut R) -> Duration {
    if max <= min {
        return min;
    }
    Duration::from_secs_f64(rng.random_range(min.as_secs_f64()..=max.as_secs_f64()))
}

/// Detect if a serde_json error indicates truncated/incomplete JSON.
///
/// When an LLM response is cut off the JSON fails to parse with an EOF
/// error; callers re-ask once in that case.
pub fn looks_truncated(e: &serde_json::Error) -> bool {
    use serde_json::error::Category;
    matches!(e.classify(), Category::Eof)
}

/// Ensure a directory exists and is writable.
///
/// Creates the directory if needed, then creates and immediately deletes a
/// probe file.
#[instrument(level = "info", skip_all, fields(path = %path))]
pub async fn ensure_writable_dir(path: &str) -> Result<(), Box<dyn Error>> {
    fs::create_dir_all(path).await?;
    let probe_path = format!("{}/..__probe_write__", path.trim_end_matches('/'));
    match stdfs::File::create(&probe_path) {
        Ok(_) => {
            let _ = stdfs::remove_file(&probe_path);
            info!("Output directory is writable");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}
