//! # Newsroom Crawler
//!
//! A polite, long-running news crawler. It discovers article links from
//! publisher seed pages, verifies them, extracts article fields through an
//! escalating chain of strategies, then cleans, classifies and links
//! entities before exporting finished articles as JSON.
//!
//! ## Usage
//!
//! ```sh
//! newsroom_crawler --catalog ./catalog.yaml -c ./pipeline.yaml -j ./json
//! ```
//!
//! ## Architecture
//!
//! - [`pipeline`]: the orchestrator loop, batch pacing and sleep planning
//! - [`resilience`]: per-domain admission, backoff and response classification
//! - [`extraction`]: lightweight → structural → browser fallback chain
//! - [`store`]: the work store every stage claims from and transitions in
//! - [`api`]: cleaning, classification and entity-linking collaborators

use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod api;
mod cli;
mod config;
mod errors;
mod extraction;
mod fetch;
mod models;
mod outputs;
mod pipeline;
mod resilience;
mod store;
mod telemetry;
mod utils;

use api::{BasicCleaner, KeywordClassifier, LlmScorer, PhraseEntityLinker, ScoringModel};
use cli::Cli;
use config::PipelineStepConfig;
use extraction::ExtractionChain;
use fetch::{Fetcher, HttpFetcher};
use models::{Catalog, Classification, NamedEntity};
use pipeline::Orchestrator;
use pipeline::handlers::{DiscoveryHandler, ExtractionHandler, GuardedFetch, ScoringHandler, VerificationHandler};
use resilience::DomainResilienceEngine;
use store::{ClaimFilter, MemoryWorkStore, WorkStore};
use telemetry::{DEFAULT_CAPACITY, JsonLinesSink, TelemetrySink, TracingSink};
use utils::ensure_writable_dir;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("newsroom_crawler starting up");

    let args = Cli::parse();
    debug!(?args, "Parsed CLI arguments");

    let config = Arc::new(PipelineStepConfig::load(args.config.as_deref()).await?);
    let catalog = Catalog::load(&args.catalog).await?;

    if let Some(dir) = &args.json_output_dir {
        if let Err(e) = ensure_writable_dir(dir).await {
            error!(
                path = %dir,
                error = %e,
                "JSON output directory is not writable (fix perms or choose a different path)"
            );
            return Err(e);
        }
    }

    let filter = match &args.dataset {
        Some(id) => {
            if !catalog.datasets.iter().any(|d| &d.id == id) {
                error!(dataset = %id, "Dataset is not in the catalog");
                return Err(format!("unknown dataset {id}").into());
            }
            info!(dataset = %id, "Targeting a single dataset");
            ClaimFilter::targeted(id.clone())
        }
        None => ClaimFilter::scheduled(),
    };

    // ---- Collaborators ----
    let memory_store = Arc::new(MemoryWorkStore::from_catalog(&catalog));
    let store: Arc<dyn WorkStore> = memory_store.clone();
    let dre = Arc::new(DomainResilienceEngine::new(&config));
    let http: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.pacing.request_timeout())?);
    let browser = browser_fetcher(&config);
    let chain = Arc::new(ExtractionChain::new(
        Arc::clone(&dre),
        Arc::clone(&http),
        browser,
        Arc::clone(&config),
    ));
    let fetch = GuardedFetch::new(Arc::clone(&dre), http, config.pacing.max_admission_wait());

    let (json_sink, writer) = match &args.telemetry_path {
        Some(path) => {
            let (sink, handle) = JsonLinesSink::spawn(path, DEFAULT_CAPACITY).await?;
            (Some(Arc::new(sink)), Some(handle))
        }
        None => (None, None),
    };
    let telemetry: Arc<dyn TelemetrySink> = match &json_sink {
        Some(sink) => Arc::clone(sink) as Arc<dyn TelemetrySink>,
        None => Arc::new(TracingSink),
    };

    let classifier: Box<dyn ScoringModel<Output = Classification>> = if args.llm {
        Box::new(LlmScorer::<Classification>::new(
            "llm_classifier",
            "news_classifier",
            args.llm_config.clone(),
        ))
    } else {
        Box::new(KeywordClassifier)
    };
    let linker: Box<dyn ScoringModel<Output = Vec<NamedEntity>>> = if args.llm {
        Box::new(LlmScorer::<Vec<NamedEntity>>::new(
            "llm_entity_linker",
            "news_entities",
            args.llm_config.clone(),
        ))
    } else {
        Box::new(PhraseEntityLinker::default())
    };
    if args.llm {
        info!("Using the LLM for classification and entity linking");
    }

    let mut orchestrator = Orchestrator::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&dre),
        telemetry,
        filter,
    )
    .with_handler(Box::new(DiscoveryHandler::new(fetch.clone(), Arc::clone(&store))))
    .with_handler(Box::new(VerificationHandler::new(fetch)))
    .with_handler(Box::new(ExtractionHandler::new(chain, Arc::clone(&store))))
    .with_handler(Box::new(ScoringHandler::cleaning(Arc::clone(&store), Box::new(BasicCleaner))))
    .with_handler(Box::new(ScoringHandler::classification(Arc::clone(&store), classifier)))
    .with_handler(Box::new(ScoringHandler::entity_linking(Arc::clone(&store), linker)));
    if let Some(dir) = &args.json_output_dir {
        orchestrator = orchestrator.with_export_dir(dir.clone());
    }

    orchestrator.init().await?;

    // ---- Run ----
    let result = if args.once {
        match orchestrator.tick().await {
            Ok(report) => orchestrator.after_cycle(&report).await,
            Err(e) => Err(e),
        }
    } else {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(tokio::signal::ctrl_c(), shutdown_tx));
        orchestrator.run(shutdown_rx).await
    };

    orchestrator.teardown().await;
    drop(orchestrator);

    if let Some(sink) = json_sink {
        if sink.dropped() > 0 {
            warn!(dropped = sink.dropped(), "Telemetry events were dropped");
        }
    }
    if let Some(handle) = writer {
        if let Err(e) = handle.await {
            error!(error = %e, "Telemetry writer task failed");
        }
    }

    info!(counts = ?memory_store.status_counts(), "Final work item counts");
    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        "Execution complete"
    );

    if let Err(e) = &result {
        error!(error = %e, "Pipeline stopped on a work store failure");
    }
    result.map_err(Into::into)
}

/// Flip `shutdown` once `signal` fires. If listening fails the sender is
/// held forever, since dropping it would read as a shutdown request.
async fn forward_shutdown<F>(signal: F, shutdown: watch::Sender<bool>)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        warn!(error = %e, "Failed to listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
    info!("Ctrl-C received; stopping after the current cycle");
    let _ = shutdown.send(true);
}

#[cfg(feature = "browser")]
fn browser_fetcher(config: &PipelineStepConfig) -> Option<Arc<dyn Fetcher>> {
    config.extraction.browser_enabled.then(|| {
        Arc::new(fetch::ChromiumFetcher::new(config.pacing.request_timeout())) as Arc<dyn Fetcher>
    })
}

#[cfg(not(feature = "browser"))]
fn browser_fetcher(config: &PipelineStepConfig) -> Option<Arc<dyn Fetcher>> {
    if config.extraction.browser_enabled {
        warn!("browser_enabled is set but this build lacks the `browser` feature; skipping browser extraction");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_signal_requests_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(forward_shutdown(async { Ok::<(), std::io::Error>(()) }, tx));
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_signal_listener_keeps_pipeline_running() {
        let (tx, mut rx) = watch::channel(false);
        let failing = async { Err::<(), _>(std::io::Error::other("no signal handler")) };
        tokio::spawn(forward_shutdown(failing, tx));
        let waited = tokio::time::timeout(Duration::from_secs(3600), rx.changed()).await;
        assert!(waited.is_err(), "sender was dropped or flipped");
        assert!(!*rx.borrow());
    }
}
