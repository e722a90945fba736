//! Extraction Fallback Chain.
//!
//! Produces the most complete record for one URL, escalating from cheap to
//! expensive strategies only when warranted:
//!
//! 1. **Lightweight**: plain fetch + article-body heuristics
//! 2. **Structural**: site-rule selectors and JSON-LD. Reuses the
//!    lightweight body when that fetch succeeded, otherwise fetches itself
//! 3. **Browser**: rendered DOM, when a browser fetcher is configured
//!
//! Every request leases the domain from the resilience engine first and
//! reports its outcome afterwards.
//!
//! # Escalation
//!
//! | Step outcome | Next |
//! |--------------|------|
//! | success, enough fields | stop |
//! | success, insufficient fields | escalate |
//! | `TransientFailure` / `BotProtectionDetected` | escalate |
//! | `RateLimited` | stop, the domain is backed off |
//! | `PermanentFailure` (404/410 and friends) | stop, never escalate |
//! | domain not leasable within the admission window | stop |
//!
//! Escalation never jumps a backoff. A bot signal only reaches the next
//! strategy when the backoff it earned fits inside `max_admission_wait`;
//! with the default bot-protection base (600s) it does not, so the chain
//! ends with `BotProtectionDetected` and the item is retried in a later
//! cycle.

pub mod merge;
pub mod parsers;

use crate::config::PipelineStepConfig;
use crate::fetch::{FetchedPage, Fetcher};
use crate::models::{ExtractionMethod, ExtractionResult, ExtractionStatus, Field, FieldMap};
use crate::resilience::classify::is_not_found;
use crate::resilience::{DomainResilienceEngine, Outcome, classify_response};
use crate::utils::host_of;
use merge::{MergePolicy, merge_into};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// What one strategy step produced.
enum Step {
    /// The domain could not be leased; nothing was sent.
    Unavailable,
    /// A response (or a reused body) was classified and parsed.
    Parsed {
        outcome: Outcome,
        status: u16,
        fields: FieldMap,
        body: Option<String>,
        bytes: usize,
    },
}

pub struct ExtractionChain {
    dre: Arc<DomainResilienceEngine>,
    http: Arc<dyn Fetcher>,
    browser: Option<Arc<dyn Fetcher>>,
    config: Arc<PipelineStepConfig>,
}

impl ExtractionChain {
    pub fn new(
        dre: Arc<DomainResilienceEngine>,
        http: Arc<dyn Fetcher>,
        browser: Option<Arc<dyn Fetcher>>,
        config: Arc<PipelineStepConfig>,
    ) -> Self {
        let browser = browser.filter(|_| config.extraction.browser_enabled);
        Self {
            dre,
            http,
            browser,
            config,
        }
    }

    fn methods(&self) -> Vec<ExtractionMethod> {
        let mut methods = vec![ExtractionMethod::Lightweight, ExtractionMethod::Structural];
        if self.browser.is_some() {
            methods.push(ExtractionMethod::Browser);
        }
        methods
    }

    fn policy(&self) -> MergePolicy {
        MergePolicy {
            min_extra_words: self.config.extraction.min_extra_words,
        }
    }

    fn max_wait(&self) -> Duration {
        self.config.pacing.max_admission_wait()
    }

    /// Body present and at least `min_core_fields` of headline/body/author.
    pub fn is_sufficient(&self, fields: &FieldMap) -> bool {
        let populated = Field::CORE
            .iter()
            .filter(|f| fields.get(f).is_some_and(|v| !v.trim().is_empty()))
            .count();
        fields.contains_key(&Field::Body) && populated >= self.config.extraction.min_core_fields
    }

    /// Run the chain for one URL.
    ///
    /// Each strategy leases the domain from the resilience engine, records
    /// its outcome, and merges its fields into the running result without
    /// ever dropping a field an earlier strategy produced.
    ///
    /// # Arguments
    ///
    /// * `url` - Absolute URL of the article
    ///
    /// # Returns
    ///
    /// The merged [`ExtractionResult`]. Its `status` is `Success` when the
    /// merged fields are sufficient, `PartialSuccess` when some fields were
    /// found, and otherwise the last failure seen (`PermanentFailure` for a
    /// URL without a host).
    ///
    /// # Example
    ///
    /// ```ignore
    /// let chain = ExtractionChain::new(dre, http, None, config);
    /// let result = chain.extract("https://metro.example/2025/05/06/tram").await;
    /// if result.status == ExtractionStatus::Success {
    ///     println!("{:?}", result.contributing_method);
    /// }
    /// ```
    #[instrument(level = "info", skip(self))]
    pub async fn extract(&self, url: &str) -> ExtractionResult {
        let mut result = ExtractionResult {
            url: url.to_string(),
            fields: FieldMap::new(),
            contributing_method: BTreeMap::new(),
            status: ExtractionStatus::PermanentFailure,
            attempted: Vec::new(),
            response_bytes: 0,
        };
        let Some(domain) = host_of(url) else {
            warn!("URL has no host; not extracting");
            return result;
        };

        let mut lightweight_body: Option<String> = None;
        let mut last_failure: Option<ExtractionStatus> = None;

        for method in self.methods() {
            let step = self
                .run_step(method, url, &domain, lightweight_body.as_deref())
                .await;
            let Step::Parsed {
                outcome,
                status,
                fields,
                body,
                bytes,
            } = step
            else {
                debug!(%method, "Domain unavailable; stopping chain");
                last_failure.get_or_insert(ExtractionStatus::TransientFailure);
                break;
            };

            result.attempted.push(method);
            result.response_bytes += bytes;

            match outcome {
                Outcome::Success => {
                    let changed = merge_into(
                        &mut result.fields,
                        &mut result.contributing_method,
                        &fields,
                        method,
                        self.policy(),
                    );
                    debug!(%method, ?changed, "Merged strategy output");
                    if method == ExtractionMethod::Lightweight {
                        lightweight_body = body;
                    }
                    if self.is_sufficient(&result.fields) {
                        break;
                    }
                }
                Outcome::PermanentFailure => {
                    last_failure = Some(if is_not_found(status) {
                        ExtractionStatus::NotFound
                    } else {
                        ExtractionStatus::PermanentFailure
                    });
                    break;
                }
                Outcome::RateLimited => {
                    last_failure = Some(ExtractionStatus::TransientFailure);
                    break;
                }
                Outcome::BotProtectionDetected => {
                    last_failure = Some(ExtractionStatus::BotProtectionDetected);
                }
                Outcome::TransientFailure => {
                    last_failure = Some(ExtractionStatus::TransientFailure);
                }
            }
        }

        result.status = if self.is_sufficient(&result.fields) {
            ExtractionStatus::Success
        } else if !result.fields.is_empty() {
            ExtractionStatus::PartialSuccess
        } else {
            last_failure.unwrap_or(ExtractionStatus::PermanentFailure)
        };
        info!(
            status = ?result.status,
            attempted = ?result.attempted,
            fields = result.fields.len(),
            bytes = result.response_bytes,
            "Extraction finished"
        );
        result
    }

    async fn run_step(
        &self,
        method: ExtractionMethod,
        url: &str,
        domain: &str,
        lightweight_body: Option<&str>,
    ) -> Step {
        if method == ExtractionMethod::Structural {
            if let Some(body) = lightweight_body {
                return Step::Parsed {
                    outcome: Outcome::Success,
                    status: 200,
                    fields: parsers::structural(body, self.config.extraction.site_rule(domain)),
                    body: None,
                    bytes: 0,
                };
            }
        }

        let fetcher = match (method, &self.browser) {
            (ExtractionMethod::Browser, Some(browser)) => Arc::clone(browser),
            _ => Arc::clone(&self.http),
        };

        let lease = match self.dre.wait_for_lease(domain, self.max_wait()).await {
            Ok(lease) => lease,
            Err(unavailable) => {
                debug!(%method, admission = ?unavailable.admission, "Could not lease domain");
                return Step::Unavailable;
            }
        };
        let profile = self.dre.fingerprint(domain);
        let fetched = fetcher.fetch(url, &profile).await;
        drop(lease);

        match fetched {
            Ok(FetchedPage { status, body, .. }) => {
                let outcome = classify_response(status, &body);
                self.dre.record_outcome(domain, outcome);
                let fields = if outcome == Outcome::Success {
                    self.parse(method, &body, domain)
                } else {
                    FieldMap::new()
                };
                Step::Parsed {
                    outcome,
                    status,
                    fields,
                    bytes: body.len(),
                    body: Some(body),
                }
            }
            Err(e) => {
                warn!(%method, error = %e, "Fetch failed");
                self.dre.record_outcome(domain, Outcome::TransientFailure);
                Step::Parsed {
                    outcome: Outcome::TransientFailure,
                    status: 0,
                    fields: FieldMap::new(),
                    body: None,
                    bytes: 0,
                }
            }
        }
    }

    fn parse(&self, method: ExtractionMethod, body: &str, domain: &str) -> FieldMap {
        let rule = self.config.extraction.site_rule(domain);
        match method {
            ExtractionMethod::Lightweight => parsers::lightweight(body),
            ExtractionMethod::Structural => parsers::structural(body, rule),
            ExtractionMethod::Browser => {
                let mut fields = parsers::lightweight(body);
                let mut scratch = BTreeMap::new();
                merge_into(
                    &mut fields,
                    &mut scratch,
                    &parsers::structural(body, rule),
                    method,
                    self.policy(),
                );
                fields
            }
        }
    }
}
