//! Pipeline configuration derived from settings.
//!
//! Maps the provider settings to concrete per-mode retry policies, the page
//! worker pool size, the page limit and the whole-request deadline. These
//! drive every pipeline run.

use std::time::Duration;

use serde::Serialize;

use crate::config::Settings;
use crate::pipeline::policy::{Backoff, FailureKind, RetryPolicy};

/// Baseline classifiers run locally and fast; two attempts are enough.
const BASELINE_MAX_ATTEMPTS: u32 = 2;
const BASELINE_TIMEOUT: Duration = Duration::from_secs(10);

const EXPLANATION_BACKOFF_STEP: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    /// VLM image analysis: `VLM_MAX_RETRIES + 1` attempts.
    pub vlm_policy: RetryPolicy,
    /// Baseline classifier; `invalid_output` is not retried since a
    /// deterministic model answers the same way twice.
    pub baseline_policy: RetryPolicy,
    /// Per-page document extraction.
    pub document_policy: RetryPolicy,
    /// Grounded explanation: retries `timeout` and `invalid_output` only.
    pub explanation_policy: RetryPolicy,
    /// Pages perceived concurrently.
    pub worker_pool_size: usize,
    /// Pages scheduled per document at most.
    pub max_pages: usize,
    /// Cap on the whole perception phase of one request.
    pub request_deadline: Duration,
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let vlm_attempts = settings.vlm_max_retries.saturating_add(1);

        Self {
            vlm_policy: RetryPolicy::new(vlm_attempts, settings.vlm_timeout),
            baseline_policy: RetryPolicy::new(BASELINE_MAX_ATTEMPTS, BASELINE_TIMEOUT)
                .with_retryable([FailureKind::Timeout, FailureKind::TransientFailure]),
            document_policy: RetryPolicy::new(vlm_attempts, settings.vlm_timeout),
            explanation_policy: RetryPolicy::new(settings.llm_max_attempts, settings.llm_timeout)
                .with_retryable([FailureKind::Timeout, FailureKind::InvalidOutput])
                .with_backoff(Backoff::Linear {
                    step: EXPLANATION_BACKOFF_STEP,
                }),
            worker_pool_size: settings.worker_pool_size.max(1),
            max_pages: settings.max_pdf_pages,
            request_deadline: settings.request_deadline,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}
