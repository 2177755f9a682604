//! Perception Invoker: one unit in, one classified `PerceptionOutcome` out.
//!
//! Output validation runs inside the attempt, so a response with no finding
//! or a bad confidence is an `invalid_output` attempt and is retried like any
//! other. Nothing past this boundary sees an `Err`.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::Instrument;

use super::types::{
    AnalysisMode, AnalysisUnit, Evidence, PerceptionAdapter, PerceptionFailure, PerceptionOutcome,
    PerceptionRequest, PerceptionSuccess, RawPerception,
};
use crate::pipeline::policy::{
    AttemptContext, AttemptError, FailureKind, PolicyEngine, RetryPolicy, TerminalKind,
};
use crate::pipeline_config::PipelineConfig;

pub const MISSING_CONFIDENCE_WARNING: &str = "confidence_missing_defaulted_to_zero";

/// Validated adapter answer, before attempt bookkeeping is attached.
struct Validated {
    finding: String,
    confidence: f64,
    details: Map<String, Value>,
    evidence: Evidence,
}

#[derive(Clone)]
pub struct PerceptionInvoker {
    engine: PolicyEngine,
    vision: Option<Arc<dyn PerceptionAdapter>>,
    vlm: Option<Arc<dyn PerceptionAdapter>>,
    document: Option<Arc<dyn PerceptionAdapter>>,
    baseline_policy: RetryPolicy,
    vlm_policy: RetryPolicy,
    document_policy: RetryPolicy,
}

impl PerceptionInvoker {
    pub fn new(engine: PolicyEngine, config: &PipelineConfig) -> Self {
        Self {
            engine,
            vision: None,
            vlm: None,
            document: None,
            baseline_policy: config.baseline_policy.clone(),
            vlm_policy: config.vlm_policy.clone(),
            document_policy: config.document_policy.clone(),
        }
    }

    /// Register the adapter serving `mode`, replacing any previous one.
    pub fn with_adapter(mut self, mode: AnalysisMode, adapter: Arc<dyn PerceptionAdapter>) -> Self {
        match mode {
            AnalysisMode::Baseline => self.vision = Some(adapter),
            AnalysisMode::Vlm => self.vlm = Some(adapter),
            AnalysisMode::Document => self.document = Some(adapter),
        }
        self
    }

    fn adapter(&self, mode: AnalysisMode) -> Option<&Arc<dyn PerceptionAdapter>> {
        match mode {
            AnalysisMode::Baseline => self.vision.as_ref(),
            AnalysisMode::Vlm => self.vlm.as_ref(),
            AnalysisMode::Document => self.document.as_ref(),
        }
    }

    pub fn policy(&self, mode: AnalysisMode) -> &RetryPolicy {
        match mode {
            AnalysisMode::Baseline => &self.baseline_policy,
            AnalysisMode::Vlm => &self.vlm_policy,
            AnalysisMode::Document => &self.document_policy,
        }
    }

    pub async fn invoke(&self, unit: Arc<AnalysisUnit>) -> PerceptionOutcome {
        let mode = unit.mode();
        let span = tracing::info_span!("perception", unit_id = unit.unit_id(), mode = %mode);

        let Some(adapter) = self.adapter(mode).cloned() else {
            tracing::warn!(parent: &span, "No perception adapter configured for mode");
            return PerceptionOutcome::Failure(PerceptionFailure {
                kind: TerminalKind::Failed(FailureKind::Fatal),
                message: format!("no perception adapter configured for mode '{mode}'"),
                attempts_used: 0,
            });
        };

        // Once a VLM has produced unusable output, every later attempt for
        // this unit uses the stricter instruction.
        let mut tightened = false;
        let make_attempt = |ctx: AttemptContext| {
            tightened |= mode.tightens_on_retry() && ctx.follows_invalid_output();
            let request = PerceptionRequest {
                unit: Arc::clone(&unit),
                attempt: ctx.attempt,
                tightened,
            };
            let adapter = Arc::clone(&adapter);
            move || {
                let raw = adapter
                    .call(&request)
                    .map_err(|e| AttemptError::new(adapter.classify_error(&e), e.to_string()))?;
                validate(raw)
            }
        };

        let execution = self
            .engine
            .execute(self.policy(mode), mode.analyzer(), make_attempt)
            .instrument(span.clone())
            .await;
        let attempts_used = execution.context.attempts_used;

        match execution.result {
            Ok(valid) => {
                tracing::info!(
                    parent: &span,
                    attempts = attempts_used,
                    confidence = valid.confidence,
                    elapsed_ms = %execution.context.elapsed.as_millis(),
                    "Perception succeeded"
                );
                PerceptionOutcome::Success(PerceptionSuccess {
                    finding: valid.finding,
                    confidence: valid.confidence,
                    details: valid.details,
                    evidence: valid.evidence,
                    attempts_used,
                })
            }
            Err(failure) => {
                tracing::info!(
                    parent: &span,
                    attempts = attempts_used,
                    kind = %failure.kind,
                    elapsed_ms = %execution.context.elapsed.as_millis(),
                    "Perception failed"
                );
                PerceptionOutcome::Failure(PerceptionFailure {
                    kind: failure.kind,
                    message: failure.message,
                    attempts_used,
                })
            }
        }
    }
}

/// Check an adapter answer against the perception output contract.
fn validate(raw: RawPerception) -> Result<Validated, AttemptError> {
    let finding = raw
        .finding
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .ok_or_else(|| AttemptError::invalid_output("adapter returned no finding"))?
        .to_string();

    let mut evidence = raw.evidence;
    let confidence = match raw.confidence {
        Some(c) if c.is_finite() && (0.0..=1.0).contains(&c) => c,
        Some(c) => {
            return Err(AttemptError::invalid_output(format!(
                "confidence {c} outside [0, 1]"
            )))
        }
        None => {
            evidence.warnings.push(MISSING_CONFIDENCE_WARNING.to_string());
            0.0
        }
    };

    Ok(Validated {
        finding,
        confidence,
        details: raw.details,
        evidence,
    })
}
