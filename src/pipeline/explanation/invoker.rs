//! Explanation Invoker: one call per request, after perception is final.
//!
//! Runs even when perception failed entirely; the request then carries
//! `PerceptionState::AllFailed` so the model explains the failure instead of
//! being skipped. Only `timeout` and `invalid_output` are retried by default.

use std::sync::Arc;

use tracing::Instrument;

use super::types::{
    ExplanationAdapter, ExplanationFailure, ExplanationOutcome, ExplanationRequest,
    ExplanationSuccess, RawExplanation,
};
use crate::observability::AnalyzerKind;
use crate::pipeline::aggregation::StructuredResult;
use crate::pipeline::policy::{AttemptContext, AttemptError, PolicyEngine, RetryPolicy};
use crate::pipeline_config::PipelineConfig;

#[derive(Clone)]
pub struct ExplanationInvoker {
    engine: PolicyEngine,
    adapter: Arc<dyn ExplanationAdapter>,
    policy: RetryPolicy,
}

impl ExplanationInvoker {
    pub fn new(
        engine: PolicyEngine,
        adapter: Arc<dyn ExplanationAdapter>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            engine,
            adapter,
            policy: config.explanation_policy.clone(),
        }
    }

    pub fn model(&self) -> &str {
        self.adapter.name()
    }

    pub async fn invoke(&self, result: &StructuredResult) -> ExplanationOutcome {
        let base = ExplanationRequest::for_result(result);
        let span = tracing::info_span!(
            "explanation",
            model = %self.adapter.name(),
            state = base.state.as_str(),
        );

        let mut tightened = false;
        let make_attempt = |ctx: AttemptContext| {
            tightened |= ctx.follows_invalid_output();
            let request = ExplanationRequest {
                attempt: ctx.attempt,
                tightened,
                ..base.clone()
            };
            let adapter = Arc::clone(&self.adapter);
            move || {
                let raw = adapter
                    .call(&request)
                    .map_err(|e| AttemptError::new(adapter.classify_error(&e), e.to_string()))?;
                validate(raw)
            }
        };

        let execution = self
            .engine
            .execute(&self.policy, AnalyzerKind::Explainer, make_attempt)
            .instrument(span.clone())
            .await;
        let attempts_used = execution.context.attempts_used;
        let model = self.adapter.name().to_string();

        match execution.result {
            Ok(raw) => {
                tracing::info!(
                    parent: &span,
                    attempts = attempts_used,
                    elapsed_ms = %execution.context.elapsed.as_millis(),
                    "Explanation generated"
                );
                ExplanationOutcome::Success(ExplanationSuccess {
                    explanation: raw.explanation,
                    recommendation: raw.recommendation,
                    grounding_metadata: raw.grounding_metadata,
                    warnings: raw.warnings,
                    model,
                    attempts_used,
                })
            }
            Err(failure) => {
                tracing::warn!(
                    parent: &span,
                    attempts = attempts_used,
                    kind = %failure.kind,
                    error = %failure.message,
                    "Explanation failed; fallback will be used"
                );
                ExplanationOutcome::Failure(ExplanationFailure {
                    kind: failure.kind,
                    message: failure.message,
                    model,
                    attempts_used,
                })
            }
        }
    }
}

fn validate(mut raw: RawExplanation) -> Result<RawExplanation, AttemptError> {
    raw.explanation = raw.explanation.trim().to_string();
    raw.recommendation = raw.recommendation.trim().to_string();
    if raw.explanation.is_empty() {
        return Err(AttemptError::invalid_output("explanation is empty"));
    }
    if raw.recommendation.is_empty() {
        return Err(AttemptError::invalid_output("recommendation is empty"));
    }
    Ok(raw)
}
