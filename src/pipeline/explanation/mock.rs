//! Provider-less explainers: the `mock` provider and a scripted test double.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::{Map, Value};

use super::types::{ExplanationAdapter, ExplanationRequest, RawExplanation, RiskLevel};
use crate::pipeline::aggregation::PerceptionState;
use crate::pipeline::policy::FailureKind;
use crate::pipeline::AdapterError;

pub const MOCK_LLM_MODEL: &str = "mock-llm-v1";

/// Deterministic explainer that restates the facts it is given.
pub struct MockExplainer;

impl ExplanationAdapter for MockExplainer {
    fn name(&self) -> &str {
        MOCK_LLM_MODEL
    }

    fn call(&self, request: &ExplanationRequest) -> Result<RawExplanation, AdapterError> {
        let facts = request.facts.as_ref();
        let finding = facts["finding"].as_str().unwrap_or_default();
        let confidence = facts["overall_confidence"].as_f64().unwrap_or(0.0);
        let warning_count = facts["warnings"].as_array().map_or(0, Vec::len);

        let (explanation, recommendation, risk) = match request.state {
            PerceptionState::AllFailed => (
                format!(
                    "Mock explanation (dev mode): the automated {} analysis produced no usable result.",
                    request.task_type
                ),
                "Retry with a clearer input or check the model services.".to_string(),
                RiskLevel::High,
            ),
            state => (
                format!(
                    "Mock explanation (dev mode): {finding} (confidence {confidence:.2}, {} analysis).",
                    state.as_str()
                ),
                if warning_count > 0 || confidence < 0.5 {
                    "Verify the result manually; the analysis reported uncertainty.".to_string()
                } else {
                    "No action required beyond routine review.".to_string()
                },
                if warning_count > 0 || confidence < 0.5 {
                    RiskLevel::Medium
                } else {
                    RiskLevel::Low
                },
            ),
        };

        let mut grounding = Map::new();
        grounding.insert("risk_level".into(), Value::from(risk.as_str()));
        grounding.insert("assumptions".into(), Value::Array(Vec::new()));
        grounding.insert(
            "limitations".into(),
            Value::from(vec!["Generated by a mock explainer.".to_string()]),
        );

        Ok(RawExplanation {
            explanation,
            recommendation,
            grounding_metadata: Some(grounding),
            warnings: Vec::new(),
        })
    }
}

// ──────────────────────────────────────────────
// ScriptedExplainer
// ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ExplainerStep {
    Respond(RawExplanation),
    Fail(FailureKind, String),
}

/// Replays a script of answers; the last step repeats.
pub struct ScriptedExplainer {
    steps: Mutex<VecDeque<ExplainerStep>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<ExplanationRequest>>,
}

impl ScriptedExplainer {
    pub fn new(steps: Vec<ExplainerStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn answer(explanation: &str, recommendation: &str) -> RawExplanation {
        RawExplanation {
            explanation: explanation.to_string(),
            recommendation: recommendation.to_string(),
            ..RawExplanation::default()
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ExplanationRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl ExplanationAdapter for ScriptedExplainer {
    fn name(&self) -> &str {
        "scripted-llm"
    }

    fn call(&self, request: &ExplanationRequest) -> Result<RawExplanation, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }

        let step = self.steps.lock().ok().and_then(|mut steps| {
            if steps.len() > 1 {
                steps.pop_front()
            } else {
                steps.front().cloned()
            }
        });

        match step {
            Some(ExplainerStep::Respond(raw)) => Ok(raw),
            Some(ExplainerStep::Fail(kind, message)) => Err(match kind {
                FailureKind::Timeout => AdapterError::Timeout(message),
                FailureKind::InvalidOutput => AdapterError::InvalidOutput(message),
                FailureKind::TransientFailure => AdapterError::Unavailable(message),
                FailureKind::Fatal => AdapterError::InvalidInput(message),
            }),
            None => Err(AdapterError::NotConfigured("empty explainer script".into())),
        }
    }
}
