use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::pipeline::aggregation::{PerceptionState, ResultSource, StructuredResult};
use crate::pipeline::policy::{FailureKind, TerminalKind};
use crate::pipeline::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the explainer is asked to explain.
///
/// `facts` is the only evidence the model sees; it never receives raw
/// image or page bytes.
#[derive(Debug, Clone)]
pub struct ExplanationRequest {
    /// "image" or "document".
    pub task_type: &'static str,
    /// Perception mode label, e.g. "vlm" or "document".
    pub mode: &'static str,
    pub state: PerceptionState,
    pub facts: Arc<Value>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Previous attempt broke the output schema; restate it strictly.
    pub tightened: bool,
}

impl ExplanationRequest {
    /// Build the first-attempt request for a structured result.
    pub fn for_result(result: &StructuredResult) -> Self {
        let (task_type, mode) = match result.source {
            ResultSource::Image { mode } => ("image", mode.as_str()),
            ResultSource::Document => ("document", "document"),
        };
        Self {
            task_type,
            mode,
            state: result.state,
            facts: Arc::new(facts(result)),
            attempt: 1,
            tightened: false,
        }
    }
}

/// Grounding facts derived from a structured result.
pub fn facts(result: &StructuredResult) -> Value {
    let doc = &result.document;
    let mut facts = Map::new();
    facts.insert("finding".into(), Value::String(result.finding.clone()));
    facts.insert("overall_confidence".into(), Value::from(result.confidence()));
    facts.insert("perception_state".into(), Value::from(result.state.as_str()));
    facts.insert("pages_succeeded".into(), Value::from(doc.pages_succeeded));
    facts.insert("pages_total".into(), Value::from(doc.pages_total));
    facts.insert(
        "warnings".into(),
        Value::Array(doc.warnings.iter().cloned().map(Value::String).collect()),
    );
    if !doc.extracted_fields.is_empty() {
        facts.insert(
            "extracted_fields".into(),
            serde_json::to_value(&doc.extracted_fields).unwrap_or(Value::Null),
        );
    }
    if !doc.tables.is_empty() {
        facts.insert("tables".into(), Value::Array(doc.contract_tables()));
    }
    if !result.details.is_empty() {
        facts.insert("details".into(), Value::Object(result.details.clone()));
    }
    Value::Object(facts)
}

/// Unvalidated explainer answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawExplanation {
    pub explanation: String,
    pub recommendation: String,
    /// Whatever the model reports about its own grounding (risk level,
    /// assumptions, limitations). Forwarded, never interpreted.
    pub grounding_metadata: Option<Map<String, Value>>,
    pub warnings: Vec<String>,
}

/// A language model that narrates structured findings.
pub trait ExplanationAdapter: Send + Sync {
    /// Model identifier reported as `grounding.llm_model`.
    fn name(&self) -> &str;

    fn call(&self, request: &ExplanationRequest) -> Result<RawExplanation, AdapterError>;

    fn classify_error(&self, error: &AdapterError) -> FailureKind {
        error.default_kind()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExplanationSuccess {
    pub explanation: String,
    pub recommendation: String,
    pub grounding_metadata: Option<Map<String, Value>>,
    pub warnings: Vec<String>,
    pub model: String,
    pub attempts_used: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExplanationFailure {
    pub kind: TerminalKind,
    pub message: String,
    pub model: String,
    pub attempts_used: u32,
}

/// Produced exactly once per request, after perception is final.
#[derive(Debug, Clone, PartialEq)]
pub enum ExplanationOutcome {
    Success(ExplanationSuccess),
    Failure(ExplanationFailure),
}

impl ExplanationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExplanationOutcome::Success(_))
    }

    pub fn attempts_used(&self) -> u32 {
        match self {
            ExplanationOutcome::Success(s) => s.attempts_used,
            ExplanationOutcome::Failure(f) => f.attempts_used,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ExplanationOutcome::Success(s) => &s.model,
            ExplanationOutcome::Failure(f) => &f.model,
        }
    }
}
