//! Response Composer: the only producer of `PipelineResponse`.
//!
//! Pure mapping from a structured result and an explanation outcome. The
//! response shape is a wire contract and only ever gains fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::aggregation::{ResultSource, StructuredResult};
use super::explanation::{fallback_explanation, ExplanationOutcome};

/// Externally visible result of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResponse {
    pub finding: String,
    pub confidence: f64,
    pub details: Map<String, Value>,
    pub explanation: String,
    pub recommendation: String,
    pub warnings: Vec<String>,
}

/// Clamp to `[0, 1]`; NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

pub fn compose(structured: StructuredResult, explanation: ExplanationOutcome) -> PipelineResponse {
    let confidence = clamp_confidence(structured.confidence());
    let mut warnings = structured.document.warnings.clone();
    let llm_model = explanation.model().to_string();

    let (explanation_text, recommendation, mut grounding) = match explanation {
        ExplanationOutcome::Success(success) => {
            warnings.extend(success.warnings.iter().map(|w| format!("explanation: {w}")));
            (
                success.explanation,
                success.recommendation,
                success.grounding_metadata.unwrap_or_default(),
            )
        }
        ExplanationOutcome::Failure(failure) => {
            let fallback = fallback_explanation(&structured.document.warnings, failure.kind);
            warnings.push(format!("explanation: fallback used ({})", failure.kind));
            (
                fallback.explanation,
                fallback.recommendation,
                fallback.grounding_metadata,
            )
        }
    };

    grounding.insert("llm_model".into(), Value::String(llm_model));

    let doc = &structured.document;
    let mut details = structured.details.clone();
    details.insert("grounding".into(), Value::Object(grounding));
    details.insert(
        "pages".into(),
        serde_json::json!({
            "total": doc.pages_total,
            "succeeded": doc.pages_succeeded,
            "state": structured.state.as_str(),
            "per_page": doc.pages,
        }),
    );

    match structured.source {
        ResultSource::Document => {
            details.insert(
                "extracted_fields".into(),
                serde_json::to_value(&doc.extracted_fields).unwrap_or_default(),
            );
            details.insert("tables".into(), Value::Array(doc.contract_tables()));
            details.insert(
                "page_failures".into(),
                serde_json::to_value(&doc.page_failures).unwrap_or_default(),
            );
        }
        ResultSource::Image { mode } => {
            details.insert("mode".into(), Value::from(mode.as_str()));
            if let Some(failure) = doc.page_failures.first() {
                details.insert(
                    "perception_failure".into(),
                    serde_json::json!({ "kind": failure.kind, "message": failure.message }),
                );
            }
        }
    }

    PipelineResponse {
        finding: structured.finding,
        confidence,
        details,
        explanation: explanation_text,
        recommendation,
        warnings,
    }
}
