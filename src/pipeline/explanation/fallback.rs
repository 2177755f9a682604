//! Conservative explanation used when the explainer fails.

use serde_json::{Map, Value};

use super::types::RiskLevel;
use crate::pipeline::policy::TerminalKind;

pub const FALLBACK_EXPLANATION: &str =
    "A detailed explanation could not be generated reliably from the available analysis results.";

pub const FALLBACK_RECOMMENDATION: &str = "Review the extracted results manually and verify \
low-confidence items. If issues persist, re-upload higher-quality inputs.";

const WARNINGS_LIMITATION: &str = "The analysis contains warnings that reduce confidence.";

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackExplanation {
    pub explanation: String,
    pub recommendation: String,
    pub grounding_metadata: Map<String, Value>,
}

/// Fixed fallback pair plus grounding metadata. Risk is `high` when the
/// perception result carries warnings, `medium` otherwise.
pub fn fallback_explanation(perception_warnings: &[String], kind: TerminalKind) -> FallbackExplanation {
    let has_warnings = !perception_warnings.is_empty();
    let risk = if has_warnings {
        RiskLevel::High
    } else {
        RiskLevel::Medium
    };

    let mut limitations = Vec::new();
    if has_warnings {
        limitations.push(WARNINGS_LIMITATION.to_string());
    }
    limitations.push(format!("Explanation model failed: {kind}"));

    let mut grounding = Map::new();
    grounding.insert("risk_level".into(), Value::from(risk.as_str()));
    grounding.insert("assumptions".into(), Value::Array(Vec::new()));
    grounding.insert("limitations".into(), Value::from(limitations));
    grounding.insert("fallback".into(), Value::Bool(true));

    FallbackExplanation {
        explanation: FALLBACK_EXPLANATION.to_string(),
        recommendation: FALLBACK_RECOMMENDATION.to_string(),
        grounding_metadata: grounding,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::policy::FailureKind;

    #[test]
    fn warnings_raise_risk_to_high() {
        let fallback = fallback_explanation(
            &["page[1]: timeout".to_string()],
            TerminalKind::Failed(FailureKind::TransientFailure),
        );
        assert_eq!(fallback.grounding_metadata["risk_level"], "high");
        assert_eq!(fallback.grounding_metadata["limitations"][0], WARNINGS_LIMITATION);
        assert_eq!(
            fallback.grounding_metadata["limitations"][1],
            "Explanation model failed: transient_failure"
        );
    }

    #[test]
    fn no_warnings_is_medium_risk() {
        let fallback = fallback_explanation(
            &[],
            TerminalKind::RetriesExhausted {
                last: FailureKind::InvalidOutput,
            },
        );
        assert_eq!(fallback.explanation, FALLBACK_EXPLANATION);
        assert_eq!(fallback.recommendation, FALLBACK_RECOMMENDATION);
        assert_eq!(fallback.grounding_metadata["risk_level"], "medium");
        assert_eq!(
            fallback.grounding_metadata["limitations"],
            serde_json::json!(["Explanation model failed: retries_exhausted(invalid_output)"])
        );
    }
}
