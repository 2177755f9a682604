//! Strict parsing of grounded explainer output.
//!
//! The object must have exactly the five schema keys; unknown keys, a
//! missing key or an unknown risk level are `InvalidOutput`. Text around the
//! object (a markdown fence, a greeting) is tolerated.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::types::{RawExplanation, RiskLevel};
use crate::pipeline::perception::parser::extract_json_object;
use crate::pipeline::AdapterError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroundedOutput {
    explanation: String,
    recommendation: String,
    risk_level: RiskLevel,
    assumptions: Vec<String>,
    limitations: Vec<String>,
}

pub fn parse_grounded_output(text: &str) -> Result<RawExplanation, AdapterError> {
    let json = extract_json_object(text)
        .ok_or_else(|| AdapterError::InvalidOutput("Invalid JSON returned by LLM".into()))?;
    let output: GroundedOutput = serde_json::from_str(json)
        .map_err(|e| AdapterError::InvalidOutput(format!("LLM JSON does not match schema: {e}")))?;

    let mut grounding = Map::new();
    grounding.insert("risk_level".into(), Value::from(output.risk_level.as_str()));
    grounding.insert("assumptions".into(), Value::from(output.assumptions));
    grounding.insert("limitations".into(), Value::from(output.limitations));

    Ok(RawExplanation {
        explanation: output.explanation.trim().to_string(),
        recommendation: output.recommendation.trim().to_string(),
        grounding_metadata: Some(grounding),
        warnings: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "explanation": "Two of three pages were read; the serial number is A-17.",
        "recommendation": "Re-scan page 2 and verify the serial number.",
        "risk_level": "medium",
        "assumptions": [],
        "limitations": ["Page 2 could not be analyzed."]
    }"#;

    #[test]
    fn parses_exact_schema() {
        let raw = parse_grounded_output(VALID).unwrap();
        assert!(raw.explanation.contains("A-17"));
        let grounding = raw.grounding_metadata.unwrap();
        assert_eq!(grounding["risk_level"], "medium");
        assert_eq!(grounding["limitations"][0], "Page 2 could not be analyzed.");
    }

    #[test]
    fn tolerates_markdown_fence() {
        let fenced = format!("```json\n{VALID}\n```");
        assert!(parse_grounded_output(&fenced).is_ok());
    }

    #[test]
    fn extra_key_is_invalid_output() {
        let text = r#"{"explanation": "e", "recommendation": "r", "risk_level": "low",
            "assumptions": [], "limitations": [], "confidence": 0.9}"#;
        let err = parse_grounded_output(text).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidOutput(_)));
    }

    #[test]
    fn unknown_risk_level_is_invalid_output() {
        let text = r#"{"explanation": "e", "recommendation": "r", "risk_level": "severe",
            "assumptions": [], "limitations": []}"#;
        assert!(parse_grounded_output(text).is_err());
    }

    #[test]
    fn prose_is_invalid_output() {
        let err = parse_grounded_output("The part looks fine.").unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
    }
}
