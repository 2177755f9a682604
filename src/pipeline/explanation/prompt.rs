//! Grounded explainer prompt.

use super::types::ExplanationRequest;
use crate::pipeline::aggregation::PerceptionState;

const RULES: &str = "\
You are an assistant generating a grounded explanation of an automated visual inspection result.
You MUST follow these rules:
1) Use ONLY the information provided in the INPUT JSON. Do NOT invent new fields, values, numbers, entities, or conclusions.
2) If the INPUT JSON lacks enough evidence for a statement, write it as an assumption (in \"assumptions\") or a limitation (in \"limitations\").
3) If overall confidence is low OR there are warnings, you MUST mention uncertainty and recommend verification.
4) Output MUST be valid JSON matching exactly the OUTPUT SCHEMA below. No markdown. No extra keys. No extra text.";

const OUTPUT_SCHEMA: &str = r#"OUTPUT SCHEMA (exact keys):
{
  "explanation": string,
  "recommendation": string,
  "risk_level": "low" | "medium" | "high",
  "assumptions": [string, ...],
  "limitations": [string, ...]
}"#;

const RISK_GUIDANCE: &str = "\
RISK LEVEL GUIDANCE:
- \"low\": high confidence, few/no warnings, key fields present
- \"medium\": mixed confidence or some missing info/warnings
- \"high\": low confidence, many warnings, or critical info missing";

pub const STRICT_OUTPUT_REMINDER: &str = "IMPORTANT: Your previous answer did not match the OUTPUT SCHEMA. \
Return ONLY one JSON object with exactly the keys explanation, recommendation, risk_level, assumptions, limitations. \
No markdown. No extra text.";

/// Extra instruction describing how complete the perception result is.
fn state_instruction(state: PerceptionState) -> Option<&'static str> {
    match state {
        PerceptionState::Success => None,
        PerceptionState::Partial => Some(
            "NOTE: Part of the input could not be analyzed (see warnings). \
             Explain only what the successful parts show and state clearly that the result is incomplete.",
        ),
        PerceptionState::AllFailed => Some(
            "NOTE: The automated analysis produced no usable result. \
             Do NOT describe the content of the input. Explain that the analysis failed, \
             using only the warnings provided, and recommend how to proceed. Use risk_level \"high\".",
        ),
    }
}

pub fn grounded_prompt(request: &ExplanationRequest) -> String {
    let facts_json = serde_json::to_string_pretty(request.facts.as_ref())
        .unwrap_or_else(|_| request.facts.to_string());

    let mut prompt = format!(
        "{RULES}\n\n{OUTPUT_SCHEMA}\n\n{RISK_GUIDANCE}\n\nTASK TYPE: {}\nMODE: {}\n",
        request.task_type, request.mode
    );
    if let Some(note) = state_instruction(request.state) {
        prompt.push('\n');
        prompt.push_str(note);
        prompt.push('\n');
    }
    prompt.push_str("\nINPUT JSON:\n");
    prompt.push_str(&facts_json);
    if request.tightened {
        prompt.push_str("\n\n");
        prompt.push_str(STRICT_OUTPUT_REMINDER);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn request(state: PerceptionState, tightened: bool) -> ExplanationRequest {
        ExplanationRequest {
            task_type: "document",
            mode: "document",
            state,
            facts: Arc::new(serde_json::json!({"finding": "Extracted 2 field(s)"})),
            attempt: 1,
            tightened,
        }
    }

    #[test]
    fn prompt_embeds_facts_and_schema() {
        let prompt = grounded_prompt(&request(PerceptionState::Success, false));
        assert!(prompt.contains("\"risk_level\": \"low\" | \"medium\" | \"high\""));
        assert!(prompt.contains("TASK TYPE: document"));
        assert!(prompt.ends_with("}"));
        assert!(prompt.contains("\"finding\": \"Extracted 2 field(s)\""));
        assert!(!prompt.contains("NOTE:"));
    }

    #[test]
    fn all_failed_prompt_asks_for_failure_description() {
        let prompt = grounded_prompt(&request(PerceptionState::AllFailed, false));
        assert!(prompt.contains("produced no usable result"));
    }

    #[test]
    fn tightened_prompt_restates_schema() {
        let prompt = grounded_prompt(&request(PerceptionState::Partial, true));
        assert!(prompt.contains("incomplete"));
        assert!(prompt.ends_with("No extra text."));
    }
}
