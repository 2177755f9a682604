use super::parser::parse_grounded_output;
use super::prompt::grounded_prompt;
use super::types::{ExplanationAdapter, ExplanationRequest, RawExplanation};
use crate::pipeline::ollama::{ChatMessage, OllamaClient};
use crate::pipeline::AdapterError;

/// Grounded explainer backed by an Ollama text model.
pub struct OllamaExplainer {
    client: OllamaClient,
    model: String,
}

impl OllamaExplainer {
    pub fn new(client: OllamaClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
        }
    }
}

impl ExplanationAdapter for OllamaExplainer {
    fn name(&self) -> &str {
        &self.model
    }

    fn call(&self, request: &ExplanationRequest) -> Result<RawExplanation, AdapterError> {
        let _span = tracing::info_span!(
            "explainer_call",
            model = %self.model,
            attempt = request.attempt,
            tightened = request.tightened,
        )
        .entered();

        let messages = [ChatMessage::user(grounded_prompt(request))];
        let text = self.client.chat(&self.model, &messages, true)?;
        parse_grounded_output(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::aggregation::PerceptionState;
    use crate::pipeline::policy::FailureKind;
    use std::sync::Arc;

    #[test]
    fn unreachable_server_is_transient() {
        let explainer = OllamaExplainer::new(OllamaClient::new("http://127.0.0.1:9", 2), "llama3");
        assert_eq!(explainer.name(), "llama3");
        let request = ExplanationRequest {
            task_type: "image",
            mode: "vlm",
            state: PerceptionState::Success,
            facts: Arc::new(serde_json::json!({})),
            attempt: 1,
            tightened: false,
        };
        let err = explainer.call(&request).unwrap_err();
        assert_eq!(explainer.classify_error(&err), FailureKind::TransientFailure);
    }
}
