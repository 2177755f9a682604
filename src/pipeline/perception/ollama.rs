//! Ollama-backed perception adapters: a vision-language model for images and
//! a page extractor for document pages. Both send one image per call.

use super::parser::{parse_document_page, parse_vlm_output};
use super::prompt::{document_page_prompt, vlm_prompt, VLM_SYSTEM_INSTRUCTION};
use super::types::{ModelInfo, PerceptionAdapter, PerceptionRequest, RawPerception};
use crate::pipeline::ollama::{ChatMessage, OllamaClient};
use crate::pipeline::AdapterError;

// ──────────────────────────────────────────────
// OllamaVlmAdapter
// ──────────────────────────────────────────────

pub struct OllamaVlmAdapter {
    client: OllamaClient,
    model: ModelInfo,
}

impl OllamaVlmAdapter {
    pub fn new(client: OllamaClient, model_name: &str) -> Self {
        Self {
            client,
            model: ModelInfo::new(model_name, "ollama"),
        }
    }
}

impl PerceptionAdapter for OllamaVlmAdapter {
    fn name(&self) -> &str {
        &self.model.name
    }

    fn call(&self, request: &PerceptionRequest) -> Result<RawPerception, AdapterError> {
        let unit = &request.unit;
        let _span = tracing::info_span!(
            "vlm_call",
            model = %self.model.name,
            unit_id = unit.unit_id(),
            attempt = request.attempt,
            tightened = request.tightened,
            image_size = unit.payload().len(),
        )
        .entered();
        let start = std::time::Instant::now();

        if unit.payload().is_empty() {
            return Err(AdapterError::InvalidInput("empty image payload".into()));
        }

        let messages = [
            ChatMessage::system(VLM_SYSTEM_INSTRUCTION),
            ChatMessage::user_with_image(vlm_prompt(unit, request.tightened), unit.payload().bytes()),
        ];
        let text = self.client.chat(&self.model.name, &messages, true)?;

        tracing::debug!(
            elapsed_ms = %start.elapsed().as_millis(),
            response_len = text.len(),
            "VLM responded"
        );

        parse_vlm_output(&text, &self.model, unit.task(), unit.prompt())
    }
}

// ──────────────────────────────────────────────
// OllamaDocumentAdapter
// ──────────────────────────────────────────────

/// Extracts fields and tables from one rendered document page.
///
/// Extraction style and hints come from the page's `AnalysisUnit`.
pub struct OllamaDocumentAdapter {
    client: OllamaClient,
    model: ModelInfo,
}

impl OllamaDocumentAdapter {
    pub fn new(client: OllamaClient, model_name: &str) -> Self {
        Self {
            client,
            model: ModelInfo::new(model_name, "ollama"),
        }
    }
}

impl PerceptionAdapter for OllamaDocumentAdapter {
    fn name(&self) -> &str {
        &self.model.name
    }

    fn call(&self, request: &PerceptionRequest) -> Result<RawPerception, AdapterError> {
        let unit = &request.unit;
        let _span = tracing::info_span!(
            "document_page_call",
            model = %self.model.name,
            page = unit.unit_id(),
            attempt = request.attempt,
            style = unit.extraction_style().as_str(),
        )
        .entered();

        if unit.payload().is_empty() {
            return Err(AdapterError::InvalidInput(format!(
                "page {} has no image data",
                unit.unit_id()
            )));
        }

        let prompt = document_page_prompt(unit.extraction_style(), unit.document_hints());
        let messages = [ChatMessage::user_with_image(prompt, unit.payload().bytes())];
        let text = self.client.chat(&self.model.name, &messages, true)?;

        parse_document_page(&text, unit.unit_id(), &self.model)
    }
}
