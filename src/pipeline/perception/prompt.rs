//! Prompt construction for perception models.
//!
//! VLM prompts are short and demand a fixed JSON shape. The document page
//! prompt asks for fields, table cells and a page confidence, and tells the
//! model to leave unreadable values null rather than guess.

use super::types::AnalysisUnit;

// ──────────────────────────────────────────────
// VLM
// ──────────────────────────────────────────────

pub const VLM_SYSTEM_INSTRUCTION: &str = "You are a careful visual inspection assistant. \
You must be conservative, grounded, and avoid speculation.";

const VLM_SCHEMA_HINT: &str = r#"{"finding": "short summary (<=160 chars)", "confidence": "number between 0 and 1", "explanation": "grounded explanation based only on what is visible", "recommendation": "next steps, safe and general", "warnings": ["list of uncertainty notes, if any"]}"#;

/// Appended to the instruction once a model has answered with unusable output.
pub const TIGHTENING_SUFFIX: &str = "IMPORTANT: Return ONLY valid JSON. No markdown. No extra text.";

const DEFAULT_TASK: &str = "Describe what you see and suggest next steps.";

/// The user-facing task for a unit: explicit prompt, then question, then task.
pub fn task_instruction(unit: &AnalysisUnit) -> String {
    if let Some(prompt) = unit.prompt() {
        return prompt.trim().to_string();
    }
    match (unit.task(), unit.question()) {
        (Some("qa"), Some(question)) | (None, Some(question)) => {
            format!("Answer the question based on the image: {}", question.trim())
        }
        (Some("describe"), _) => "Describe what you see in the image.".to_string(),
        _ => DEFAULT_TASK.to_string(),
    }
}

/// Full VLM user prompt for one attempt.
pub fn vlm_prompt(unit: &AnalysisUnit, tightened: bool) -> String {
    let mut prompt = format!(
        "Return ONLY valid JSON. No markdown, no extra text.\n\
         JSON keys must be exactly: finding, confidence, explanation, recommendation, warnings.\n\
         Schema example: {VLM_SCHEMA_HINT}\n\n\
         Task:\n{}",
        task_instruction(unit)
    );
    if tightened {
        prompt.push_str("\n\n");
        prompt.push_str(TIGHTENING_SUFFIX);
    }
    prompt
}

// ──────────────────────────────────────────────
// Document pages
// ──────────────────────────────────────────────

/// How much detail the page extractor is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtractionStyle {
    Fast,
    #[default]
    Full,
}

impl ExtractionStyle {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fast" => Some(ExtractionStyle::Fast),
            "full" => Some(ExtractionStyle::Full),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStyle::Fast => "fast",
            ExtractionStyle::Full => "full",
        }
    }

    fn verbosity(&self) -> &'static str {
        match self {
            ExtractionStyle::Fast => "minimal",
            ExtractionStyle::Full => "detailed",
        }
    }
}

/// Optional caller hints for document extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentHints {
    /// e.g. "invoice", "inspection report", "form".
    pub document_type: Option<String>,
    pub expected_fields: Vec<String>,
}

impl DocumentHints {
    /// Blank entries are dropped and the rest trimmed.
    pub fn new(document_type: Option<String>, expected_fields: Vec<String>) -> Self {
        Self {
            document_type: document_type
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            expected_fields: expected_fields
                .into_iter()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
        }
    }
}

const DOCUMENT_SCHEMA: &str = r#"{
  "fields": [
    {"name": "string", "value": "string|null", "confidence": {"score": 0.0-1.0|null, "level": "low|medium|high|null"} | null}
  ],
  "tables": [
    {
      "table_index": 0,
      "n_rows": 0,
      "n_cols": 0,
      "confidence": {"score": 0.0-1.0|null, "level": "low|medium|high|null"} | null,
      "cells": [
        {"row": 0, "col": 0, "text": "string", "confidence": {"score": 0.0-1.0|null, "level": "low|medium|high|null"} | null}
      ]
    }
  ],
  "page_confidence": {"score": 0.0-1.0|null, "level": "low|medium|high|null"} | null,
  "warnings": ["string"]
}"#;

pub fn document_page_prompt(style: ExtractionStyle, hints: &DocumentHints) -> String {
    let doc_hint = hints.document_type.as_deref().unwrap_or("none");
    let expected = if hints.expected_fields.is_empty() {
        "none".to_string()
    } else {
        hints.expected_fields.join(", ")
    };

    format!(
        "You are a document extraction engine. Extract information ONLY if it is visible in the image.\n\
         Do NOT guess. Do NOT invent. If information is not visible, set value to null.\n\n\
         Return JSON ONLY (no markdown, no extra text).\n\
         Schema:\n{DOCUMENT_SCHEMA}\n\n\
         Extraction style: {verbosity}\n\
         Document hint (optional): {doc_hint}\n\
         Expected fields (optional): {expected}\n\n\
         Important rules:\n\
         - Keep \"fields\" and \"tables\" as empty lists if none are found.\n\
         - \"n_rows\" and \"n_cols\" should reflect the table grid you detect; if uncertain, approximate but do not invent cells.\n\
         - Confidence.score must be between 0 and 1 if provided.\n\
         - Include warnings for low-quality scans, blur, occlusion, or unreadable text.",
        verbosity = style.verbosity(),
    )
}
