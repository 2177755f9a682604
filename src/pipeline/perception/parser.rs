//! Parsing and normalization of raw perception model output.
//!
//! VLM output is held to a strict schema: anything else is `InvalidOutput`,
//! which the invoker retries with a tightened prompt. Document page output is
//! normalized leniently item by item (bad fields and cells are skipped), but
//! text with no JSON object at all is still `InvalidOutput`.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::types::{
    Evidence, ExtractedField, ExtractedTable, ModelInfo, RawPerception, TableCell, MAX_TABLE_COLS,
    MAX_TABLE_ROWS,
};
use crate::pipeline::AdapterError;

/// Greedy match from the first `{` to the last `}`, across lines.
static JSON_OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

pub const MAX_FINDING_CHARS: usize = 160;
pub const MAX_EXPLANATION_CHARS: usize = 2000;
pub const MAX_RECOMMENDATION_CHARS: usize = 600;

/// Confidence assumed when a VLM omits one.
pub const DEFAULT_VLM_CONFIDENCE: f64 = 0.5;

/// Extract the outermost `{...}` span from model text, if any.
pub fn extract_json_object(text: &str) -> Option<&str> {
    JSON_OBJECT_RE.find(text).map(|m| m.as_str())
}

// ──────────────────────────────────────────────
// VLM
// ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VlmOutput {
    finding: String,
    #[serde(default)]
    confidence: Option<f64>,
    explanation: String,
    recommendation: String,
    #[serde(default)]
    warnings: Vec<String>,
}

/// Parse VLM text into a raw perception. `task` and `prompt` are echoed into
/// `details.vlm` so the response shows what the model was asked.
pub fn parse_vlm_output(
    text: &str,
    model: &ModelInfo,
    task: Option<&str>,
    prompt: Option<&str>,
) -> Result<RawPerception, AdapterError> {
    let json = extract_json_object(text)
        .ok_or_else(|| AdapterError::InvalidOutput("No JSON object found in model output".into()))?;

    let output: VlmOutput = serde_json::from_str(json)
        .map_err(|e| AdapterError::InvalidOutput(format!("JSON does not match schema: {e}")))?;

    let finding = output.finding.trim().to_string();
    check_length("finding", &finding, MAX_FINDING_CHARS)?;
    let explanation = output.explanation.trim().to_string();
    check_length("explanation", &explanation, MAX_EXPLANATION_CHARS)?;
    let recommendation = output.recommendation.trim().to_string();
    check_length("recommendation", &recommendation, MAX_RECOMMENDATION_CHARS)?;

    let mut vlm = Map::new();
    vlm.insert("task".into(), Value::String(task.unwrap_or_default().to_string()));
    vlm.insert("prompt".into(), Value::String(prompt.unwrap_or_default().to_string()));
    vlm.insert("explanation".into(), Value::String(explanation));
    vlm.insert("recommendation".into(), Value::String(recommendation));

    let mut details = Map::new();
    details.insert("vlm".into(), Value::Object(vlm));
    details.insert("model".into(), serde_json::to_value(model)?);

    Ok(RawPerception {
        finding: Some(finding),
        confidence: Some(output.confidence.unwrap_or(DEFAULT_VLM_CONFIDENCE)),
        details,
        evidence: Evidence {
            warnings: clean_warnings(output.warnings),
            raw_output: Some(text.to_string()),
            model: Some(model.clone()),
            ..Evidence::default()
        },
    })
}

fn check_length(key: &str, value: &str, max: usize) -> Result<(), AdapterError> {
    let chars = value.chars().count();
    if chars == 0 {
        return Err(AdapterError::InvalidOutput(format!("'{key}' is empty")));
    }
    if chars > max {
        return Err(AdapterError::InvalidOutput(format!(
            "'{key}' exceeds {max} characters ({chars})"
        )));
    }
    Ok(())
}

fn clean_warnings(warnings: Vec<String>) -> Vec<String> {
    warnings
        .into_iter()
        .map(|w| w.trim().to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

// ──────────────────────────────────────────────
// Document pages
// ──────────────────────────────────────────────

/// Map a confidence value to a score.
///
/// Accepts a bare number or `{"score": .., "level": ..}`. A valid score wins;
/// otherwise the qualitative level maps to high 0.85, medium 0.60, low 0.30.
pub fn normalize_confidence(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64().filter(|s| (0.0..=1.0).contains(s)),
        Value::Object(obj) => {
            let score = obj
                .get("score")
                .and_then(Value::as_f64)
                .filter(|s| (0.0..=1.0).contains(s));
            score.or_else(|| obj.get("level").and_then(Value::as_str).and_then(level_score))
        }
        Value::String(level) => level_score(level),
        _ => None,
    }
}

fn level_score(level: &str) -> Option<f64> {
    match level.trim().to_ascii_lowercase().as_str() {
        "high" => Some(0.85),
        "medium" => Some(0.60),
        "low" => Some(0.30),
        _ => None,
    }
}

fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn value_as_index(value: Option<&Value>, default: usize) -> usize {
    value
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Declared table dimension, widened to cover every kept cell and clamped
/// to `max`.
fn grid_extent(declared: Option<&Value>, indices: impl Iterator<Item = usize>, max: usize) -> usize {
    let declared = value_as_index(declared, 0).min(max);
    indices.map(|i| i + 1).fold(declared, usize::max)
}

fn normalize_fields(raw: Option<&Value>) -> Vec<ExtractedField> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|item| {
            let name = item.get("name").and_then(value_as_text)?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some(ExtractedField {
                name: name.to_string(),
                value: item.get("value").and_then(value_as_text),
                confidence: item.get("confidence").and_then(normalize_confidence),
            })
        })
        .collect()
}

fn normalize_tables(raw: Option<&Value>) -> Vec<ExtractedTable> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    let mut tables = Vec::new();
    for table in items.iter().filter_map(Value::as_object) {
        let cells: Vec<TableCell> = match table.get("cells") {
            Some(Value::Array(cells)) => cells
                .iter()
                .filter_map(Value::as_object)
                .filter_map(|cell| {
                    Some(TableCell {
                        row: value_as_index(cell.get("row"), 0),
                        col: value_as_index(cell.get("col"), 0),
                        text: cell.get("text").and_then(value_as_text)?,
                        confidence: cell.get("confidence").and_then(normalize_confidence),
                    })
                })
                .filter(|cell| cell.row < MAX_TABLE_ROWS && cell.col < MAX_TABLE_COLS)
                .collect(),
            _ => Vec::new(),
        };
        let n_rows = grid_extent(table.get("n_rows"), cells.iter().map(|c| c.row), MAX_TABLE_ROWS);
        let n_cols = grid_extent(table.get("n_cols"), cells.iter().map(|c| c.col), MAX_TABLE_COLS);
        tables.push(ExtractedTable {
            table_index: value_as_index(table.get("table_index"), tables.len()),
            n_rows,
            n_cols,
            cells,
            confidence: table.get("confidence").and_then(normalize_confidence),
        });
    }
    tables
}

/// Parse one page of document extraction output.
///
/// Page confidence is the model's `page_confidence`, else the mean of the
/// field confidences, else absent.
pub fn parse_document_page(
    text: &str,
    page_index: usize,
    model: &ModelInfo,
) -> Result<RawPerception, AdapterError> {
    let json = extract_json_object(text)
        .ok_or_else(|| AdapterError::InvalidOutput("Model output is not valid JSON".into()))?;
    let data: Value = serde_json::from_str(json)?;
    let Value::Object(data) = data else {
        return Err(AdapterError::InvalidOutput(
            "Model output JSON is not an object".into(),
        ));
    };

    let fields = normalize_fields(data.get("fields"));
    let tables = normalize_tables(data.get("tables"));

    let field_scores: Vec<f64> = fields.iter().filter_map(|f| f.confidence).collect();
    let confidence = data
        .get("page_confidence")
        .and_then(normalize_confidence)
        .or_else(|| {
            (!field_scores.is_empty())
                .then(|| field_scores.iter().sum::<f64>() / field_scores.len() as f64)
        });

    let warnings = match data.get("warnings") {
        Some(Value::Array(items)) => {
            clean_warnings(items.iter().filter_map(value_as_text).collect())
        }
        _ => Vec::new(),
    };

    let finding = format!(
        "Extracted {} field(s) and {} table(s) from page {}.",
        fields.len(),
        tables.len(),
        page_index
    );

    let mut details = Map::new();
    details.insert("page_index".into(), Value::from(page_index));
    details.insert("model".into(), serde_json::to_value(model)?);

    Ok(RawPerception {
        finding: Some(finding),
        confidence,
        details,
        evidence: Evidence {
            fields,
            tables,
            warnings,
            raw_output: Some(text.to_string()),
            model: Some(model.clone()),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ModelInfo {
        ModelInfo::new("llava", "ollama")
    }

    #[test]
    fn extracts_json_from_markdown_fence() {
        let text = "Sure!\n```json\n{\"a\": {\"b\": 1}}\n```";
        assert_eq!(extract_json_object(text), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn parses_valid_vlm_output() {
        let text = r#"{"finding": "Hairline crack near the left hinge", "confidence": 0.72,
            "explanation": "A thin dark line runs along the hinge plate.",
            "recommendation": "Inspect the hinge under magnification.",
            "warnings": ["glare on right side", "  "]}"#;
        let raw = parse_vlm_output(text, &model(), Some("describe"), None).unwrap();
        assert_eq!(raw.finding.as_deref(), Some("Hairline crack near the left hinge"));
        assert_eq!(raw.confidence, Some(0.72));
        assert_eq!(raw.evidence.warnings, vec!["glare on right side"]);
        assert_eq!(raw.details["vlm"]["task"], "describe");
        assert_eq!(raw.details["model"]["name"], "llava");
    }

    #[test]
    fn vlm_confidence_defaults_when_missing() {
        let text = r#"{"finding": "ok", "explanation": "e", "recommendation": "r"}"#;
        let raw = parse_vlm_output(text, &model(), None, None).unwrap();
        assert_eq!(raw.confidence, Some(DEFAULT_VLM_CONFIDENCE));
        assert!(raw.evidence.warnings.is_empty());
    }

    #[test]
    fn prose_is_invalid_output() {
        let err = parse_vlm_output("I see a cat.", &model(), None, None).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidOutput(_)));
    }

    #[test]
    fn missing_key_is_invalid_output() {
        let err = parse_vlm_output(r#"{"finding": "x"}"#, &model(), None, None).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidOutput(_)));
    }

    #[test]
    fn overlong_finding_is_invalid_output() {
        let text = format!(
            r#"{{"finding": "{}", "explanation": "e", "recommendation": "r"}}"#,
            "x".repeat(MAX_FINDING_CHARS + 1)
        );
        let err = parse_vlm_output(&text, &model(), None, None).unwrap_err();
        assert!(err.to_string().contains("exceeds 160"));
    }

    #[test]
    fn confidence_levels_map_to_scores() {
        assert_eq!(normalize_confidence(&serde_json::json!({"level": "high"})), Some(0.85));
        assert_eq!(normalize_confidence(&serde_json::json!({"level": "medium"})), Some(0.60));
        assert_eq!(normalize_confidence(&serde_json::json!("low")), Some(0.30));
        assert_eq!(
            normalize_confidence(&serde_json::json!({"score": 0.42, "level": "high"})),
            Some(0.42)
        );
        // Out-of-range score falls back to the level.
        assert_eq!(
            normalize_confidence(&serde_json::json!({"score": 4.2, "level": "low"})),
            Some(0.30)
        );
        assert_eq!(normalize_confidence(&serde_json::json!(null)), None);
    }

    #[test]
    fn document_page_normalizes_leniently() {
        let text = r#"{
            "fields": [
                {"name": "Invoice No", "value": "INV-7", "confidence": {"score": 0.9}},
                {"name": "Total", "value": 120.5, "confidence": {"level": "medium"}},
                {"value": "nameless"},
                "garbage",
                {"name": "Due date", "value": null}
            ],
            "tables": [
                {"n_rows": "2", "n_cols": 1, "cells": [
                    {"row": 0, "col": 0, "text": "Item"},
                    {"row": 1, "col": 0, "text": null}
                ]}
            ],
            "warnings": ["slight blur"]
        }"#;
        let raw = parse_document_page(text, 2, &model()).unwrap();
        let fields = &raw.evidence.fields;
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[1].value.as_deref(), Some("120.5"));
        assert_eq!(fields[2].value, None);
        assert_eq!(raw.evidence.tables.len(), 1);
        assert_eq!(raw.evidence.tables[0].n_rows, 2);
        assert_eq!(raw.evidence.tables[0].cells.len(), 1);
        assert_eq!(raw.evidence.warnings, vec!["slight blur"]);
        // Mean of field scores when the page gives none.
        assert!((raw.confidence.unwrap() - 0.75).abs() < 1e-9);
        assert_eq!(
            raw.finding.as_deref(),
            Some("Extracted 3 field(s) and 1 table(s) from page 2.")
        );
    }

    #[test]
    fn oversized_table_grid_is_clamped() {
        let text = r#"{"tables":[{"n_rows":18446744073709551615,"n_cols":2,"cells":[]}],"page_confidence":0.9}"#;
        let raw = parse_document_page(text, 0, &model()).unwrap();
        let table = &raw.evidence.tables[0];
        assert_eq!(table.n_rows, MAX_TABLE_ROWS);
        assert_eq!(table.n_cols, 2);

        let rendered = table.to_contract("page_0_table_0");
        assert_eq!(rendered["rows"].as_array().unwrap().len(), MAX_TABLE_ROWS);
    }

    #[test]
    fn table_grid_grows_to_cover_cells() {
        let text = r#"{"tables":[
            {"cells":[
                {"row":0,"col":0,"text":"Item"},
                {"row":2,"col":1,"text":"4.50"}
            ]},
            {"n_rows":1,"n_cols":1,"cells":[
                {"row":0,"col":3,"text":"Qty"},
                {"row":9000,"col":0,"text":"lost"},
                {"row":0,"col":70,"text":"lost"}
            ]}
        ]}"#;
        let raw = parse_document_page(text, 0, &model()).unwrap();
        let tables = &raw.evidence.tables;

        assert_eq!((tables[0].n_rows, tables[0].n_cols), (3, 2));
        let rendered = tables[0].to_contract("t");
        assert_eq!(rendered["rows"][2]["col_1"], "4.50");
        assert_eq!(rendered["rows"][1]["col_0"], "");

        assert_eq!((tables[1].n_rows, tables[1].n_cols), (1, 4));
        assert_eq!(tables[1].cells.len(), 1);
        assert_eq!(tables[1].to_contract("t")["rows"][0]["col_3"], "Qty");
    }

    #[test]
    fn document_page_prefers_page_confidence() {
        let text = r#"{"fields": [], "tables": [], "page_confidence": {"level": "high"}}"#;
        let raw = parse_document_page(text, 0, &model()).unwrap();
        assert_eq!(raw.confidence, Some(0.85));
    }

    #[test]
    fn document_page_without_json_is_invalid_output() {
        let err = parse_document_page("unreadable scan", 0, &model()).unwrap_err();
        assert!(matches!(err, AdapterError::InvalidOutput(_)));
        let err = parse_document_page("{not json}", 0, &model()).unwrap_err();
        assert!(matches!(err, AdapterError::Json(_)));
    }
}
