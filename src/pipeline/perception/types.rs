use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::prompt::{DocumentHints, ExtractionStyle};
use crate::observability::AnalyzerKind;
use crate::pipeline::policy::{FailureKind, TerminalKind};
use crate::pipeline::AdapterError;

// ──────────────────────────────────────────────
// Units
// ──────────────────────────────────────────────

/// Which perception model family handles a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    Vlm,
    Baseline,
    Document,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Vlm => "vlm",
            AnalysisMode::Baseline => "baseline",
            AnalysisMode::Document => "document",
        }
    }

    pub fn analyzer(&self) -> AnalyzerKind {
        match self {
            AnalysisMode::Vlm => AnalyzerKind::Vlm,
            AnalysisMode::Baseline => AnalyzerKind::Vision,
            AnalysisMode::Document => AnalyzerKind::Document,
        }
    }

    /// Only VLM requests are rewritten after unusable output.
    pub fn tightens_on_retry(&self) -> bool {
        matches!(self, AnalysisMode::Vlm)
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only encoded image bytes, shared across page tasks without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPayload {
    bytes: Arc<[u8]>,
    mime_type: String,
}

impl UnitPayload {
    pub fn new(bytes: impl Into<Arc<[u8]>>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
        }
    }

    pub fn png(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self::new(bytes, "image/png")
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One image or one document page to perceive.
///
/// Built once by the pipeline and never modified; attempts that need a
/// stricter request express that through [`PerceptionRequest::tightened`].
#[derive(Debug, Clone)]
pub struct AnalysisUnit {
    unit_id: usize,
    payload: UnitPayload,
    mode: AnalysisMode,
    prompt: Option<String>,
    task: Option<String>,
    question: Option<String>,
    extraction_style: ExtractionStyle,
    document_hints: DocumentHints,
}

impl AnalysisUnit {
    pub fn new(unit_id: usize, payload: UnitPayload, mode: AnalysisMode) -> Self {
        Self {
            unit_id,
            payload,
            mode,
            prompt: None,
            task: None,
            question: None,
            extraction_style: ExtractionStyle::default(),
            document_hints: DocumentHints::default(),
        }
    }

    pub fn with_prompt(mut self, prompt: Option<String>) -> Self {
        self.prompt = non_blank(prompt);
        self
    }

    pub fn with_task(mut self, task: Option<String>) -> Self {
        self.task = non_blank(task);
        self
    }

    pub fn with_question(mut self, question: Option<String>) -> Self {
        self.question = non_blank(question);
        self
    }

    /// Extraction style and caller hints for a document page.
    pub fn with_extraction(mut self, style: ExtractionStyle, hints: DocumentHints) -> Self {
        self.extraction_style = style;
        self.document_hints = hints;
        self
    }

    pub fn unit_id(&self) -> usize {
        self.unit_id
    }

    pub fn payload(&self) -> &UnitPayload {
        &self.payload
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref()
    }

    pub fn task(&self) -> Option<&str> {
        self.task.as_deref()
    }

    pub fn question(&self) -> Option<&str> {
        self.question.as_deref()
    }

    pub fn extraction_style(&self) -> ExtractionStyle {
        self.extraction_style
    }

    pub fn document_hints(&self) -> &DocumentHints {
        &self.document_hints
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// What one attempt hands to an adapter.
#[derive(Debug, Clone)]
pub struct PerceptionRequest {
    pub unit: Arc<AnalysisUnit>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Previous attempt returned unusable output; use the stricter instruction.
    pub tightened: bool,
}

// ──────────────────────────────────────────────
// Evidence
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub version: String,
}

impl ModelInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Key/value read from a page. `value` is `None` when the model saw the
/// field label but could not read a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedField {
    pub name: String,
    pub value: Option<String>,
    pub confidence: Option<f64>,
}

impl ExtractedField {
    pub fn new(name: impl Into<String>, value: impl Into<String>, confidence: Option<f64>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
            confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCell {
    pub row: usize,
    pub col: usize,
    pub text: String,
    pub confidence: Option<f64>,
}

/// Largest grid a page table is rendered with; model-declared sizes are
/// clamped to these.
pub const MAX_TABLE_ROWS: usize = 500;
pub const MAX_TABLE_COLS: usize = 50;

/// A table grid detected on one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTable {
    pub table_index: usize,
    pub n_rows: usize,
    pub n_cols: usize,
    pub cells: Vec<TableCell>,
    pub confidence: Option<f64>,
}

impl ExtractedTable {
    /// Render as `{"name": .., "rows": [{"col_0": .., ..}, ..]}`.
    ///
    /// Cells outside the declared grid are dropped; empty cells render as "".
    /// The grid never exceeds `MAX_TABLE_ROWS` x `MAX_TABLE_COLS`.
    pub fn to_contract(&self, name: &str) -> Value {
        let n_rows = self.n_rows.min(MAX_TABLE_ROWS);
        let n_cols = self.n_cols.min(MAX_TABLE_COLS);
        let mut grid = vec![vec![String::new(); n_cols]; n_rows];
        for cell in &self.cells {
            if cell.row < n_rows && cell.col < n_cols {
                grid[cell.row][cell.col] = cell.text.clone();
            }
        }

        let rows: Vec<Value> = grid
            .into_iter()
            .map(|row| {
                let cols: Map<String, Value> = row
                    .into_iter()
                    .enumerate()
                    .map(|(i, text)| (format!("col_{i}"), Value::String(text)))
                    .collect();
                Value::Object(cols)
            })
            .collect();

        serde_json::json!({ "name": name, "rows": rows })
    }
}

/// Supporting material behind a finding.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Evidence {
    pub fields: Vec<ExtractedField>,
    pub tables: Vec<ExtractedTable>,
    /// Warnings raised by the model or the adapter for this unit.
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelInfo>,
}

// ──────────────────────────────────────────────
// Adapter contract
// ──────────────────────────────────────────────

/// Unvalidated adapter answer. The invoker decides whether it is usable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPerception {
    pub finding: Option<String>,
    pub confidence: Option<f64>,
    pub details: Map<String, Value>,
    pub evidence: Evidence,
}

/// A perception model behind a uniform, synchronous call.
///
/// Implementations must be safe to call concurrently for independent units.
pub trait PerceptionAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn call(&self, request: &PerceptionRequest) -> Result<RawPerception, AdapterError>;

    fn classify_error(&self, error: &AdapterError) -> FailureKind {
        error.default_kind()
    }
}

// ──────────────────────────────────────────────
// Outcomes
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PerceptionSuccess {
    pub finding: String,
    /// Always finite and within `[0, 1]`.
    pub confidence: f64,
    pub details: Map<String, Value>,
    pub evidence: Evidence,
    pub attempts_used: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerceptionFailure {
    pub kind: TerminalKind,
    pub message: String,
    pub attempts_used: u32,
}

/// Result of one perception call. Never mutated after the invoker builds it.
#[derive(Debug, Clone, PartialEq)]
pub enum PerceptionOutcome {
    Success(PerceptionSuccess),
    Failure(PerceptionFailure),
}

impl PerceptionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PerceptionOutcome::Success(_))
    }

    pub fn attempts_used(&self) -> u32 {
        match self {
            PerceptionOutcome::Success(s) => s.attempts_used,
            PerceptionOutcome::Failure(f) => f.attempts_used,
        }
    }

    /// Failure with no adapter call made, e.g. a page cut off by the
    /// request deadline.
    pub fn not_attempted(kind: FailureKind, message: impl Into<String>) -> Self {
        PerceptionOutcome::Failure(PerceptionFailure {
            kind: TerminalKind::Failed(kind),
            message: message.into(),
            attempts_used: 0,
        })
    }
}
