use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::pipeline::perception::{AnalysisMode, ExtractedTable, PerceptionOutcome};
use crate::pipeline::policy::TerminalKind;

/// One document page's perception outcome plus its page-scoped warnings.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    pub unit_id: usize,
    pub outcome: PerceptionOutcome,
    pub warnings: Vec<String>,
}

impl PageResult {
    /// Page warnings are the adapter's own warnings on success, none on failure.
    pub fn from_outcome(unit_id: usize, outcome: PerceptionOutcome) -> Self {
        let warnings = match &outcome {
            PerceptionOutcome::Success(s) => s.evidence.warnings.clone(),
            PerceptionOutcome::Failure(_) => Vec::new(),
        };
        Self {
            unit_id,
            outcome,
            warnings,
        }
    }
}

/// Winning value for one field name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldValue {
    pub value: String,
    pub confidence: f64,
    /// Page the value was read from.
    pub page: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageFailure {
    pub page: usize,
    pub kind: TerminalKind,
    pub message: String,
    pub attempts_used: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Ok,
    Failed,
}

/// Per-page line in `details.pages`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageSummary {
    pub page: usize,
    pub status: PageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub attempts_used: u32,
}

/// Merged perception result over all pages of a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentResult {
    pub extracted_fields: BTreeMap<String, FieldValue>,
    pub tables: Vec<ExtractedTable>,
    pub overall_confidence: f64,
    pub warnings: Vec<String>,
    pub pages_succeeded: usize,
    pub pages_total: usize,
    pub page_failures: Vec<PageFailure>,
    pub pages: Vec<PageSummary>,
}

impl DocumentResult {
    pub fn empty() -> Self {
        Self {
            extracted_fields: BTreeMap::new(),
            tables: Vec::new(),
            overall_confidence: 0.0,
            warnings: Vec::new(),
            pages_succeeded: 0,
            pages_total: 0,
            page_failures: Vec::new(),
            pages: Vec::new(),
        }
    }

    pub fn state(&self) -> PerceptionState {
        if self.pages_succeeded == 0 {
            PerceptionState::AllFailed
        } else if self.pages_succeeded < self.pages_total {
            PerceptionState::Partial
        } else {
            PerceptionState::Success
        }
    }

    /// `tables` rendered as contract rows, numbered across the whole document.
    pub fn contract_tables(&self) -> Vec<Value> {
        self.tables
            .iter()
            .enumerate()
            .map(|(i, table)| table.to_contract(&format!("table_{i}")))
            .collect()
    }
}

/// How much of the perception step produced usable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerceptionState {
    Success,
    Partial,
    AllFailed,
}

impl PerceptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PerceptionState::Success => "success",
            PerceptionState::Partial => "partial",
            PerceptionState::AllFailed => "all_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultSource {
    Image { mode: AnalysisMode },
    Document,
}

/// Perception result handed to the explainer and the composer.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredResult {
    pub source: ResultSource,
    pub finding: String,
    pub details: Map<String, Value>,
    pub document: DocumentResult,
    pub state: PerceptionState,
    /// Adapter attempts spent across all units.
    pub attempts_used: u32,
}

impl StructuredResult {
    /// Wrap an aggregated document.
    pub fn from_document(document: DocumentResult) -> Self {
        let finding = format!(
            "Extracted {} field(s) and {} table(s) from the document.",
            document.extracted_fields.len(),
            document.tables.len()
        );
        let attempts_used = document.pages.iter().map(|p| p.attempts_used).sum();
        Self {
            source: ResultSource::Document,
            finding,
            details: Map::new(),
            state: document.state(),
            document,
            attempts_used,
        }
    }

    pub fn confidence(&self) -> f64 {
        self.document.overall_confidence
    }

    pub fn warnings(&self) -> &[String] {
        &self.document.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::perception::{Evidence, PerceptionSuccess};
    use crate::pipeline::policy::FailureKind;

    #[test]
    fn page_result_takes_success_warnings() {
        let outcome = PerceptionOutcome::Success(PerceptionSuccess {
            finding: "f".into(),
            confidence: 0.5,
            details: Map::new(),
            evidence: Evidence {
                warnings: vec!["blurry".into()],
                ..Evidence::default()
            },
            attempts_used: 1,
        });
        assert_eq!(PageResult::from_outcome(2, outcome).warnings, vec!["blurry"]);

        let failed = PageResult::from_outcome(
            3,
            PerceptionOutcome::not_attempted(FailureKind::Timeout, "deadline"),
        );
        assert!(failed.warnings.is_empty());
    }

    #[test]
    fn state_from_page_counts() {
        let mut doc = DocumentResult::empty();
        assert_eq!(doc.state(), PerceptionState::AllFailed);
        doc.pages_total = 3;
        doc.pages_succeeded = 2;
        assert_eq!(doc.state(), PerceptionState::Partial);
        doc.pages_succeeded = 3;
        assert_eq!(doc.state(), PerceptionState::Success);
    }

    #[test]
    fn document_finding_counts_fields_and_tables() {
        let structured = StructuredResult::from_document(DocumentResult::empty());
        assert_eq!(
            structured.finding,
            "Extracted 0 field(s) and 0 table(s) from the document."
        );
        assert_eq!(structured.state, PerceptionState::AllFailed);
    }

    #[test]
    fn source_serializes_with_kind_tag() {
        let json = serde_json::to_value(ResultSource::Image {
            mode: AnalysisMode::Vlm,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"kind": "image", "mode": "vlm"}));
    }
}
