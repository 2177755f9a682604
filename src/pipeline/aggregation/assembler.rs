//! Single-Unit Assembler: the image path's equivalent of the aggregator.
//!
//! Produces a one-page `DocumentResult` so the explainer and composer treat
//! images and documents alike. There is no cross-page merge and warnings are
//! not page-prefixed.

use std::collections::BTreeMap;

use super::types::{
    DocumentResult, FieldValue, PageFailure, PageStatus, PageSummary, PerceptionState,
    ResultSource, StructuredResult,
};
use crate::pipeline::perception::{AnalysisMode, PerceptionOutcome};

/// Finding reported when the single unit could not be perceived.
pub const PERCEPTION_FAILED_FINDING: &str = "perception_failed";

pub fn assemble(outcome: PerceptionOutcome, mode: AnalysisMode) -> StructuredResult {
    let source = ResultSource::Image { mode };

    match outcome {
        PerceptionOutcome::Success(success) => {
            let extracted_fields: BTreeMap<_, _> = success
                .evidence
                .fields
                .into_iter()
                .filter_map(|field| {
                    let value = field.value.filter(|v| !v.trim().is_empty())?;
                    Some((
                        field.name,
                        FieldValue {
                            value,
                            confidence: field.confidence.unwrap_or(success.confidence),
                            page: 0,
                        },
                    ))
                })
                .collect();

            let document = DocumentResult {
                extracted_fields,
                tables: success.evidence.tables,
                overall_confidence: success.confidence,
                warnings: success.evidence.warnings,
                pages_succeeded: 1,
                pages_total: 1,
                page_failures: Vec::new(),
                pages: vec![PageSummary {
                    page: 0,
                    status: PageStatus::Ok,
                    confidence: Some(success.confidence),
                    attempts_used: success.attempts_used,
                }],
            };

            StructuredResult {
                source,
                finding: success.finding,
                details: success.details,
                document,
                state: PerceptionState::Success,
                attempts_used: success.attempts_used,
            }
        }
        PerceptionOutcome::Failure(failure) => {
            let mut document = DocumentResult::empty();
            document.pages_total = 1;
            document
                .warnings
                .push(format!("perception: {}", failure.kind.underlying()));
            document.pages.push(PageSummary {
                page: 0,
                status: PageStatus::Failed,
                confidence: None,
                attempts_used: failure.attempts_used,
            });
            document.page_failures.push(PageFailure {
                page: 0,
                kind: failure.kind,
                message: failure.message,
                attempts_used: failure.attempts_used,
            });

            StructuredResult {
                source,
                finding: PERCEPTION_FAILED_FINDING.to_string(),
                details: serde_json::Map::new(),
                document,
                state: PerceptionState::AllFailed,
                attempts_used: failure.attempts_used,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::perception::{Evidence, ExtractedField, PerceptionFailure, PerceptionSuccess};
    use crate::pipeline::policy::{FailureKind, TerminalKind};
    use serde_json::Map;

    #[test]
    fn success_is_one_of_one_page() {
        let outcome = PerceptionOutcome::Success(PerceptionSuccess {
            finding: "Corrosion on bracket".into(),
            confidence: 0.74,
            details: Map::new(),
            evidence: Evidence {
                fields: vec![ExtractedField::new("severity", "moderate", None)],
                warnings: vec!["low light".into()],
                ..Evidence::default()
            },
            attempts_used: 2,
        });
        let result = assemble(outcome, AnalysisMode::Vlm);

        assert_eq!(result.finding, "Corrosion on bracket");
        assert_eq!(result.state, PerceptionState::Success);
        assert_eq!(result.document.pages_total, 1);
        assert_eq!(result.document.pages_succeeded, 1);
        assert_eq!(result.confidence(), 0.74);
        assert_eq!(result.warnings(), ["low light".to_string()]);
        assert_eq!(result.document.extracted_fields["severity"].confidence, 0.74);
        assert_eq!(result.attempts_used, 2);
    }

    #[test]
    fn failure_is_zero_of_one_page() {
        let outcome = PerceptionOutcome::Failure(PerceptionFailure {
            kind: TerminalKind::RetriesExhausted {
                last: FailureKind::InvalidOutput,
            },
            message: "No JSON object found".into(),
            attempts_used: 3,
        });
        let result = assemble(outcome, AnalysisMode::Vlm);

        assert_eq!(result.finding, PERCEPTION_FAILED_FINDING);
        assert_eq!(result.state, PerceptionState::AllFailed);
        assert_eq!(result.document.pages_total, 1);
        assert_eq!(result.document.pages_succeeded, 0);
        assert_eq!(result.confidence(), 0.0);
        assert_eq!(result.warnings(), ["perception: invalid_output".to_string()]);
        assert_eq!(result.document.page_failures[0].attempts_used, 3);
    }
}
