//! Page Aggregator: merges independent per-page outcomes into one document.
//!
//! Pages are sorted by `unit_id` before anything else, so the result does
//! not depend on the order in which page tasks completed. A failed page
//! never blocks the others; it contributes an empty extraction, a
//! `page[i]: <kind>` warning and a `PageFailure` entry.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use super::types::{
    DocumentResult, FieldValue, PageFailure, PageResult, PageStatus, PageSummary,
};
use crate::pipeline::perception::PerceptionOutcome;

/// Case- and whitespace-insensitive form used to decide whether two values
/// for the same field actually disagree.
fn normalize_value(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

struct FieldCandidate {
    best: FieldValue,
    conflicting: bool,
    /// Pages that reported this field.
    pages: BTreeSet<usize>,
}

pub fn aggregate(mut pages: Vec<PageResult>) -> DocumentResult {
    pages.sort_by_key(|p| p.unit_id);

    let pages_total = pages.len();
    let mut pages_succeeded = 0usize;
    let mut confidence_sum = 0.0f64;
    let mut fields: BTreeMap<String, FieldCandidate> = BTreeMap::new();
    // Field names in the order their first conflict was seen.
    let mut conflict_order: Vec<String> = Vec::new();
    let mut tables = Vec::new();
    let mut warnings = Vec::new();
    let mut page_failures = Vec::new();
    let mut summaries = Vec::with_capacity(pages_total);

    for page in pages {
        let i = page.unit_id;
        match page.outcome {
            PerceptionOutcome::Success(success) => {
                pages_succeeded += 1;
                confidence_sum += success.confidence;
                summaries.push(PageSummary {
                    page: i,
                    status: PageStatus::Ok,
                    confidence: Some(success.confidence),
                    attempts_used: success.attempts_used,
                });
                warnings.extend(page.warnings.iter().map(|w| format!("page[{i}]: {w}")));

                for field in success.evidence.fields {
                    let Some(value) = field.value.filter(|v| !v.trim().is_empty()) else {
                        continue;
                    };
                    let candidate = FieldValue {
                        value,
                        confidence: field.confidence.unwrap_or(success.confidence),
                        page: i,
                    };
                    merge_field(&mut fields, &mut conflict_order, field.name, candidate);
                }
                tables.extend(success.evidence.tables);
            }
            PerceptionOutcome::Failure(failure) => {
                warnings.push(format!("page[{i}]: {}", failure.kind.underlying()));
                warnings.extend(page.warnings.iter().map(|w| format!("page[{i}]: {w}")));
                summaries.push(PageSummary {
                    page: i,
                    status: PageStatus::Failed,
                    confidence: None,
                    attempts_used: failure.attempts_used,
                });
                tracing::warn!(
                    page = i,
                    kind = %failure.kind,
                    error = %failure.message,
                    "Page perception failed; continuing with remaining pages"
                );
                page_failures.push(PageFailure {
                    page: i,
                    kind: failure.kind,
                    message: failure.message,
                    attempts_used: failure.attempts_used,
                });
            }
        }
    }

    let failed = pages_total - pages_succeeded;
    if failed > 0 {
        warnings.push(format!("{failed} of {pages_total} pages failed"));
    }
    for name in &conflict_order {
        if let Some(candidate) = fields.get(name) {
            let label = if candidate.pages.len() == 1 { "page" } else { "pages" };
            let pages = candidate
                .pages
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            warnings.push(format!(
                "field '{name}' has conflicting values ({label} {pages}); kept value from page {} (confidence {:.2})",
                candidate.best.page, candidate.best.confidence
            ));
        }
    }

    // mean(successful confidences) × succeeded / total, i.e. sum / total.
    let overall_confidence = if pages_succeeded == 0 {
        0.0
    } else {
        let mean = confidence_sum / pages_succeeded as f64;
        (mean * pages_succeeded as f64 / pages_total as f64).clamp(0.0, 1.0)
    };

    DocumentResult {
        extracted_fields: fields
            .into_iter()
            .map(|(name, candidate)| (name, candidate.best))
            .collect(),
        tables,
        overall_confidence,
        warnings,
        pages_succeeded,
        pages_total,
        page_failures,
        pages: summaries,
    }
}

/// Keep the highest-confidence value; ties keep the earlier page.
fn merge_field(
    fields: &mut BTreeMap<String, FieldCandidate>,
    conflict_order: &mut Vec<String>,
    name: String,
    candidate: FieldValue,
) {
    match fields.entry(name) {
        Entry::Vacant(slot) => {
            let pages = BTreeSet::from([candidate.page]);
            slot.insert(FieldCandidate {
                best: candidate,
                conflicting: false,
                pages,
            });
        }
        Entry::Occupied(mut slot) => {
            let name = slot.key().clone();
            let existing = slot.get_mut();
            existing.pages.insert(candidate.page);
            if normalize_value(&existing.best.value) != normalize_value(&candidate.value)
                && !existing.conflicting
            {
                existing.conflicting = true;
                conflict_order.push(name);
            }
            if candidate.confidence > existing.best.confidence {
                existing.best = candidate;
            }
        }
    }
}
