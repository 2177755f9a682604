//! Provider-less perception adapters.
//!
//! `MockVlmAdapter`, `MockDocumentAdapter` and `MockClassifier` back the
//! `mock` provider setting. `ScriptedPerceptionAdapter` replays a per-unit
//! script of responses, failures and delays for pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Map, Value};

use super::baseline::{Classification, ImageClassifier, LabelScore};
use super::prompt::{DocumentHints, ExtractionStyle};
use super::types::{
    Evidence, ExtractedField, ModelInfo, PerceptionAdapter, PerceptionRequest, RawPerception,
    UnitPayload,
};
use crate::pipeline::policy::FailureKind;
use crate::pipeline::AdapterError;

// ──────────────────────────────────────────────
// Mock providers
// ──────────────────────────────────────────────

/// Placeholder VLM for development without a model server.
pub struct MockVlmAdapter {
    model: ModelInfo,
}

impl MockVlmAdapter {
    pub fn new() -> Self {
        Self {
            model: ModelInfo::new("mock-vlm", "0.1"),
        }
    }
}

impl Default for MockVlmAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PerceptionAdapter for MockVlmAdapter {
    fn name(&self) -> &str {
        &self.model.name
    }

    fn call(&self, request: &PerceptionRequest) -> Result<RawPerception, AdapterError> {
        let unit = &request.unit;
        let mut warnings = Vec::new();
        if unit.prompt().is_none() && unit.task().is_none() {
            warnings.push("empty_prompt_used_default_behavior".to_string());
        }

        let mut vlm = Map::new();
        vlm.insert("task".into(), Value::String(unit.task().unwrap_or_default().into()));
        vlm.insert("prompt".into(), Value::String(unit.prompt().unwrap_or_default().into()));
        vlm.insert(
            "explanation".into(),
            Value::String("Mock VLM output (dev mode). Replace with real VLM adapter.".into()),
        );
        vlm.insert(
            "recommendation".into(),
            Value::String("Enable a real VLM provider/model for multimodal reasoning.".into()),
        );

        let mut details = Map::new();
        details.insert("vlm".into(), Value::Object(vlm));
        details.insert("model".into(), serde_json::to_value(&self.model)?);

        Ok(RawPerception {
            finding: Some("visual_summary_placeholder".into()),
            confidence: Some(0.2),
            details,
            evidence: Evidence {
                warnings,
                raw_output: Some(format!(
                    "[MOCK] prompt={} task={} question={}",
                    unit.prompt().unwrap_or_default(),
                    unit.task().unwrap_or_default(),
                    unit.question().unwrap_or_default()
                )),
                model: Some(self.model.clone()),
                ..Evidence::default()
            },
        })
    }
}

/// Document extractor used when no engine is configured: every page comes
/// back empty with a warning.
pub struct MockDocumentAdapter;

impl PerceptionAdapter for MockDocumentAdapter {
    fn name(&self) -> &str {
        "noop-document"
    }

    fn call(&self, request: &PerceptionRequest) -> Result<RawPerception, AdapterError> {
        let page = request.unit.unit_id();
        let mut details = Map::new();
        details.insert("page_index".into(), Value::from(page));
        details.insert(
            "extraction_style".into(),
            Value::from(request.unit.extraction_style().as_str()),
        );
        Ok(RawPerception {
            finding: Some(format!("Extracted 0 field(s) and 0 table(s) from page {page}.")),
            confidence: None,
            details,
            evidence: Evidence {
                warnings: vec![
                    "No document understanding engine configured; returned empty extraction."
                        .to_string(),
                ],
                ..Evidence::default()
            },
        })
    }
}

/// Classifier returning a fixed label list.
pub struct MockClassifier {
    labels: Vec<LabelScore>,
}

impl MockClassifier {
    pub fn new(labels: Vec<(&str, f64)>) -> Self {
        Self {
            labels: labels
                .into_iter()
                .map(|(label, prob)| LabelScore {
                    label: label.to_string(),
                    prob,
                })
                .collect(),
        }
    }
}

impl ImageClassifier for MockClassifier {
    fn classify(&self, _image: &UnitPayload, top_k: usize) -> Result<Classification, AdapterError> {
        Ok(Classification {
            top_k: self.labels.iter().take(top_k).cloned().collect(),
            embedding: None,
            model: ModelInfo::new("mock-classifier", "0.1"),
        })
    }
}

// ──────────────────────────────────────────────
// ScriptedPerceptionAdapter
// ──────────────────────────────────────────────

/// One scripted reaction to a call.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Respond(RawPerception),
    Fail(FailureKind, String),
    /// Block the calling thread, then respond.
    Delay(Duration, RawPerception),
    Panic,
}

/// Call as seen by the scripted adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub unit_id: usize,
    pub attempt: u32,
    pub tightened: bool,
    pub extraction_style: ExtractionStyle,
    pub document_hints: DocumentHints,
}

/// Replays per-unit scripts. Each call consumes the next step for its unit;
/// the last step repeats once the script runs out.
pub struct ScriptedPerceptionAdapter {
    scripts: Mutex<HashMap<usize, VecDeque<ScriptStep>>>,
    calls: AtomicUsize,
    recorded: Mutex<Vec<RecordedCall>>,
}

impl ScriptedPerceptionAdapter {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            recorded: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(self, unit_id: usize, steps: Vec<ScriptStep>) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            scripts.insert(unit_id, steps.into());
        }
        self
    }

    /// Total calls across all units.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, unit_id: usize) -> Vec<RecordedCall> {
        self.recorded
            .lock()
            .map(|calls| calls.iter().filter(|c| c.unit_id == unit_id).cloned().collect())
            .unwrap_or_default()
    }

    /// A successful page answer with the given page confidence and fields.
    pub fn page(confidence: f64, fields: &[(&str, &str, Option<f64>)]) -> RawPerception {
        RawPerception {
            finding: Some(format!("Extracted {} field(s)", fields.len())),
            confidence: Some(confidence),
            details: Map::new(),
            evidence: Evidence {
                fields: fields
                    .iter()
                    .map(|(name, value, conf)| ExtractedField::new(*name, *value, *conf))
                    .collect(),
                ..Evidence::default()
            },
        }
    }

    /// A successful single-image answer.
    pub fn finding(finding: &str, confidence: f64) -> RawPerception {
        RawPerception {
            finding: Some(finding.to_string()),
            confidence: Some(confidence),
            ..RawPerception::default()
        }
    }

    fn next_step(&self, unit_id: usize) -> Option<ScriptStep> {
        let mut scripts = self.scripts.lock().ok()?;
        let queue = scripts.get_mut(&unit_id)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Default for ScriptedPerceptionAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PerceptionAdapter for ScriptedPerceptionAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn call(&self, request: &PerceptionRequest) -> Result<RawPerception, AdapterError> {
        let unit_id = request.unit.unit_id();
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded.push(RecordedCall {
                unit_id,
                attempt: request.attempt,
                tightened: request.tightened,
                extraction_style: request.unit.extraction_style(),
                document_hints: request.unit.document_hints().clone(),
            });
        }

        match self.next_step(unit_id) {
            Some(ScriptStep::Respond(raw)) => Ok(raw),
            Some(ScriptStep::Delay(delay, raw)) => {
                std::thread::sleep(delay);
                Ok(raw)
            }
            Some(ScriptStep::Fail(kind, message)) => Err(match kind {
                FailureKind::Timeout => AdapterError::Timeout(message),
                FailureKind::InvalidOutput => AdapterError::InvalidOutput(message),
                FailureKind::TransientFailure => AdapterError::Unavailable(message),
                FailureKind::Fatal => AdapterError::InvalidInput(message),
            }),
            Some(ScriptStep::Panic) => panic!("scripted adapter panic on unit {unit_id}"),
            None => Err(AdapterError::NotConfigured(format!("no script for unit {unit_id}"))),
        }
    }
}
