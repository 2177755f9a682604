//! Vision-only baseline: a top-k image classifier wrapped as a perception adapter.
//!
//! Useful as a fast sanity check. Its labels come from a generic label set,
//! so every result carries a domain-mismatch warning.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use super::types::{
    Evidence, ModelInfo, PerceptionAdapter, PerceptionRequest, RawPerception, UnitPayload,
};
use crate::pipeline::AdapterError;

pub const DOMAIN_MISMATCH_WARNING: &str = "baseline_imagenet_labels_may_not_match_domain";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelScore {
    pub label: String,
    pub prob: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingPreview {
    pub dim: usize,
    pub preview: Vec<f32>,
}

/// Classifier output, labels sorted by descending probability.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub top_k: Vec<LabelScore>,
    pub embedding: Option<EmbeddingPreview>,
    pub model: ModelInfo,
}

/// Pretrained image classifier.
pub trait ImageClassifier: Send + Sync {
    fn classify(&self, image: &UnitPayload, top_k: usize) -> Result<Classification, AdapterError>;
}

pub struct BaselineVisionAdapter {
    classifier: Arc<dyn ImageClassifier>,
    top_k: usize,
}

impl BaselineVisionAdapter {
    pub fn new(classifier: Arc<dyn ImageClassifier>) -> Self {
        Self {
            classifier,
            top_k: 5,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }
}

impl PerceptionAdapter for BaselineVisionAdapter {
    fn name(&self) -> &str {
        "baseline"
    }

    fn call(&self, request: &PerceptionRequest) -> Result<RawPerception, AdapterError> {
        let payload = request.unit.payload();
        if payload.is_empty() {
            return Err(AdapterError::InvalidInput("empty image payload".into()));
        }

        let result = self.classifier.classify(payload, self.top_k)?;

        let (finding, confidence) = match result.top_k.first() {
            Some(top1) => (format!("baseline_top1: {}", top1.label), top1.prob),
            None => ("baseline_no_prediction".to_string(), 0.0),
        };

        let mut baseline = Map::new();
        baseline.insert("top_k".into(), serde_json::to_value(&result.top_k)?);
        baseline.insert("embedding".into(), serde_json::to_value(&result.embedding)?);

        let mut details = Map::new();
        details.insert("baseline".into(), Value::Object(baseline));
        details.insert("model".into(), serde_json::to_value(&result.model)?);

        Ok(RawPerception {
            finding: Some(finding),
            confidence: Some(confidence),
            details,
            evidence: Evidence {
                warnings: vec![DOMAIN_MISMATCH_WARNING.to_string()],
                model: Some(result.model),
                ..Evidence::default()
            },
        })
    }
}
