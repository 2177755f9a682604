//! Pipeline orchestration: perception → aggregation → explanation → response.
//!
//! A `Pipeline` is built once from a resolved `AdapterSet` and a
//! `PipelineConfig`; both run methods are total and always return a
//! `PipelineResponse`. Document pages fan out as tokio tasks bounded by the
//! worker semaphore, and the whole perception phase is capped by the request
//! deadline. Explanation starts only after every page outcome is known.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::Instrument;
use uuid::Uuid;

use super::aggregation::{aggregate, assemble, PageResult, StructuredResult};
use super::composer::{compose, PipelineResponse};
use super::explanation::{
    ExplanationAdapter, ExplanationInvoker, ExplanationOutcome, MockExplainer, OllamaExplainer,
};
use super::lifecycle::{ExplainedAs, RequestLifecycle, RequestState};
use super::ollama::OllamaClient;
use super::perception::{
    AnalysisMode, AnalysisUnit, BaselineVisionAdapter, ImageClassifier, MockClassifier,
    MockDocumentAdapter, MockVlmAdapter, OllamaDocumentAdapter, OllamaVlmAdapter,
    PerceptionAdapter, PerceptionInvoker, PerceptionOutcome, UnitPayload,
};
use super::perception::prompt::{DocumentHints, ExtractionStyle};
use super::policy::{FailureKind, PolicyEngine};
use crate::config::{Provider, Settings};
use crate::observability::MetricsSink;
use crate::pipeline_config::PipelineConfig;

pub const DEADLINE_EXCEEDED_MESSAGE: &str = "request deadline exceeded";

// ──────────────────────────────────────────────
// AdapterSet
// ──────────────────────────────────────────────

/// Adapters resolved once at startup and handed to `Pipeline::new`.
#[derive(Clone)]
pub struct AdapterSet {
    pub vision: Option<Arc<dyn PerceptionAdapter>>,
    pub vlm: Option<Arc<dyn PerceptionAdapter>>,
    pub document: Option<Arc<dyn PerceptionAdapter>>,
    pub explainer: Arc<dyn ExplanationAdapter>,
}

impl AdapterSet {
    /// Provider-less set: mock VLM, no-op document extractor, a fixed-label
    /// baseline classifier and the mock explainer.
    pub fn mock() -> Self {
        let classifier = MockClassifier::new(vec![("crack", 0.62), ("scratch", 0.21), ("dent", 0.09)]);
        Self {
            vision: Some(Arc::new(BaselineVisionAdapter::new(Arc::new(classifier)))),
            vlm: Some(Arc::new(MockVlmAdapter::new())),
            document: Some(Arc::new(MockDocumentAdapter)),
            explainer: Arc::new(MockExplainer),
        }
    }

    /// Resolve adapters from the configured providers.
    ///
    /// The VLM provider also serves document pages. Baseline vision has no
    /// bundled model outside the mock provider; attach one with
    /// [`AdapterSet::with_classifier`].
    pub fn from_settings(settings: &Settings) -> Self {
        let mock = Self::mock();

        let (vision, vlm, document): (
            Option<Arc<dyn PerceptionAdapter>>,
            Option<Arc<dyn PerceptionAdapter>>,
            Option<Arc<dyn PerceptionAdapter>>,
        ) = match settings.vlm_provider {
            Provider::Mock => (mock.vision, mock.vlm, mock.document),
            Provider::Ollama => {
                let client =
                    OllamaClient::new(&settings.ollama_url, settings.vlm_timeout.as_secs().max(1));
                (
                    None,
                    Some(Arc::new(OllamaVlmAdapter::new(
                        client.clone(),
                        &settings.vlm_model_id,
                    ))),
                    Some(Arc::new(OllamaDocumentAdapter::new(
                        client,
                        &settings.document_model_id,
                    ))),
                )
            }
        };

        let explainer: Arc<dyn ExplanationAdapter> = match settings.llm_provider {
            Provider::Mock => mock.explainer,
            Provider::Ollama => {
                let client =
                    OllamaClient::new(&settings.ollama_url, settings.llm_timeout.as_secs().max(1));
                Arc::new(OllamaExplainer::new(client, &settings.llm_model_id))
            }
        };

        tracing::info!(
            vlm_provider = %settings.vlm_provider,
            llm_provider = %settings.llm_provider,
            baseline = vision.is_some(),
            "Resolved pipeline adapters"
        );

        Self {
            vision,
            vlm,
            document,
            explainer,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ImageClassifier>) -> Self {
        self.vision = Some(Arc::new(BaselineVisionAdapter::new(classifier)));
        self
    }
}

/// One image submitted for analysis.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub payload: UnitPayload,
    pub prompt: Option<String>,
    pub task: Option<String>,
    pub question: Option<String>,
}

impl ImageInput {
    pub fn new(payload: UnitPayload) -> Self {
        Self {
            payload,
            prompt: None,
            task: None,
            question: None,
        }
    }
}

/// Rendered pages of one document submitted for extraction.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub pages: Vec<UnitPayload>,
    /// 0 means "use the configured limit".
    pub max_pages: usize,
    pub style: ExtractionStyle,
    pub hints: DocumentHints,
}

impl DocumentInput {
    pub fn new(pages: Vec<UnitPayload>) -> Self {
        Self {
            pages,
            max_pages: 0,
            style: ExtractionStyle::default(),
            hints: DocumentHints::default(),
        }
    }
}

// ──────────────────────────────────────────────
// Pipeline
// ──────────────────────────────────────────────

pub struct Pipeline {
    config: PipelineConfig,
    perception: PerceptionInvoker,
    explanation: ExplanationInvoker,
    workers: Arc<Semaphore>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, adapters: AdapterSet, metrics: Arc<dyn MetricsSink>) -> Self {
        let engine = PolicyEngine::new(metrics);

        let mut perception = PerceptionInvoker::new(engine.clone(), &config);
        for (mode, adapter) in [
            (AnalysisMode::Baseline, adapters.vision),
            (AnalysisMode::Vlm, adapters.vlm),
            (AnalysisMode::Document, adapters.document),
        ] {
            if let Some(adapter) = adapter {
                perception = perception.with_adapter(mode, adapter);
            }
        }
        let explanation = ExplanationInvoker::new(engine, adapters.explainer, &config);
        let workers = Arc::new(Semaphore::new(config.worker_pool_size.max(1)));

        Self {
            config,
            perception,
            explanation,
            workers,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Pages actually scheduled for a request asking for `requested` (0 means
    /// "use the configured limit").
    pub fn page_limit(&self, requested: usize) -> usize {
        if requested == 0 {
            self.config.max_pages
        } else {
            requested.min(self.config.max_pages)
        }
    }

    pub async fn run_image_pipeline(&self, input: ImageInput, mode: AnalysisMode) -> PipelineResponse {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!(
            "image_pipeline",
            request_id = %request_id,
            mode = %mode,
            bytes = input.payload.len(),
        );

        async move {
            let started = Instant::now();
            let mut lifecycle = RequestLifecycle::new();
            advance(&mut lifecycle, RequestState::Perceiving);

            let unit = Arc::new(
                AnalysisUnit::new(0, input.payload, mode)
                    .with_prompt(input.prompt)
                    .with_task(input.task)
                    .with_question(input.question),
            );
            let outcome = match tokio::time::timeout(
                self.config.request_deadline,
                self.perception.invoke(unit),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!("Request deadline elapsed during perception");
                    PerceptionOutcome::not_attempted(FailureKind::Timeout, DEADLINE_EXCEEDED_MESSAGE)
                }
            };

            let structured = assemble(outcome, mode);
            self.explain_and_compose(structured, lifecycle, request_id, started)
                .await
        }
        .instrument(span)
        .await
    }

    pub async fn run_document_pipeline(&self, input: DocumentInput) -> PipelineResponse {
        let request_id = Uuid::new_v4();
        let DocumentInput {
            pages,
            max_pages,
            style,
            hints,
        } = input;
        let submitted = pages.len();
        let limit = self.page_limit(max_pages);
        let span = tracing::info_span!(
            "document_pipeline",
            request_id = %request_id,
            pages = submitted,
            limit,
            style = style.as_str(),
        );

        async move {
            let started = Instant::now();
            let mut lifecycle = RequestLifecycle::new();
            advance(&mut lifecycle, RequestState::Perceiving);

            let units: Vec<Arc<AnalysisUnit>> = pages
                .into_iter()
                .take(limit)
                .enumerate()
                .map(|(i, payload)| {
                    Arc::new(
                        AnalysisUnit::new(i, payload, AnalysisMode::Document)
                            .with_extraction(style, hints.clone()),
                    )
                })
                .collect();
            let scheduled = units.len();

            let mut outcomes = self.perceive_pages(units).await;
            let page_results = (0..scheduled)
                .map(|i| {
                    let outcome = outcomes.remove(&i).unwrap_or_else(|| {
                        PerceptionOutcome::not_attempted(FailureKind::Timeout, DEADLINE_EXCEEDED_MESSAGE)
                    });
                    PageResult::from_outcome(i, outcome)
                })
                .collect();

            let mut document = aggregate(page_results);
            if submitted > scheduled {
                tracing::warn!(submitted, scheduled, "Document truncated to page limit");
                document.warnings.push(format!(
                    "document has {submitted} pages; only the first {scheduled} were analyzed"
                ));
            }

            let structured = StructuredResult::from_document(document);
            let mut response = self
                .explain_and_compose(structured, lifecycle, request_id, started)
                .await;
            response
                .details
                .insert("mode".into(), Value::from(style.as_str()));
            response
        }
        .instrument(span)
        .await
    }

    /// Run every page under the worker bound and the request deadline.
    /// Pages still running when the deadline elapses are aborted and absent
    /// from the returned map.
    async fn perceive_pages(&self, units: Vec<Arc<AnalysisUnit>>) -> BTreeMap<usize, PerceptionOutcome> {
        let deadline = tokio::time::Instant::now() + self.config.request_deadline;
        let mut tasks = JoinSet::new();
        let mut page_of_task = HashMap::new();

        for unit in units {
            let invoker = self.perception.clone();
            let workers = Arc::clone(&self.workers);
            let unit_id = unit.unit_id();
            let handle = tasks.spawn(
                async move {
                    // The semaphore is never closed, so a failed acquire only
                    // means running unbounded.
                    let _permit = workers.acquire_owned().await.ok();
                    (unit_id, invoker.invoke(unit).await)
                }
                .in_current_span(),
            );
            page_of_task.insert(handle.id(), unit_id);
        }

        join_pages(tasks, &page_of_task, deadline).await
    }

    async fn explain_and_compose(
        &self,
        structured: StructuredResult,
        mut lifecycle: RequestLifecycle,
        request_id: Uuid,
        started: Instant,
    ) -> PipelineResponse {
        advance(&mut lifecycle, RequestState::Perceived(structured.state));
        advance(&mut lifecycle, RequestState::Explaining);

        let explanation = self.explanation.invoke(&structured).await;
        let explained_as = match &explanation {
            ExplanationOutcome::Success(_) => ExplainedAs::Success,
            ExplanationOutcome::Failure(_) => ExplainedAs::Fallback,
        };
        advance(&mut lifecycle, RequestState::Explained(explained_as));

        let attempts_used = structured.attempts_used + explanation.attempts_used();
        let mut response = compose(structured, explanation);
        advance(&mut lifecycle, RequestState::Composed);

        let duration_ms = started.elapsed().as_millis() as u64;
        response.details.insert(
            "meta".into(),
            serde_json::json!({
                "request_id": request_id.to_string(),
                "duration_ms": duration_ms,
                "attempts_used": attempts_used,
            }),
        );

        tracing::info!(
            confidence = response.confidence,
            warnings = response.warnings.len(),
            attempts_used,
            elapsed_ms = duration_ms,
            explained = ?explained_as,
            "Pipeline completed"
        );
        response
    }
}

/// Collect page outcomes until every task is joined or `deadline` passes.
/// A task that panicked or was cancelled becomes a `fatal` outcome for its
/// page; unfinished tasks are aborted at the deadline and left out.
async fn join_pages(
    mut tasks: JoinSet<(usize, PerceptionOutcome)>,
    page_of_task: &HashMap<task::Id, usize>,
    deadline: tokio::time::Instant,
) -> BTreeMap<usize, PerceptionOutcome> {
    let mut outcomes = BTreeMap::new();
    loop {
        match tokio::time::timeout_at(deadline, tasks.join_next()).await {
            Ok(Some(Ok((unit_id, outcome)))) => {
                outcomes.insert(unit_id, outcome);
            }
            Ok(Some(Err(e))) => match page_of_task.get(&e.id()) {
                Some(&unit_id) => {
                    tracing::error!(page = unit_id, error = %e, "Page task failed to complete");
                    outcomes.insert(
                        unit_id,
                        PerceptionOutcome::not_attempted(
                            FailureKind::Fatal,
                            format!("page task failed: {e}"),
                        ),
                    );
                }
                None => tracing::error!(error = %e, "Unknown page task failed to complete"),
            },
            Ok(None) => break,
            Err(_) => {
                tracing::warn!(
                    finished = outcomes.len(),
                    pending = tasks.len(),
                    "Request deadline elapsed; aborting unfinished pages"
                );
                tasks.abort_all();
                break;
            }
        }
    }
    outcomes
}

/// The pipeline walks the states in a fixed order, so a rejected transition
/// is a bug worth logging but never worth failing the request over.
fn advance(lifecycle: &mut RequestLifecycle, next: RequestState) {
    if let Err(e) = lifecycle.advance(next) {
        tracing::error!(error = %e, "Request lifecycle violated");
    }
}

/// `details.meta.request_id` of a composed response, if present.
pub fn request_id_of(response: &PipelineResponse) -> Option<&str> {
    response
        .details
        .get("meta")
        .and_then(|meta| meta.get("request_id"))
        .and_then(Value::as_str)
}
