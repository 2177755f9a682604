//! Bounded-attempt executor with per-attempt deadlines.
//!
//! Adapter calls are synchronous. Each attempt runs on tokio's blocking pool
//! and is raced against its deadline; when the deadline wins, the attempt is
//! classified `timeout` and abandoned. The blocking call may keep running in
//! the background; its eventual result is discarded.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::types::{
    AttemptContext, AttemptError, Execution, FailureKind, PolicyFailure, RetryContext,
    RetryPolicy, TerminalKind,
};
use crate::observability::{AnalyzerKind, MetricsSink, NoopMetrics, ResultLabel};

/// Executes adapter operations under a [`RetryPolicy`].
#[derive(Clone)]
pub struct PolicyEngine {
    metrics: Arc<dyn MetricsSink>,
}

impl PolicyEngine {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self { metrics }
    }

    pub fn without_metrics() -> Self {
        Self::new(Arc::new(NoopMetrics))
    }

    /// Run an adapter call until it succeeds or the policy says stop.
    ///
    /// `make_attempt` is called once per attempt with the attempt number and
    /// the previous failure kind, and returns the blocking operation to run.
    /// This is how callers send a tightened request after `invalid_output`
    /// without sharing mutable request state across attempts.
    pub async fn execute<T, F, Op>(
        &self,
        policy: &RetryPolicy,
        analyzer: AnalyzerKind,
        mut make_attempt: F,
    ) -> Execution<T>
    where
        T: Send + 'static,
        F: FnMut(AttemptContext) -> Op,
        Op: FnOnce() -> Result<T, AttemptError> + Send + 'static,
    {
        let started = Instant::now();
        let max_attempts = policy.max_attempts.max(1);
        let mut previous_failure: Option<FailureKind> = None;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let op = make_attempt(AttemptContext {
                attempt,
                previous_failure,
            });

            let attempt_started = Instant::now();
            let result = run_attempt(op, policy.per_attempt_timeout).await;
            let attempt_elapsed = attempt_started.elapsed();

            let context = RetryContext {
                attempts_used: attempt,
                max_attempts,
                elapsed: started.elapsed(),
            };

            let err = match result {
                Ok(value) => {
                    self.metrics
                        .record_attempt(analyzer, ResultLabel::Ok, attempt_elapsed);
                    self.metrics.record_outcome(analyzer, ResultLabel::Ok);
                    tracing::debug!(
                        analyzer = %analyzer,
                        attempts = attempt,
                        elapsed_ms = %context.elapsed.as_millis(),
                        "Adapter call succeeded"
                    );
                    return Execution {
                        result: Ok(value),
                        context,
                    };
                }
                Err(err) => err,
            };

            self.metrics
                .record_attempt(analyzer, err.kind.into(), attempt_elapsed);

            let terminal = if !policy.is_retryable(err.kind) {
                Some(TerminalKind::Failed(err.kind))
            } else if attempt >= max_attempts {
                Some(TerminalKind::RetriesExhausted { last: err.kind })
            } else {
                None
            };

            if let Some(kind) = terminal {
                self.metrics.record_outcome(analyzer, kind.into());
                tracing::warn!(
                    analyzer = %analyzer,
                    attempts = attempt,
                    max_attempts,
                    kind = %kind,
                    error = %err.message,
                    "Adapter call failed"
                );
                return Execution {
                    result: Err(PolicyFailure {
                        kind,
                        message: err.message,
                    }),
                    context,
                };
            }

            tracing::warn!(
                analyzer = %analyzer,
                attempt,
                max_attempts,
                kind = %err.kind,
                error = %err.message,
                "Adapter attempt failed, retrying"
            );
            previous_failure = Some(err.kind);

            let delay = policy.backoff.delay_after(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Run one blocking attempt against its deadline.
async fn run_attempt<T, Op>(op: Op, timeout: Duration) -> Result<T, AttemptError>
where
    T: Send + 'static,
    Op: FnOnce() -> Result<T, AttemptError> + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(op);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(AttemptError::fatal(format!(
            "adapter call panicked: {join_err}"
        ))),
        // Dropping the handle detaches the blocking call.
        Err(_) => Err(AttemptError::new(
            FailureKind::Timeout,
            format!("attempt exceeded {}ms deadline", timeout.as_millis()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::AtomicMetrics;
    use crate::pipeline::policy::Backoff;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let engine = PolicyEngine::without_metrics();
        let execution = engine
            .execute(&policy(3), AnalyzerKind::Vlm, |_| || Ok::<_, AttemptError>(42))
            .await;
        assert_eq!(execution.result.unwrap(), 42);
        assert_eq!(execution.context.attempts_used, 1);
        assert_eq!(execution.context.max_attempts, 3);
    }

    #[tokio::test]
    async fn always_invalid_output_exhausts_exactly_max_attempts() {
        let metrics = Arc::new(AtomicMetrics::new());
        let engine = PolicyEngine::new(metrics.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let execution = engine
            .execute(&policy(3), AnalyzerKind::Vlm, move |_| {
                let counter = Arc::clone(&counter);
                move || -> Result<(), AttemptError> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AttemptError::invalid_output("not json"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(execution.context.attempts_used, 3);
        let failure = execution.result.unwrap_err();
        assert_eq!(
            failure.kind,
            TerminalKind::RetriesExhausted {
                last: FailureKind::InvalidOutput
            }
        );
        assert_eq!(failure.message, "not json");

        assert_eq!(metrics.attempts(AnalyzerKind::Vlm, ResultLabel::InvalidOutput), 3);
        assert_eq!(
            metrics.outcomes(AnalyzerKind::Vlm, ResultLabel::RetriesExhausted),
            1
        );
    }

    #[tokio::test]
    async fn fatal_terminates_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let execution = PolicyEngine::without_metrics()
            .execute(&policy(5), AnalyzerKind::Document, move |_| {
                let counter = Arc::clone(&counter);
                move || -> Result<(), AttemptError> {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AttemptError::fatal("unsupported input"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            execution.result.unwrap_err().kind,
            TerminalKind::Failed(FailureKind::Fatal)
        );
    }

    #[tokio::test]
    async fn non_retryable_kind_terminates_without_exhaustion() {
        let explanation_policy = RetryPolicy::new(3, Duration::from_millis(200))
            .with_retryable([FailureKind::Timeout, FailureKind::InvalidOutput]);
        let execution = PolicyEngine::without_metrics()
            .execute(&explanation_policy, AnalyzerKind::Explainer, |_| {
                || -> Result<(), AttemptError> {
                    Err(AttemptError::new(FailureKind::TransientFailure, "connection refused"))
                }
            })
            .await;

        assert_eq!(execution.context.attempts_used, 1);
        assert_eq!(
            execution.result.unwrap_err().kind,
            TerminalKind::Failed(FailureKind::TransientFailure)
        );
    }

    #[tokio::test]
    async fn slow_attempt_is_abandoned_as_timeout() {
        let policy = RetryPolicy::new(2, Duration::from_millis(30));
        let started = Instant::now();
        let execution = PolicyEngine::without_metrics()
            .execute(&policy, AnalyzerKind::Document, |_| {
                || -> Result<(), AttemptError> {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(())
                }
            })
            .await;

        // Both attempts gave up at their deadline, long before the calls returned.
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(execution.context.attempts_used, 2);
        assert_eq!(
            execution.result.unwrap_err().kind,
            TerminalKind::RetriesExhausted {
                last: FailureKind::Timeout
            }
        );
    }

    #[tokio::test]
    async fn factory_sees_previous_failure() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let execution = PolicyEngine::without_metrics()
            .execute(&policy(3), AnalyzerKind::Vlm, move |ctx| {
                record.lock().unwrap().push(ctx);
                let tightened = ctx.follows_invalid_output();
                move || {
                    if tightened {
                        Ok("strict")
                    } else {
                        Err(AttemptError::invalid_output("prose instead of json"))
                    }
                }
            })
            .await;

        assert_eq!(execution.result.unwrap(), "strict");
        assert_eq!(execution.context.attempts_used, 2);
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], AttemptContext::first());
        assert_eq!(seen[1].attempt, 2);
        assert_eq!(seen[1].previous_failure, Some(FailureKind::InvalidOutput));
    }

    #[tokio::test]
    async fn panicking_adapter_is_fatal() {
        let execution = PolicyEngine::without_metrics()
            .execute(&policy(3), AnalyzerKind::Vision, |_| {
                || -> Result<(), AttemptError> { panic!("model crashed") }
            })
            .await;
        let failure = execution.result.unwrap_err();
        assert_eq!(failure.kind, TerminalKind::Failed(FailureKind::Fatal));
        assert!(failure.message.contains("panicked"));
    }

    #[tokio::test]
    async fn backoff_delays_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200)).with_backoff(Backoff::Fixed {
            delay: Duration::from_millis(20),
        });
        let started = Instant::now();
        let execution = PolicyEngine::without_metrics()
            .execute(&policy, AnalyzerKind::Explainer, |_| {
                || -> Result<(), AttemptError> {
                    Err(AttemptError::new(FailureKind::TransientFailure, "503"))
                }
            })
            .await;
        assert!(execution.result.is_err());
        // Two delays: after attempts 1 and 2, none after the last.
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
