use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

// ──────────────────────────────────────────────
// Failure classification
// ──────────────────────────────────────────────

/// Classified reason a single adapter attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The attempt exceeded its per-attempt deadline.
    Timeout,
    /// The adapter answered with data that breaks its own output contract.
    InvalidOutput,
    /// Network or model-service error.
    TransientFailure,
    /// Input or contract violation that retrying cannot fix.
    Fatal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::InvalidOutput => "invalid_output",
            FailureKind::TransientFailure => "transient_failure",
            FailureKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind reported once the engine stops trying.
///
/// `RetriesExhausted` is kept distinct from an immediate failure so logs and
/// metrics can tell "gave up after N tries" from "failed on the first fatal".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalKind {
    Failed(FailureKind),
    RetriesExhausted { last: FailureKind },
}

impl TerminalKind {
    /// The kind of the last failed attempt.
    pub fn underlying(&self) -> FailureKind {
        match self {
            TerminalKind::Failed(kind) => *kind,
            TerminalKind::RetriesExhausted { last } => *last,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, TerminalKind::RetriesExhausted { .. })
    }
}

impl fmt::Display for TerminalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalKind::Failed(kind) => write!(f, "{kind}"),
            TerminalKind::RetriesExhausted { last } => write!(f, "retries_exhausted({last})"),
        }
    }
}

impl Serialize for TerminalKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Failure of one attempt, already classified by the calling adapter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct AttemptError {
    pub kind: FailureKind,
    pub message: String,
}

impl AttemptError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_output(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidOutput, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }
}

/// Terminal failure of an adapter call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PolicyFailure {
    pub kind: TerminalKind,
    /// Message of the last failed attempt.
    pub message: String,
}

// ──────────────────────────────────────────────
// Policy
// ──────────────────────────────────────────────

/// Delay inserted between a failed attempt and the next one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    None,
    Fixed { delay: Duration },
    /// `step × attempt` (250ms, 500ms, 750ms… for a 250ms step).
    Linear { step: Duration },
    /// `base × 2^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the failed attempt numbered `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed { delay } => delay,
            Backoff::Linear { step } => step.saturating_mul(attempt),
            Backoff::Exponential { base, max } => {
                let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// Bounded-attempt execution policy for one adapter call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub per_attempt_timeout: Duration,
    pub retryable_kinds: BTreeSet<FailureKind>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Policy with the default retryable set and no backoff.
    /// `max_attempts` is raised to at least one.
    pub fn new(max_attempts: u32, per_attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            per_attempt_timeout,
            retryable_kinds: Self::default_retryable_kinds(),
            backoff: Backoff::None,
        }
    }

    /// `timeout`, `transient_failure` and `invalid_output`.
    pub fn default_retryable_kinds() -> BTreeSet<FailureKind> {
        [
            FailureKind::Timeout,
            FailureKind::TransientFailure,
            FailureKind::InvalidOutput,
        ]
        .into_iter()
        .collect()
    }

    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        // Fatal is never retried, whatever the caller asks for.
        self.retryable_kinds = kinds
            .into_iter()
            .filter(|k| *k != FailureKind::Fatal)
            .collect();
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        kind != FailureKind::Fatal && self.retryable_kinds.contains(&kind)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}

// ──────────────────────────────────────────────
// Per-call bookkeeping
// ──────────────────────────────────────────────

/// Attempt bookkeeping for one adapter call. Dropped with the call's result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RetryContext {
    pub attempts_used: u32,
    pub max_attempts: u32,
    pub elapsed: Duration,
}

/// What the operation factory knows when building attempt `attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptContext {
    /// 1-based attempt number.
    pub attempt: u32,
    pub previous_failure: Option<FailureKind>,
}

impl AttemptContext {
    pub fn first() -> Self {
        Self {
            attempt: 1,
            previous_failure: None,
        }
    }

    /// True when the previous attempt produced unusable output, which is
    /// when callers switch to a stricter variant of their request.
    pub fn follows_invalid_output(&self) -> bool {
        self.previous_failure == Some(FailureKind::InvalidOutput)
    }
}

/// Terminal result of an adapter call plus its attempt bookkeeping.
#[derive(Debug)]
pub struct Execution<T> {
    pub result: Result<T, PolicyFailure>,
    pub context: RetryContext,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retryable_kinds_exclude_fatal() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(FailureKind::Timeout));
        assert!(policy.is_retryable(FailureKind::TransientFailure));
        assert!(policy.is_retryable(FailureKind::InvalidOutput));
        assert!(!policy.is_retryable(FailureKind::Fatal));
    }

    #[test]
    fn fatal_cannot_be_made_retryable() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1))
            .with_retryable([FailureKind::Fatal, FailureKind::Timeout]);
        assert!(!policy.is_retryable(FailureKind::Fatal));
        assert!(policy.is_retryable(FailureKind::Timeout));
        assert_eq!(policy.retryable_kinds.len(), 1);
    }

    #[test]
    fn zero_attempts_raised_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::from_secs(1)).max_attempts, 1);
    }

    #[test]
    fn linear_backoff_grows_with_attempt() {
        let backoff = Backoff::Linear {
            step: Duration::from_millis(250),
        };
        assert_eq!(backoff.delay_after(1), Duration::from_millis(250));
        assert_eq!(backoff.delay_after(3), Duration::from_millis(750));
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(backoff.delay_after(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_after(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_after(4), Duration::from_millis(500));
        assert_eq!(backoff.delay_after(40), Duration::from_millis(500));
    }

    #[test]
    fn terminal_kind_display() {
        assert_eq!(TerminalKind::Failed(FailureKind::Fatal).to_string(), "fatal");
        let exhausted = TerminalKind::RetriesExhausted {
            last: FailureKind::InvalidOutput,
        };
        assert_eq!(exhausted.to_string(), "retries_exhausted(invalid_output)");
        assert_eq!(exhausted.underlying(), FailureKind::InvalidOutput);
        assert!(exhausted.is_exhausted());
    }

    #[test]
    fn terminal_kind_serializes_as_string() {
        let json = serde_json::to_string(&TerminalKind::RetriesExhausted {
            last: FailureKind::Timeout,
        })
        .unwrap();
        assert_eq!(json, "\"retries_exhausted(timeout)\"");
    }

    #[test]
    fn attempt_context_detects_invalid_output() {
        let ctx = AttemptContext {
            attempt: 2,
            previous_failure: Some(FailureKind::InvalidOutput),
        };
        assert!(ctx.follows_invalid_output());
        assert!(!AttemptContext::first().follows_invalid_output());
    }
}
