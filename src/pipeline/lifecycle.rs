//! Per-request state machine.
//!
//! `Received → Perceiving → Perceived(..) → Explaining → Explained(..) → Composed`.
//! No state may be skipped; `Explaining` follows `Perceived(AllFailed)` like
//! any other perception result.

use std::fmt;

use thiserror::Error;

use super::aggregation::PerceptionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainedAs {
    Success,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    Perceiving,
    Perceived(PerceptionState),
    Explaining,
    Explained(ExplainedAs),
    Composed,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestState::Received => f.write_str("received"),
            RequestState::Perceiving => f.write_str("perceiving"),
            RequestState::Perceived(state) => write!(f, "perceived({})", state.as_str()),
            RequestState::Explaining => f.write_str("explaining"),
            RequestState::Explained(ExplainedAs::Success) => f.write_str("explained(success)"),
            RequestState::Explained(ExplainedAs::Fallback) => f.write_str("explained(fallback)"),
            RequestState::Composed => f.write_str("composed"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid request transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: RequestState,
    pub to: RequestState,
}

#[derive(Debug, Clone)]
pub struct RequestLifecycle {
    state: RequestState,
    history: Vec<RequestState>,
}

impl RequestLifecycle {
    pub fn new() -> Self {
        Self {
            state: RequestState::Received,
            history: vec![RequestState::Received],
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Every state entered so far, starting with `Received`.
    pub fn history(&self) -> &[RequestState] {
        &self.history
    }

    pub fn advance(&mut self, next: RequestState) -> Result<(), TransitionError> {
        use RequestState::*;
        let allowed = matches!(
            (self.state, next),
            (Received, Perceiving)
                | (Perceiving, Perceived(_))
                | (Perceived(_), Explaining)
                | (Explaining, Explained(_))
                | (Explained(_), Composed)
        );
        if !allowed {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(from = %self.state, to = %next, "Request state transition");
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state == RequestState::Composed
    }
}

impl Default for RequestLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
