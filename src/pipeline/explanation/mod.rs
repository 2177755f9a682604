//! Grounded natural-language explanation of a structured result.

pub mod types;
pub mod prompt;
pub mod parser;
pub mod invoker;
pub mod fallback;
pub mod ollama;
pub mod mock;

pub use types::*;
pub use invoker::*;
pub use fallback::{fallback_explanation, FallbackExplanation};
pub use ollama::OllamaExplainer;
pub use mock::{MockExplainer, MOCK_LLM_MODEL};
