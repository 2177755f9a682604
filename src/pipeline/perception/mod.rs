//! Perception: turning one image or page into a classified outcome.

pub mod types;
pub mod prompt;
pub mod parser;
pub mod invoker;
pub mod baseline;
pub mod ollama;
pub mod mock;

pub use types::*;
pub use invoker::*;
pub use baseline::{BaselineVisionAdapter, ImageClassifier};
pub use ollama::{OllamaDocumentAdapter, OllamaVlmAdapter};
pub use mock::{MockClassifier, MockDocumentAdapter, MockVlmAdapter};
