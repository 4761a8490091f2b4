//! Provider-facing stages.
//!
//! Concrete recognizers, language models and synthesizers live outside this
//! crate; each is consumed through a trait and wrapped in a stage that handles
//! framing, retries and metrics.

pub mod llm;
pub mod retry;
pub mod stt;
pub mod tts;

pub use llm::{LanguageModel, LlmOptions, LlmProcessor, TokenStream};
pub use retry::RetryPolicy;
pub use stt::{Language, RecognizerEvent, SpeechRecognizer, SttProcessor, SttSettings};
pub use tts::{SpeechSynthesizer, TtsProcessor, TtsSettings};
