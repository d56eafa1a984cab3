// Honyaku Engine — Backend-A: local ONNX machine translation
//
// Tokenizer ↔ session ↔ greedy decode. Everything here is synchronous CPU
// work; the router moves it onto a blocking thread.

pub mod engine;
pub mod session;
pub mod tokenizer;

pub use engine::{LocalEngineOptions, LocalMtEngine, LOCAL_PROVIDER_ID};
pub use tokenizer::{SpecialToken, SubwordTokenizer};
