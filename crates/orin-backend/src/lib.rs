//! orin-backend: inference process backends for orin
//!
//! Currently a single backend that runs llama.cpp's `llama-cli` once per call
//! and streams its standard output.

pub mod llamacpp;
pub mod utf8;

pub use llamacpp::{LlamaCppBackend, LlamaCppConfig, ProbeReport};
pub use utf8::Utf8Decoder;
