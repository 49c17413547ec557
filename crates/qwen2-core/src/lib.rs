//! Qwen2 transformer inference engine.
//!
//! Loads a GGUF checkpoint via mmap, runs a single-token-at-a-time
//! forward pass with grouped-query attention and rotary position
//! embeddings, and samples the next token. See [`generate::Engine`] for
//! the entry point most callers want.

pub mod attention;
pub mod chatml;
pub mod error;
pub mod forward;
pub mod generate;
pub mod gguf;
pub mod kv_cache;
pub mod mmap;
pub mod model;
pub mod quant;
pub mod rope;
pub mod sampler;
pub mod simd;
pub mod tensor;
pub mod thread_pool;
pub mod tokenizer;

pub use error::{Error, Result};
pub use generate::Engine;
