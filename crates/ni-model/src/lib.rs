//! `ni-model` - model loading and transformer composition for nanoinfer.
//!
//! This crate provides:
//! - `Qwen3Config` parsed from a model directory's `config.json`
//! - safetensors weight loading with load-time conversion to f32
//! - the per-layer KV cache and precomputed rotary cache
//! - the transformer layer and `Qwen3Model` forward/generate loop
//! - a `Model` façade dispatching on a model-family tag
//!
//! The tokenizer is an external collaborator: the API consumes and
//! produces token ids only.

pub mod config;
pub mod error;
pub mod kv_cache;
pub(crate) mod layer;
pub mod model;
pub mod qwen3;
pub mod weights;

pub use config::Qwen3Config;
pub use error::{ModelError, Result};
pub use kv_cache::{KvCache, LayerKvCache};
pub use model::Model;
pub use qwen3::Qwen3Model;
pub use weights::{LayerWeights, ModelWeights};
