use std::path::Path;

use crate::error::{ModelError, Result};
use crate::qwen3::Qwen3Model;

/// Model-family façade: one closed set of architectures behind a single
/// `load / reset_cache / forward / generate` surface, dispatched on the
/// family tag. Adding a family is a new variant plus one match arm in
/// each method.
#[derive(Debug)]
pub enum Model {
    Qwen3(Qwen3Model),
}

impl Model {
    /// Loads a model of the named family from a directory containing
    /// `config.json` and `model.safetensors`.
    pub fn load(family: &str, model_dir: &Path) -> Result<Model> {
        match family {
            "qwen3" => Ok(Model::Qwen3(Qwen3Model::load(model_dir)?)),
            other => Err(ModelError::UnsupportedArchitecture(other.to_string())),
        }
    }

    pub fn vocab_size(&self) -> usize {
        match self {
            Model::Qwen3(m) => m.config().vocab_size,
        }
    }

    pub fn eos_token_id(&self) -> i64 {
        match self {
            Model::Qwen3(m) => m.config().eos_token_id,
        }
    }

    pub fn reset_cache(&mut self) {
        match self {
            Model::Qwen3(m) => m.reset_cache(),
        }
    }

    /// Logits for the last token of `token_ids`.
    pub fn forward(&mut self, token_ids: &[i64]) -> Result<Vec<f32>> {
        match self {
            Model::Qwen3(m) => m.forward(token_ids),
        }
    }

    /// Autoregressive generation; see [`Qwen3Model::generate`].
    pub fn generate(
        &mut self,
        prompt_ids: &[i64],
        max_tokens: usize,
        temperature: f32,
        top_k: usize,
        top_p: f32,
        seed: u64,
    ) -> Result<Vec<i64>> {
        match self {
            Model::Qwen3(m) => m.generate(prompt_ids, max_tokens, temperature, top_k, top_p, seed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_family_rejected() {
        let err = Model::load("llama4", Path::new("/nonexistent")).unwrap_err();
        assert!(matches!(err, ModelError::UnsupportedArchitecture(f) if f == "llama4"));
    }
}
