use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ModelError, Result};

fn default_rope_theta() -> f32 {
    10000.0
}

fn default_rms_norm_eps() -> f32 {
    1e-6
}

fn default_hidden_act() -> String {
    "silu".to_string()
}

fn default_tie_word_embeddings() -> bool {
    true
}

/// Shape and hyper-parameters of a Qwen3-class decoder-only transformer,
/// parsed once from `config.json` and immutable thereafter. Keys absent
/// from the file take HF-convention defaults; unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct Qwen3Config {
    pub hidden_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    /// Defaults to `hidden_size / num_attention_heads` when absent.
    #[serde(default)]
    pub head_dim: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
    #[serde(default)]
    pub attention_bias: bool,
    #[serde(default)]
    pub bos_token_id: i64,
    #[serde(default)]
    pub eos_token_id: i64,
    #[serde(default = "default_tie_word_embeddings")]
    pub tie_word_embeddings: bool,
}

impl Qwen3Config {
    /// Reads and validates `config.json` from a model directory.
    pub fn load(model_dir: &Path) -> Result<Qwen3Config> {
        let path = model_dir.join("config.json");
        let data = fs::read_to_string(&path)?;
        let mut config: Qwen3Config = serde_json::from_str(&data)?;

        if config.head_dim == 0 && config.num_attention_heads > 0 {
            config.head_dim = config.hidden_size / config.num_attention_heads;
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("hidden_size", self.hidden_size),
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.num_key_value_heads),
            ("num_hidden_layers", self.num_hidden_layers),
            ("intermediate_size", self.intermediate_size),
            ("vocab_size", self.vocab_size),
            ("max_position_embeddings", self.max_position_embeddings),
            ("head_dim", self.head_dim),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ModelError::ConfigInvalid(format!("{name} must be positive")));
            }
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(ModelError::ConfigInvalid(format!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(ModelError::ConfigInvalid(format!(
                "head_dim ({}) must be even for rotary embeddings",
                self.head_dim
            )));
        }
        Ok(())
    }

    /// Query projection width: `num_attention_heads * head_dim`.
    pub fn q_dim(&self) -> usize {
        self.num_attention_heads * self.head_dim
    }

    /// Key/value projection width: `num_key_value_heads * head_dim`.
    pub fn kv_dim(&self) -> usize {
        self.num_key_value_heads * self.head_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &Path, json: &str) {
        let mut f = fs::File::create(dir.join("config.json")).unwrap();
        f.write_all(json.as_bytes()).unwrap();
    }

    const MINIMAL: &str = r#"{
        "hidden_size": 64,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "num_hidden_layers": 2,
        "intermediate_size": 128,
        "vocab_size": 100,
        "max_position_embeddings": 512
    }"#;

    #[test]
    fn test_defaults_applied() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), MINIMAL);
        let cfg = Qwen3Config::load(dir.path()).unwrap();
        assert_eq!(cfg.head_dim, 16);
        assert_eq!(cfg.rope_theta, 10000.0);
        assert_eq!(cfg.rms_norm_eps, 1e-6);
        assert_eq!(cfg.hidden_act, "silu");
        assert!(cfg.tie_word_embeddings);
        assert_eq!(cfg.q_dim(), 64);
        assert_eq!(cfg.kv_dim(), 32);
    }

    #[test]
    fn test_explicit_head_dim_kept() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            &MINIMAL.replace("\"hidden_size\": 64", "\"hidden_size\": 64, \"head_dim\": 32"),
        );
        let cfg = Qwen3Config::load(dir.path()).unwrap();
        assert_eq!(cfg.head_dim, 32);
    }

    #[test]
    fn test_missing_required_field_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), r#"{"hidden_size": 64}"#);
        assert!(matches!(
            Qwen3Config::load(dir.path()),
            Err(ModelError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_head_ratio_validated() {
        let dir = tempfile::tempdir().unwrap();
        write_config(
            dir.path(),
            &MINIMAL.replace("\"num_key_value_heads\": 2", "\"num_key_value_heads\": 3"),
        );
        assert!(matches!(
            Qwen3Config::load(dir.path()),
            Err(ModelError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_zero_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), &MINIMAL.replace("\"vocab_size\": 100", "\"vocab_size\": 0"));
        assert!(matches!(
            Qwen3Config::load(dir.path()),
            Err(ModelError::ConfigInvalid(_))
        ));
    }
}
