use std::fs::File;
use std::path::Path;

use half::{bf16, f16};
use memmap2::Mmap;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::{debug, info};

use crate::config::Qwen3Config;
use crate::error::{ModelError, Result};

/// Weight tensors for a single transformer layer, all converted to f32
/// flat row-major vectors at load time.
#[derive(Debug)]
pub struct LayerWeights {
    /// `[num_attention_heads * head_dim, hidden_size]`
    pub q_proj: Vec<f32>,
    /// `[num_key_value_heads * head_dim, hidden_size]`
    pub k_proj: Vec<f32>,
    /// `[num_key_value_heads * head_dim, hidden_size]`
    pub v_proj: Vec<f32>,
    /// `[hidden_size, num_attention_heads * head_dim]`
    pub o_proj: Vec<f32>,
    /// Per-head RMSNorm weights for queries, length `head_dim`.
    pub q_norm: Vec<f32>,
    /// Per-head RMSNorm weights for keys, length `head_dim`.
    pub k_norm: Vec<f32>,
    /// `[intermediate_size, hidden_size]`
    pub gate_proj: Vec<f32>,
    /// `[intermediate_size, hidden_size]`
    pub up_proj: Vec<f32>,
    /// `[hidden_size, intermediate_size]`
    pub down_proj: Vec<f32>,
    /// Pre-attention RMSNorm weights, length `hidden_size`.
    pub attn_norm: Vec<f32>,
    /// Pre-FFN RMSNorm weights, length `hidden_size`.
    pub ffn_norm: Vec<f32>,
}

/// All weight tensors of the model. When `tie_word_embeddings` holds,
/// `lm_head` is `None` and the output projection reads the embedding
/// table, so there is one owner and nothing to double-free.
#[derive(Debug)]
pub struct ModelWeights {
    /// `[vocab_size, hidden_size]`
    pub embed_tokens: Vec<f32>,
    /// Final RMSNorm weights, length `hidden_size`.
    pub norm: Vec<f32>,
    lm_head: Option<Vec<f32>>,
    pub layers: Vec<LayerWeights>,
}

impl ModelWeights {
    /// Loads `model.safetensors` from the model directory, converting
    /// every tensor to f32 and cross-checking element counts against
    /// the configuration.
    pub fn load(model_dir: &Path, config: &Qwen3Config) -> Result<ModelWeights> {
        let path = model_dir.join("model.safetensors");
        let file = File::open(&path)?;
        // SAFETY: the mapping is read-only and lives for the duration of
        // this function; all reads go through the safetensors views.
        let mmap = unsafe { Mmap::map(&file)? };
        let st = SafeTensors::deserialize(&mmap)?;
        info!(path = %path.display(), tensors = st.len(), "loading weights");

        let hidden = config.hidden_size;
        let q_dim = config.q_dim();
        let kv_dim = config.kv_dim();

        let embed_tokens =
            load_tensor_f32(&st, "model.embed_tokens.weight", config.vocab_size * hidden)?;
        let norm = load_tensor_f32(&st, "model.norm.weight", hidden)?;

        let lm_head = if config.tie_word_embeddings {
            debug!("tie_word_embeddings: lm_head aliases the embedding table");
            None
        } else {
            Some(load_tensor_f32(&st, "lm_head.weight", config.vocab_size * hidden)?)
        };

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for l in 0..config.num_hidden_layers {
            let t = |suffix: &str| format!("model.layers.{l}.{suffix}");
            layers.push(LayerWeights {
                q_proj: load_tensor_f32(&st, &t("self_attn.q_proj.weight"), q_dim * hidden)?,
                k_proj: load_tensor_f32(&st, &t("self_attn.k_proj.weight"), kv_dim * hidden)?,
                v_proj: load_tensor_f32(&st, &t("self_attn.v_proj.weight"), kv_dim * hidden)?,
                o_proj: load_tensor_f32(&st, &t("self_attn.o_proj.weight"), hidden * q_dim)?,
                q_norm: load_tensor_f32(&st, &t("self_attn.q_norm.weight"), config.head_dim)?,
                k_norm: load_tensor_f32(&st, &t("self_attn.k_norm.weight"), config.head_dim)?,
                gate_proj: load_tensor_f32(
                    &st,
                    &t("mlp.gate_proj.weight"),
                    config.intermediate_size * hidden,
                )?,
                up_proj: load_tensor_f32(
                    &st,
                    &t("mlp.up_proj.weight"),
                    config.intermediate_size * hidden,
                )?,
                down_proj: load_tensor_f32(
                    &st,
                    &t("mlp.down_proj.weight"),
                    hidden * config.intermediate_size,
                )?,
                attn_norm: load_tensor_f32(&st, &t("input_layernorm.weight"), hidden)?,
                ffn_norm: load_tensor_f32(&st, &t("post_attention_layernorm.weight"), hidden)?,
            });
        }

        Ok(ModelWeights {
            embed_tokens,
            norm,
            lm_head,
            layers,
        })
    }

    /// Output projection weights: `lm_head.weight`, or the embedding
    /// table when embeddings are tied.
    pub fn lm_head(&self) -> &[f32] {
        self.lm_head.as_deref().unwrap_or(&self.embed_tokens)
    }
}

/// Reads one named tensor as f32, widening BF16/F16 sources.
fn load_tensor_f32(st: &SafeTensors, name: &str, expected_len: usize) -> Result<Vec<f32>> {
    let view = st
        .tensor(name)
        .map_err(|_| ModelError::WeightMissing(name.to_string()))?;

    let data = convert_view(&view, name)?;
    if data.len() != expected_len {
        return Err(ModelError::ShapeMismatch {
            tensor: name.to_string(),
            expected: expected_len,
            got: data.len(),
        });
    }
    Ok(data)
}

fn convert_view(view: &TensorView<'_>, name: &str) -> Result<Vec<f32>> {
    let bytes = view.data();
    match view.dtype() {
        Dtype::F32 => Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()),
        Dtype::BF16 => Ok(bytes
            .chunks_exact(2)
            .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect()),
        Dtype::F16 => Ok(bytes
            .chunks_exact(2)
            .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
            .collect()),
        other => Err(ModelError::DtypeUnsupported {
            tensor: name.to_string(),
            dtype: format!("{other:?}"),
        }),
    }
}
