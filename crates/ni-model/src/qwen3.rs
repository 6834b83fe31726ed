use std::path::Path;

use ni_kernels::embedding::embedding_lookup;
use ni_kernels::gemm::gemm_f32;
use ni_kernels::norm::rms_norm_inplace;
use ni_kernels::rope::compute_cos_sin_cache;
use ni_sampler::{sample, SamplingRng};
use tracing::{debug, info};

use crate::config::Qwen3Config;
use crate::error::{ModelError, Result};
use crate::kv_cache::KvCache;
use crate::layer::{forward_layer, LayerScratch};
use crate::weights::ModelWeights;

/// A Qwen3-class decoder-only transformer with a persistent KV cache.
///
/// The model owns all weights, the caches, and the rotary table; kernels
/// only ever borrow them for the duration of a call. `forward` must not
/// be invoked from two threads at once (it takes `&mut self`).
#[derive(Debug)]
pub struct Qwen3Model {
    config: Qwen3Config,
    weights: ModelWeights,
    cache: KvCache,
    /// `[max_position_embeddings, head_dim]` as `[cos half | sin half]`.
    cos_sin_cache: Vec<f32>,
}

/// The two hidden-state buffers `forward` ping-pongs between. Owning
/// them in one place keeps the swap explicit and leaves nothing to free
/// conditionally.
struct ScratchBuffers {
    current: Vec<f32>,
    next: Vec<f32>,
}

impl ScratchBuffers {
    fn new(len: usize) -> Self {
        ScratchBuffers {
            current: vec![0.0; len],
            next: vec![0.0; len],
        }
    }

    fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.next);
    }
}

impl Qwen3Model {
    /// Loads config and weights from a model directory, allocates the
    /// KV cache sized by `max_position_embeddings`, and precomputes the
    /// rotary cos/sin table.
    pub fn load(model_dir: &Path) -> Result<Qwen3Model> {
        let config = Qwen3Config::load(model_dir)?;
        info!(
            hidden_size = config.hidden_size,
            layers = config.num_hidden_layers,
            heads = config.num_attention_heads,
            kv_heads = config.num_key_value_heads,
            vocab = config.vocab_size,
            "loaded model config"
        );

        let weights = ModelWeights::load(model_dir, &config)?;
        let cache = KvCache::new(
            config.num_hidden_layers,
            config.max_position_embeddings,
            config.kv_dim(),
        );

        let rot_dim = config.head_dim;
        let mut cos_sin_cache = vec![0.0f32; config.max_position_embeddings * rot_dim];
        compute_cos_sin_cache(
            &mut cos_sin_cache,
            config.max_position_embeddings,
            rot_dim,
            config.rope_theta,
        );

        Ok(Qwen3Model {
            config,
            weights,
            cache,
            cos_sin_cache,
        })
    }

    pub fn config(&self) -> &Qwen3Config {
        &self.config
    }

    /// Forgets all cached context; the next forward starts at position 0.
    pub fn reset_cache(&mut self) {
        self.cache.reset();
    }

    /// Runs the transformer over `token_ids`, appending to the KV cache,
    /// and returns the logits for the last token only.
    pub fn forward(&mut self, token_ids: &[i64]) -> Result<Vec<f32>> {
        if token_ids.is_empty() {
            return Err(ModelError::Other("no tokens to process".to_string()));
        }
        let seq = token_ids.len();
        let hidden = self.config.hidden_size;
        let vocab = self.config.vocab_size;

        let mut buffers = ScratchBuffers::new(seq * hidden);
        embedding_lookup(
            &mut buffers.current,
            token_ids,
            &self.weights.embed_tokens,
            vocab,
            hidden,
            None,
        );

        // Positions continue from the cached prefix and saturate at the
        // last rotary-table entry rather than faulting past it.
        let start_pos = self.cache.layers[0].len;
        let max_pos = self.config.max_position_embeddings - 1;
        let positions: Vec<i64> = (0..seq).map(|i| (start_pos + i).min(max_pos) as i64).collect();

        let mut scratch = LayerScratch::new(seq, &self.config);
        for (weights, cache) in self.weights.layers.iter().zip(self.cache.layers.iter_mut()) {
            forward_layer(
                &mut buffers.next,
                &buffers.current,
                weights,
                cache,
                &positions,
                &self.cos_sin_cache,
                &self.config,
                &mut scratch,
            );
            buffers.swap();
        }

        let final_hidden = &mut buffers.current;
        rms_norm_inplace(final_hidden, &self.weights.norm, self.config.rms_norm_eps, seq, hidden);

        // Project only the last token through the LM head.
        let last_row = &final_hidden[(seq - 1) * hidden..seq * hidden];
        let mut logits = vec![0.0f32; vocab];
        gemm_f32(last_row, self.weights.lm_head(), &mut logits, 1, vocab, hidden, false, true);
        Ok(logits)
    }

    /// Autoregressive generation: resets the cache, runs the prompt in
    /// one forward pass, then samples token by token until
    /// `eos_token_id` or `max_tokens`. The RNG seed is caller-supplied
    /// so identical calls reproduce identical continuations.
    pub fn generate(
        &mut self,
        prompt_ids: &[i64],
        max_tokens: usize,
        temperature: f32,
        top_k: usize,
        top_p: f32,
        seed: u64,
    ) -> Result<Vec<i64>> {
        if prompt_ids.is_empty() {
            return Err(ModelError::Other("empty prompt".to_string()));
        }
        self.reset_cache();

        let mut logits = self.forward(prompt_ids)?;
        let mut rng = SamplingRng::new(seed);
        let mut output = Vec::with_capacity(max_tokens);

        for step in 0..max_tokens {
            let token = sample(&logits, temperature, top_k, top_p, 0.0, &mut rng) as i64;
            output.push(token);

            if token == self.config.eos_token_id {
                debug!(step, "hit eos");
                break;
            }
            if step + 1 == max_tokens {
                break;
            }
            logits = self.forward(&[token])?;
        }

        debug!(generated = output.len(), "generation finished");
        Ok(output)
    }
}
