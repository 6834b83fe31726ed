//! One transformer layer: pre-norm attention with QK-norm, RoPE, and
//! KV-cached flash attention, followed by the SwiGLU FFN.

use ni_kernels::activation::{mul_inplace, silu_inplace};
use ni_kernels::attention::flash_attention_mha;
use ni_kernels::gemm::gemm_f32;
use ni_kernels::kv_cache::kv_cache_append;
use ni_kernels::norm::{fused_add_rms_norm, rms_norm, rms_norm_inplace};
use ni_kernels::rope::{apply_rope, RopeStyle};

use crate::config::Qwen3Config;
use crate::kv_cache::LayerKvCache;
use crate::weights::LayerWeights;

/// The per-head Q/K RMSNorm epsilon is fixed by the Qwen3 architecture,
/// independent of the model's `rms_norm_eps`.
const QK_NORM_EPS: f32 = 1e-6;

/// Per-forward scratch shared by every layer, sized for one sequence.
pub(crate) struct LayerScratch {
    /// `[seq, hidden]` normalised layer input, reused as the FFN input.
    normed: Vec<f32>,
    /// `[seq, hidden]` o_proj / down_proj output.
    proj: Vec<f32>,
    /// `[seq, q_dim]`
    q: Vec<f32>,
    /// `[seq, kv_dim]`
    k: Vec<f32>,
    /// `[seq, kv_dim]`
    v: Vec<f32>,
    /// `[seq, q_dim]` attention output before o_proj.
    attn: Vec<f32>,
    /// `[seq, intermediate]`
    gate: Vec<f32>,
    /// `[seq, intermediate]`
    up: Vec<f32>,
}

impl LayerScratch {
    pub(crate) fn new(seq_len: usize, config: &Qwen3Config) -> Self {
        LayerScratch {
            normed: vec![0.0; seq_len * config.hidden_size],
            proj: vec![0.0; seq_len * config.hidden_size],
            q: vec![0.0; seq_len * config.q_dim()],
            k: vec![0.0; seq_len * config.kv_dim()],
            v: vec![0.0; seq_len * config.kv_dim()],
            attn: vec![0.0; seq_len * config.q_dim()],
            gate: vec![0.0; seq_len * config.intermediate_size],
            up: vec![0.0; seq_len * config.intermediate_size],
        }
    }
}

/// Runs one layer over `input` (`[seq, hidden]`), writing the residual
/// stream into `out` and advancing the layer's KV cache by the appended
/// token count.
#[allow(clippy::too_many_arguments)]
pub(crate) fn forward_layer(
    out: &mut [f32],
    input: &[f32],
    weights: &LayerWeights,
    cache: &mut LayerKvCache,
    positions: &[i64],
    cos_sin_cache: &[f32],
    config: &Qwen3Config,
    scratch: &mut LayerScratch,
) {
    let seq = positions.len();
    let hidden = config.hidden_size;
    let head_dim = config.head_dim;
    let q_dim = config.q_dim();
    let kv_dim = config.kv_dim();

    // out carries the residual stream from here on.
    out[..seq * hidden].copy_from_slice(&input[..seq * hidden]);

    rms_norm(&mut scratch.normed, input, &weights.attn_norm, config.rms_norm_eps, seq, hidden);

    // Q/K/V projections; projection weights are stored [out_dim, in_dim].
    gemm_f32(&scratch.normed, &weights.q_proj, &mut scratch.q, seq, q_dim, hidden, false, true);
    gemm_f32(&scratch.normed, &weights.k_proj, &mut scratch.k, seq, kv_dim, hidden, false, true);
    gemm_f32(&scratch.normed, &weights.v_proj, &mut scratch.v, seq, kv_dim, hidden, false, true);

    // Qwen3 QK-norm: every query and key head row is RMS-normalised.
    for t in 0..seq {
        for h in 0..config.num_attention_heads {
            let off = t * q_dim + h * head_dim;
            rms_norm_inplace(&mut scratch.q[off..off + head_dim], &weights.q_norm, QK_NORM_EPS, 1, head_dim);
        }
        for h in 0..config.num_key_value_heads {
            let off = t * kv_dim + h * head_dim;
            rms_norm_inplace(&mut scratch.k[off..off + head_dim], &weights.k_norm, QK_NORM_EPS, 1, head_dim);
        }
    }

    apply_rope(
        positions,
        &mut scratch.q,
        Some(&mut scratch.k),
        cos_sin_cache,
        config.num_attention_heads,
        config.num_key_value_heads,
        head_dim,
        head_dim,
        RopeStyle::Neox,
    );

    let appended = kv_cache_append(
        &mut cache.key,
        &mut cache.value,
        &scratch.k,
        &scratch.v,
        cache.len,
        seq,
        config.num_key_value_heads,
        head_dim,
    );
    let total_seq_len = cache.len + appended;
    cache.len = total_seq_len;

    // Causal attention of each query token against the cached prefix.
    // Truncating seq_kv at the token's absolute position is the implicit
    // causal mask, so the kernel runs mask-free.
    let scale = 1.0 / (head_dim as f32).sqrt();
    for (i, &abs_pos) in positions.iter().enumerate() {
        let kv_len = (abs_pos.max(0) as usize).min(total_seq_len.saturating_sub(1)) + 1;
        flash_attention_mha(
            &mut scratch.attn[i * q_dim..(i + 1) * q_dim],
            &scratch.q[i * q_dim..(i + 1) * q_dim],
            &cache.key[..kv_len * kv_dim],
            &cache.value[..kv_len * kv_dim],
            1,
            config.num_attention_heads,
            config.num_key_value_heads,
            1,
            kv_len,
            head_dim,
            scale,
            None,
        );
    }

    gemm_f32(&scratch.attn, &weights.o_proj, &mut scratch.proj, seq, hidden, q_dim, false, true);

    // Fused join: residual += attention output, then pre-FFN norm.
    fused_add_rms_norm(
        &mut scratch.normed,
        &scratch.proj,
        out,
        &weights.ffn_norm,
        config.rms_norm_eps,
        seq,
        hidden,
    );

    // SwiGLU with independent gate/up projections:
    // down(silu(gate(x)) * up(x)).
    let inter = config.intermediate_size;
    gemm_f32(&scratch.normed, &weights.gate_proj, &mut scratch.gate, seq, inter, hidden, false, true);
    gemm_f32(&scratch.normed, &weights.up_proj, &mut scratch.up, seq, inter, hidden, false, true);
    silu_inplace(&mut scratch.gate, seq, inter);
    mul_inplace(&mut scratch.gate[..seq * inter], &scratch.up[..seq * inter]);
    gemm_f32(&scratch.gate, &weights.down_proj, &mut scratch.proj, seq, hidden, inter, false, true);

    for i in 0..seq * hidden {
        out[i] += scratch.proj[i];
    }
}
