//! Online-softmax ("flash") attention.
//!
//! Numerically equivalent to `softmax(scale * Q K^T + mask) V`, computed
//! in a single streaming pass over the keys: a running row maximum `m`
//! and partial sum `s` are maintained, and the output accumulator is
//! rescaled by `exp(m_old - m_new)` whenever a new maximum appears, so
//! the full score matrix is never materialised.

/// Single-head attention.
///
/// - `q`: `[seq_q, head_dim]`, `k`/`v`: `[seq_kv, head_dim]`
/// - `out`: `[seq_q, head_dim]`
/// - `mask`: optional `[seq_q, seq_kv]` additive bias; callers pass
///   `f32::NEG_INFINITY` at causally masked positions
#[allow(clippy::too_many_arguments)]
pub fn flash_attention(
    out: &mut [f32],
    q: &[f32],
    k: &[f32],
    v: &[f32],
    seq_q: usize,
    seq_kv: usize,
    head_dim: usize,
    scale: f32,
    mask: Option<&[f32]>,
) {
    if seq_q == 0 || seq_kv == 0 || head_dim == 0 {
        return;
    }
    assert!(q.len() >= seq_q * head_dim, "flash_attention: q too small");
    assert!(
        k.len() >= seq_kv * head_dim && v.len() >= seq_kv * head_dim,
        "flash_attention: k/v too small"
    );
    assert!(out.len() >= seq_q * head_dim, "flash_attention: out too small");
    if let Some(m) = mask {
        assert!(m.len() >= seq_q * seq_kv, "flash_attention: mask too small");
    }

    for i in 0..seq_q {
        let q_row = &q[i * head_dim..(i + 1) * head_dim];
        let out_row = &mut out[i * head_dim..(i + 1) * head_dim];
        attend_row(out_row, q_row, k, v, seq_kv, head_dim, head_dim, scale, |pos| {
            mask.map_or(0.0, |m| m[i * seq_kv + pos])
        });
    }
}

/// Multi-head attention with batching and grouped-query support.
///
/// Layouts (row-major): `q`/`out` are `[batch, seq_q, num_heads, head_dim]`,
/// `k`/`v` are `[batch, seq_kv, num_kv_heads, head_dim]`. Query head `h`
/// attends through KV head `h / (num_heads / num_kv_heads)`. The optional
/// mask is `[seq_q, seq_kv]`, shared across batch entries and heads.
#[allow(clippy::too_many_arguments)]
pub fn flash_attention_mha(
    out: &mut [f32],
    q: &[f32],
    k: &[f32],
    v: &[f32],
    batch: usize,
    num_heads: usize,
    num_kv_heads: usize,
    seq_q: usize,
    seq_kv: usize,
    head_dim: usize,
    scale: f32,
    mask: Option<&[f32]>,
) {
    if batch == 0 || seq_q == 0 || seq_kv == 0 || num_heads == 0 || head_dim == 0 {
        return;
    }
    assert!(num_kv_heads > 0 && num_heads % num_kv_heads == 0, "flash_attention_mha: num_heads must be a multiple of num_kv_heads");
    let q_stride = num_heads * head_dim;
    let kv_stride = num_kv_heads * head_dim;
    assert!(q.len() >= batch * seq_q * q_stride, "flash_attention_mha: q too small");
    assert!(
        k.len() >= batch * seq_kv * kv_stride && v.len() >= batch * seq_kv * kv_stride,
        "flash_attention_mha: k/v too small"
    );
    assert!(out.len() >= batch * seq_q * q_stride, "flash_attention_mha: out too small");
    if let Some(m) = mask {
        assert!(m.len() >= seq_q * seq_kv, "flash_attention_mha: mask too small");
    }

    let heads_per_kv = num_heads / num_kv_heads;

    for b in 0..batch {
        let q_base = b * seq_q * q_stride;
        let kv_base = b * seq_kv * kv_stride;
        for i in 0..seq_q {
            for h in 0..num_heads {
                let kv_h = h / heads_per_kv;
                let q_off = q_base + i * q_stride + h * head_dim;
                let q_row = &q[q_off..q_off + head_dim];
                let k_head = &k[kv_base + kv_h * head_dim..];
                let v_head = &v[kv_base + kv_h * head_dim..];
                let out_row = {
                    let off = q_base + i * q_stride + h * head_dim;
                    &mut out[off..off + head_dim]
                };
                attend_row(out_row, q_row, k_head, v_head, seq_kv, head_dim, kv_stride, scale, |pos| {
                    mask.map_or(0.0, |m| m[i * seq_kv + pos])
                });
            }
        }
    }
}

/// One query row against `seq_kv` keys/values strided by `kv_stride`.
#[allow(clippy::too_many_arguments)]
#[inline]
fn attend_row(
    out_row: &mut [f32],
    q_row: &[f32],
    k: &[f32],
    v: &[f32],
    seq_kv: usize,
    head_dim: usize,
    kv_stride: usize,
    scale: f32,
    mask_at: impl Fn(usize) -> f32,
) {
    out_row.fill(0.0);
    let mut m = f32::NEG_INFINITY;
    let mut s = 0.0f32;

    for pos in 0..seq_kv {
        let k_row = &k[pos * kv_stride..pos * kv_stride + head_dim];
        let v_row = &v[pos * kv_stride..pos * kv_stride + head_dim];

        let bias = mask_at(pos);
        if bias == f32::NEG_INFINITY {
            continue;
        }
        let mut score = 0.0f32;
        for d in 0..head_dim {
            score += q_row[d] * k_row[d];
        }
        score = score * scale + bias;

        let m_new = m.max(score);
        let alpha = (m - m_new).exp();
        let w = (score - m_new).exp();
        for d in 0..head_dim {
            out_row[d] = out_row[d] * alpha + v_row[d] * w;
        }
        s = s * alpha + w;
        m = m_new;
    }

    if s > 0.0 {
        let inv = 1.0 / s;
        for d in out_row.iter_mut() {
            *d *= inv;
        }
    }
}
