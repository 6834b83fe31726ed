//! Rotary position embeddings: cos/sin cache precomputation and the two
//! pairing styles (NeoX half-split, GPT-J interleaved).
//!
//! Rotation arithmetic always runs in f32; storage narrowing is the only
//! source of error for 16-bit query/key buffers. Elements past `rot_dim`
//! within a head are left untouched (partial rotation).

use crate::dtype::Element;

/// How rotated element pairs are laid out within a head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RopeStyle {
    /// Pair `i` with `rot_dim/2 + i` (Llama/Qwen3).
    Neox,
    /// Pair `2i` with `2i + 1`.
    GptJ,
}

/// Fills `cache[pos * rot_dim ..]` with `[cos_0..cos_{half-1}, sin_0..sin_{half-1}]`
/// for every position, where `freq_i = base^(-2i / rot_dim)` and the
/// angle is `pos * freq_i`. Position 0 is exactly cosines = 1, sines = 0.
pub fn compute_cos_sin_cache(cache: &mut [f32], max_position: usize, rot_dim: usize, base: f32) {
    assert!(rot_dim % 2 == 0, "compute_cos_sin_cache: rot_dim must be even");
    assert!(
        cache.len() >= max_position * rot_dim,
        "compute_cos_sin_cache: cache smaller than [max_position, rot_dim]"
    );
    let half_dim = rot_dim / 2;
    for pos in 0..max_position {
        let row = &mut cache[pos * rot_dim..(pos + 1) * rot_dim];
        for i in 0..half_dim {
            let freq = 1.0 / base.powf(2.0 * i as f32 / rot_dim as f32);
            let angle = pos as f32 * freq;
            row[i] = angle.cos();
            row[half_dim + i] = angle.sin();
        }
    }
}

/// Applies rotary embeddings to every head of `query` and, when present,
/// every head of `key`, using per-token positions into the precomputed
/// cache. `query` is `[num_tokens, num_heads * head_size]`, `key` is
/// `[num_tokens, num_kv_heads * head_size]`.
#[allow(clippy::too_many_arguments)]
pub fn apply_rope<T: Element>(
    positions: &[i64],
    query: &mut [T],
    key: Option<&mut [T]>,
    cos_sin_cache: &[f32],
    num_heads: usize,
    num_kv_heads: usize,
    head_size: usize,
    rot_dim: usize,
    style: RopeStyle,
) {
    let num_tokens = positions.len();
    if num_tokens == 0 || num_heads == 0 || rot_dim == 0 {
        return;
    }
    assert!(rot_dim % 2 == 0 && rot_dim <= head_size, "apply_rope: invalid rot_dim");
    let query_stride = num_heads * head_size;
    assert!(query.len() >= num_tokens * query_stride, "apply_rope: query too small");

    let half_dim = rot_dim / 2;
    let key_stride = num_kv_heads * head_size;
    let mut key = key;
    if let Some(k) = key.as_deref() {
        assert!(k.len() >= num_tokens * key_stride, "apply_rope: key too small");
    }

    for (t, &pos) in positions.iter().enumerate() {
        let pos = pos.max(0) as usize;
        let cos = &cos_sin_cache[pos * rot_dim..pos * rot_dim + half_dim];
        let sin = &cos_sin_cache[pos * rot_dim + half_dim..(pos + 1) * rot_dim];

        for h in 0..num_heads {
            let off = t * query_stride + h * head_size;
            rotate_head(&mut query[off..off + head_size], cos, sin, style);
        }
        if let Some(k) = key.as_deref_mut() {
            for h in 0..num_kv_heads {
                let off = t * key_stride + h * head_size;
                rotate_head(&mut k[off..off + head_size], cos, sin, style);
            }
        }
    }
}

#[inline]
fn rotate_head<T: Element>(head: &mut [T], cos: &[f32], sin: &[f32], style: RopeStyle) {
    let half_dim = cos.len();

    #[cfg(target_arch = "aarch64")]
    if style == RopeStyle::Neox && crate::caps::caps().has_neon {
        if let Some(head_f) = T::as_f32_slice_mut(head) {
            neon::rotate_neox_f32(head_f, cos, sin);
            return;
        }
    }

    match style {
        RopeStyle::Neox => {
            for i in 0..half_dim {
                let x = head[i].to_f32();
                let y = head[half_dim + i].to_f32();
                let (c, s) = (cos[i], sin[i]);
                head[i] = T::from_f32(x * c - y * s);
                head[half_dim + i] = T::from_f32(y * c + x * s);
            }
        }
        RopeStyle::GptJ => {
            for i in 0..half_dim {
                let x = head[2 * i].to_f32();
                let y = head[2 * i + 1].to_f32();
                let (c, s) = (cos[i], sin[i]);
                head[2 * i] = T::from_f32(x * c - y * s);
                head[2 * i + 1] = T::from_f32(y * c + x * s);
            }
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use std::arch::aarch64::*;

    /// NeoX pairing vectorises directly: the x and y halves of a head
    /// are contiguous, so rotate four pairs per iteration.
    pub(super) fn rotate_neox_f32(head: &mut [f32], cos: &[f32], sin: &[f32]) {
        let half_dim = cos.len();
        let simd_len = half_dim / 4;
        let p = head.as_mut_ptr();

        for i in 0..simd_len {
            let off = i * 4;
            // SAFETY: off + 4 <= half_dim and half_dim + off + 4 <=
            // head.len(), per the rot_dim <= head_size contract.
            unsafe {
                let x = vld1q_f32(p.add(off));
                let y = vld1q_f32(p.add(half_dim + off));
                let c = vld1q_f32(cos.as_ptr().add(off));
                let s = vld1q_f32(sin.as_ptr().add(off));

                let x_new = vfmsq_f32(vmulq_f32(x, c), y, s);
                let y_new = vfmaq_f32(vmulq_f32(y, c), x, s);
                vst1q_f32(p.add(off), x_new);
                vst1q_f32(p.add(half_dim + off), y_new);
            }
        }

        for i in simd_len * 4..half_dim {
            let x = head[i];
            let y = head[half_dim + i];
            head[i] = x * cos[i] - y * sin[i];
            head[half_dim + i] = y * cos[i] + x * sin[i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cache_position_zero_is_identity() {
        let mut cache = vec![0.0f32; 10 * 32];
        compute_cos_sin_cache(&mut cache, 10, 32, 10000.0);
        for i in 0..16 {
            assert_eq!(cache[i], 1.0);
            assert_eq!(cache[16 + i], 0.0);
        }
    }

    #[test]
    fn test_cache_frequency_ladder() {
        let mut cache = vec![0.0f32; 4 * 8];
        compute_cos_sin_cache(&mut cache, 4, 8, 10000.0);
        // At pos=1, the first pair rotates by exactly 1 radian.
        assert_relative_eq!(cache[8], 1.0f32.cos(), max_relative = 1e-6);
        assert_relative_eq!(cache[8 + 4], 1.0f32.sin(), max_relative = 1e-6);
    }

    #[test]
    fn test_rotation_preserves_norm() {
        let mut cache = vec![0.0f32; 64 * 16];
        compute_cos_sin_cache(&mut cache, 64, 16, 10000.0);

        let mut q: Vec<f32> = (0..16).map(|i| (i as f32 * 0.7).sin()).collect();
        let norm_before: f32 = q.iter().map(|v| v * v).sum::<f32>().sqrt();
        apply_rope::<f32>(&[37], &mut q, None, &cache, 1, 1, 16, 16, RopeStyle::Neox);
        let norm_after: f32 = q.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert_relative_eq!(norm_before, norm_after, max_relative = 1e-5);
    }

    #[test]
    fn test_position_zero_is_noop() {
        let mut cache = vec![0.0f32; 4 * 8];
        compute_cos_sin_cache(&mut cache, 4, 8, 10000.0);
        let orig: Vec<f32> = (0..8).map(|i| i as f32 - 3.5).collect();
        let mut q = orig.clone();
        apply_rope::<f32>(&[0], &mut q, None, &cache, 1, 1, 8, 8, RopeStyle::Neox);
        assert_eq!(q, orig);
    }

    #[test]
    fn test_partial_rotation_leaves_tail() {
        let mut cache = vec![0.0f32; 8 * 4];
        compute_cos_sin_cache(&mut cache, 8, 4, 10000.0);
        let mut q: Vec<f32> = (0..8).map(|i| i as f32).collect();
        // head_size=8 but rot_dim=4: elements 4..8 must be untouched.
        apply_rope::<f32>(&[3], &mut q, None, &cache, 1, 1, 8, 4, RopeStyle::Neox);
        assert_eq!(&q[4..8], &[4.0, 5.0, 6.0, 7.0]);
        assert_ne!(&q[0..4], &[0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_key_rotated_alongside_query() {
        let mut cache = vec![0.0f32; 8 * 8];
        compute_cos_sin_cache(&mut cache, 8, 8, 10000.0);
        let init: Vec<f32> = (0..8).map(|i| (i as f32 * 0.3).cos()).collect();
        let mut q = init.clone();
        let mut k = init.clone();
        apply_rope::<f32>(&[5], &mut q, Some(&mut k), &cache, 1, 1, 8, 8, RopeStyle::Neox);
        // Same positions and head layout: identical rotation on both.
        assert_eq!(q, k);
        assert_ne!(q, init);
    }

    #[test]
    fn test_gptj_pairs_adjacent_elements() {
        let mut cache = vec![0.0f32; 4 * 4];
        compute_cos_sin_cache(&mut cache, 4, 4, 10000.0);
        let mut q = vec![1.0f32, 0.0, 0.0, 1.0];
        apply_rope::<f32>(&[1], &mut q, None, &cache, 1, 1, 4, 4, RopeStyle::GptJ);
        // First pair (1, 0) rotated by 1 radian.
        assert_relative_eq!(q[0], 1.0f32.cos(), max_relative = 1e-6);
        assert_relative_eq!(q[1], 1.0f32.sin(), max_relative = 1e-6);
    }
}
