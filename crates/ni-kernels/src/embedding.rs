//! Embedding table lookup.

use crate::dtype::Element;

/// Gathers embedding rows for a batch of token ids.
///
/// - `out`: `[num_tokens, dim]` destination
/// - `token_ids`: `num_tokens` ids; out-of-range ids are clamped to
///   `[0, vocab_size)` rather than faulting
/// - `weight`: `[vocab_size, dim]` embedding table
/// - `padding_idx`: ids equal to this value produce a zero row
pub fn embedding_lookup<T: Element>(
    out: &mut [T],
    token_ids: &[i64],
    weight: &[T],
    vocab_size: usize,
    dim: usize,
    padding_idx: Option<i64>,
) {
    let num_tokens = token_ids.len();
    if num_tokens == 0 || vocab_size == 0 || dim == 0 {
        return;
    }
    assert!(out.len() >= num_tokens * dim, "embedding_lookup: out too small");
    assert!(
        weight.len() >= vocab_size * dim,
        "embedding_lookup: weight smaller than [vocab_size, dim]"
    );

    #[cfg(target_arch = "aarch64")]
    if crate::caps::caps().has_neon {
        if let (Some(out_f), Some(weight_f)) = (T::as_f32_slice_mut(out), T::as_f32_slice(weight)) {
            neon::lookup_f32(out_f, token_ids, weight_f, vocab_size, dim, padding_idx);
            return;
        }
        if let (Some(out_b), Some(weight_b)) = (T::as_u16_slice_mut(out), T::as_u16_slice(weight)) {
            neon::lookup_u16(out_b, token_ids, weight_b, vocab_size, dim, padding_idx);
            return;
        }
    }

    for (i, &id) in token_ids.iter().enumerate() {
        let out_row = &mut out[i * dim..(i + 1) * dim];
        if padding_idx == Some(id) {
            out_row.fill(T::ZERO);
        } else {
            let id = (id.max(0) as usize).min(vocab_size - 1);
            out_row.copy_from_slice(&weight[id * dim..id * dim + dim]);
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use std::arch::aarch64::*;

    pub(super) fn lookup_f32(
        out: &mut [f32],
        token_ids: &[i64],
        weight: &[f32],
        vocab_size: usize,
        dim: usize,
        padding_idx: Option<i64>,
    ) {
        for (i, &id) in token_ids.iter().enumerate() {
            let out_row = &mut out[i * dim..(i + 1) * dim];
            if padding_idx == Some(id) {
                out_row.fill(0.0);
                continue;
            }
            let id = (id.max(0) as usize).min(vocab_size - 1);
            let src = &weight[id * dim..id * dim + dim];

            let simd_len = dim / 4;
            let src_ptr = src.as_ptr();
            let dst_ptr = out_row.as_mut_ptr();
            for j in 0..simd_len {
                // SAFETY: j * 4 + 4 <= dim for both row slices.
                unsafe {
                    vst1q_f32(dst_ptr.add(j * 4), vld1q_f32(src_ptr.add(j * 4)));
                }
            }
            for j in simd_len * 4..dim {
                out_row[j] = src[j];
            }
        }
    }

    /// 16-bit rows (bf16 or f16, the copy is dtype-blind) move 8 lanes
    /// per vector.
    pub(super) fn lookup_u16(
        out: &mut [u16],
        token_ids: &[i64],
        weight: &[u16],
        vocab_size: usize,
        dim: usize,
        padding_idx: Option<i64>,
    ) {
        for (i, &id) in token_ids.iter().enumerate() {
            let out_row = &mut out[i * dim..(i + 1) * dim];
            if padding_idx == Some(id) {
                out_row.fill(0);
                continue;
            }
            let id = (id.max(0) as usize).min(vocab_size - 1);
            let src = &weight[id * dim..id * dim + dim];

            let simd_len = dim / 8;
            let src_ptr = src.as_ptr();
            let dst_ptr = out_row.as_mut_ptr();
            for j in 0..simd_len {
                // SAFETY: j * 8 + 8 <= dim for both row slices.
                unsafe {
                    vst1q_u16(dst_ptr.add(j * 8), vld1q_u16(src_ptr.add(j * 8)));
                }
            }
            for j in simd_len * 8..dim {
                out_row[j] = src[j];
            }
        }
    }
}
