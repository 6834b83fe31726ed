//! RMS normalization, plain and fused with a residual add.
//!
//! Reductions always run in f32 whatever the storage dtype; the scale and
//! the learned weight are applied in f32 and narrowed only on store.

use crate::dtype::Element;

/// Row-wise RMSNorm: `out[i] = x[i] / sqrt(mean(x^2) + eps) * weight[i]`.
pub fn rms_norm<T: Element>(
    out: &mut [T],
    input: &[T],
    weight: &[T],
    epsilon: f32,
    num_tokens: usize,
    hidden_size: usize,
) {
    if num_tokens == 0 || hidden_size == 0 {
        return;
    }
    let n = num_tokens * hidden_size;
    assert!(out.len() >= n && input.len() >= n, "rms_norm: buffer too small");
    assert!(weight.len() >= hidden_size, "rms_norm: weight shorter than hidden_size");

    #[cfg(target_arch = "aarch64")]
    if crate::caps::caps().has_neon {
        if let (Some(out_f), Some(in_f), Some(w_f)) = (
            T::as_f32_slice_mut(out),
            T::as_f32_slice(input),
            T::as_f32_slice(weight),
        ) {
            neon::rms_norm_f32(out_f, in_f, w_f, epsilon, num_tokens, hidden_size);
            return;
        }
        if T::DTYPE == DType::BF16 {
            if let (Some(out_b), Some(in_b), Some(w_b)) = (
                T::as_u16_slice_mut(out),
                T::as_u16_slice(input),
                T::as_u16_slice(weight),
            ) {
                neon::rms_norm_bf16(out_b, in_b, w_b, epsilon, num_tokens, hidden_size);
                return;
            }
        }
    }

    for row in 0..num_tokens {
        let off = row * hidden_size;
        let scale = inv_rms(&input[off..off + hidden_size], epsilon);
        for j in 0..hidden_size {
            let x = input[off + j].to_f32();
            out[off + j] = T::from_f32(x * scale * weight[j].to_f32());
        }
    }
}

/// In-place RMSNorm over `data`; used for the per-head Q/K norms where
/// the projection buffer is normalised where it stands.
pub fn rms_norm_inplace<T: Element>(
    data: &mut [T],
    weight: &[T],
    epsilon: f32,
    num_tokens: usize,
    hidden_size: usize,
) {
    if num_tokens == 0 || hidden_size == 0 {
        return;
    }
    let n = num_tokens * hidden_size;
    assert!(data.len() >= n, "rms_norm_inplace: buffer too small");
    assert!(weight.len() >= hidden_size, "rms_norm_inplace: weight shorter than hidden_size");

    for row in 0..num_tokens {
        let off = row * hidden_size;
        let scale = inv_rms(&data[off..off + hidden_size], epsilon);
        for j in 0..hidden_size {
            let x = data[off + j].to_f32();
            data[off + j] = T::from_f32(x * scale * weight[j].to_f32());
        }
    }
}

/// Fused residual add + RMSNorm: `residual += input` in place, then
/// `out = rms_norm(residual, weight)`. Halves memory traffic on the two
/// residual joins of every transformer layer.
pub fn fused_add_rms_norm<T: Element>(
    out: &mut [T],
    input: &[T],
    residual: &mut [T],
    weight: &[T],
    epsilon: f32,
    num_tokens: usize,
    hidden_size: usize,
) {
    if num_tokens == 0 || hidden_size == 0 {
        return;
    }
    let n = num_tokens * hidden_size;
    assert!(
        out.len() >= n && input.len() >= n && residual.len() >= n,
        "fused_add_rms_norm: buffer too small"
    );
    assert!(
        weight.len() >= hidden_size,
        "fused_add_rms_norm: weight shorter than hidden_size"
    );

    #[cfg(target_arch = "aarch64")]
    if crate::caps::caps().has_neon {
        if let (Some(out_f), Some(in_f), Some(res_f), Some(w_f)) = (
            T::as_f32_slice_mut(out),
            T::as_f32_slice(input),
            T::as_f32_slice_mut(residual),
            T::as_f32_slice(weight),
        ) {
            neon::fused_add_rms_norm_f32(out_f, in_f, res_f, w_f, epsilon, num_tokens, hidden_size);
            return;
        }
    }

    for row in 0..num_tokens {
        let off = row * hidden_size;
        let mut sum_sq = 0.0f32;
        for j in 0..hidden_size {
            let s = residual[off + j].to_f32() + input[off + j].to_f32();
            residual[off + j] = T::from_f32(s);
            sum_sq += s * s;
        }
        let scale = 1.0 / (sum_sq / hidden_size as f32 + epsilon).sqrt();
        for j in 0..hidden_size {
            let r = residual[off + j].to_f32();
            out[off + j] = T::from_f32(r * scale * weight[j].to_f32());
        }
    }
}

/// `1 / sqrt(mean(x^2) + eps)` with the reduction in f32.
fn inv_rms<T: Element>(row: &[T], epsilon: f32) -> f32 {
    let mut sum_sq = 0.0f32;
    for v in row {
        let x = v.to_f32();
        sum_sq += x * x;
    }
    1.0 / (sum_sq / row.len() as f32 + epsilon).sqrt()
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use std::arch::aarch64::*;

    use crate::convert::neon::{bf16x4_to_f32x4, f32x4_to_bf16x4};

    pub(super) fn rms_norm_f32(
        out: &mut [f32],
        input: &[f32],
        weight: &[f32],
        epsilon: f32,
        num_tokens: usize,
        hidden_size: usize,
    ) {
        let simd_len = hidden_size / 4;
        for row in 0..num_tokens {
            let off = row * hidden_size;
            let in_row = &input[off..off + hidden_size];

            // Pass 1: sum of squares.
            // SAFETY: all offsets below stay within in_row / out / weight,
            // bounded by simd_len * 4 <= hidden_size.
            let mut sum_sq = unsafe {
                let mut acc = vdupq_n_f32(0.0);
                let p = in_row.as_ptr();
                for j in 0..simd_len {
                    let v = vld1q_f32(p.add(j * 4));
                    acc = vfmaq_f32(acc, v, v);
                }
                vaddvq_f32(acc)
            };
            for j in simd_len * 4..hidden_size {
                sum_sq += in_row[j] * in_row[j];
            }

            let scale = 1.0 / (sum_sq / hidden_size as f32 + epsilon).sqrt();

            // Pass 2: scale and weight.
            unsafe {
                let p = in_row.as_ptr();
                let w = weight.as_ptr();
                let o = out.as_mut_ptr().add(off);
                let vscale = vdupq_n_f32(scale);
                for j in 0..simd_len {
                    let v = vmulq_f32(vld1q_f32(p.add(j * 4)), vscale);
                    vst1q_f32(o.add(j * 4), vmulq_f32(v, vld1q_f32(w.add(j * 4))));
                }
            }
            for j in simd_len * 4..hidden_size {
                out[off + j] = in_row[j] * scale * weight[j];
            }
        }
    }

    /// bf16 rows widen by the bit shift, reduce and scale in f32, and
    /// narrow on store with round half-to-even.
    pub(super) fn rms_norm_bf16(
        out: &mut [u16],
        input: &[u16],
        weight: &[u16],
        epsilon: f32,
        num_tokens: usize,
        hidden_size: usize,
    ) {
        let simd_len = hidden_size / 4;
        for row in 0..num_tokens {
            let off = row * hidden_size;
            let in_row = &input[off..off + hidden_size];

            // SAFETY: offsets bounded by simd_len * 4 <= hidden_size and
            // the asserts in the public entry.
            let mut sum_sq = unsafe {
                let mut acc = vdupq_n_f32(0.0);
                let p = in_row.as_ptr();
                for j in 0..simd_len {
                    let v = bf16x4_to_f32x4(p.add(j * 4));
                    acc = vfmaq_f32(acc, v, v);
                }
                vaddvq_f32(acc)
            };
            for j in simd_len * 4..hidden_size {
                let x = f32::from_bits((in_row[j] as u32) << 16);
                sum_sq += x * x;
            }

            let scale = 1.0 / (sum_sq / hidden_size as f32 + epsilon).sqrt();

            unsafe {
                let p = in_row.as_ptr();
                let w = weight.as_ptr();
                let o = out.as_mut_ptr().add(off);
                let vscale = vdupq_n_f32(scale);
                for j in 0..simd_len {
                    let v = vmulq_f32(bf16x4_to_f32x4(p.add(j * 4)), vscale);
                    f32x4_to_bf16x4(vmulq_f32(v, bf16x4_to_f32x4(w.add(j * 4))), o.add(j * 4));
                }
            }
            for j in simd_len * 4..hidden_size {
                let x = f32::from_bits((in_row[j] as u32) << 16);
                let w = f32::from_bits((weight[j] as u32) << 16);
                out[off + j] = crate::convert::f32_to_bf16(x * scale * w).to_bits();
            }
        }
    }

    pub(super) fn fused_add_rms_norm_f32(
        out: &mut [f32],
        input: &[f32],
        residual: &mut [f32],
        weight: &[f32],
        epsilon: f32,
        num_tokens: usize,
        hidden_size: usize,
    ) {
        let simd_len = hidden_size / 4;
        for row in 0..num_tokens {
            let off = row * hidden_size;

            // Pass 1: residual += input, accumulating the sum of squares
            // of the updated residual in the same sweep.
            // SAFETY: offsets bounded by simd_len * 4 <= hidden_size and
            // the asserts in the public entry.
            let mut sum_sq = unsafe {
                let mut acc = vdupq_n_f32(0.0);
                let ip = input.as_ptr().add(off);
                let rp = residual.as_mut_ptr().add(off);
                for j in 0..simd_len {
                    let s = vaddq_f32(vld1q_f32(rp.add(j * 4)), vld1q_f32(ip.add(j * 4)));
                    vst1q_f32(rp.add(j * 4), s);
                    acc = vfmaq_f32(acc, s, s);
                }
                vaddvq_f32(acc)
            };
            for j in simd_len * 4..hidden_size {
                let s = residual[off + j] + input[off + j];
                residual[off + j] = s;
                sum_sq += s * s;
            }

            let scale = 1.0 / (sum_sq / hidden_size as f32 + epsilon).sqrt();

            // Pass 2: normalise the updated residual into out.
            unsafe {
                let rp = residual.as_ptr().add(off);
                let w = weight.as_ptr();
                let o = out.as_mut_ptr().add(off);
                let vscale = vdupq_n_f32(scale);
                for j in 0..simd_len {
                    let v = vmulq_f32(vld1q_f32(rp.add(j * 4)), vscale);
                    vst1q_f32(o.add(j * 4), vmulq_f32(v, vld1q_f32(w.add(j * 4))));
                }
            }
            for j in simd_len * 4..hidden_size {
                out[off + j] = residual[off + j] * scale * weight[j];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use half::bf16;

    fn reference_rms_norm(input: &[f32], weight: &[f32], eps: f32) -> Vec<f32> {
        let mean_sq: f64 =
            input.iter().map(|&v| v as f64 * v as f64).sum::<f64>() / input.len() as f64;
        let scale = 1.0 / (mean_sq + eps as f64).sqrt();
        input
            .iter()
            .zip(weight.iter())
            .map(|(&x, &w)| (x as f64 * scale * w as f64) as f32)
            .collect()
    }

    #[test]
    fn test_rms_norm_matches_reference() {
        let input: Vec<f32> = (0..64).map(|i| (i as f32 * 0.37).sin() * 2.0).collect();
        let weight: Vec<f32> = (0..64).map(|i| 1.0 + i as f32 * 0.01).collect();
        let mut out = vec![0.0f32; 64];
        rms_norm(&mut out, &input, &weight, 1e-6, 1, 64);
        let want = reference_rms_norm(&input, &weight, 1e-6);
        for (g, w) in out.iter().zip(want.iter()) {
            assert_relative_eq!(g, w, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_rms_norm_scale_invariance() {
        // Doubling the input leaves the output unchanged up to eps drift.
        let input: Vec<f32> = (0..32).map(|i| (i as f32 - 16.0) * 0.25).collect();
        let doubled: Vec<f32> = input.iter().map(|v| v * 2.0).collect();
        let weight = vec![1.0f32; 32];
        let mut a = vec![0.0f32; 32];
        let mut b = vec![0.0f32; 32];
        rms_norm(&mut a, &input, &weight, 1e-6, 1, 32);
        rms_norm(&mut b, &doubled, &weight, 1e-6, 1, 32);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_relative_eq!(x, y, max_relative = 1e-4, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_fused_updates_residual_and_normalizes() {
        let input = vec![1.0f32, 2.0, 3.0, 4.0];
        let mut residual = vec![0.5f32, 0.5, 0.5, 0.5];
        let weight = vec![1.0f32; 4];
        let mut out = vec![0.0f32; 4];
        fused_add_rms_norm(&mut out, &input, &mut residual, &weight, 1e-6, 1, 4);

        let summed = vec![1.5f32, 2.5, 3.5, 4.5];
        assert_eq!(residual, summed);
        let want = reference_rms_norm(&summed, &weight, 1e-6);
        for (g, w) in out.iter().zip(want.iter()) {
            assert_relative_eq!(g, w, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_inplace_matches_out_of_place() {
        let input: Vec<f32> = (0..16).map(|i| i as f32 * 0.3 - 2.0).collect();
        let weight: Vec<f32> = (0..16).map(|i| 0.9 + i as f32 * 0.02).collect();
        let mut out = vec![0.0f32; 16];
        rms_norm(&mut out, &input, &weight, 1e-5, 1, 16);
        let mut data = input.clone();
        rms_norm_inplace(&mut data, &weight, 1e-5, 1, 16);
        for (a, b) in out.iter().zip(data.iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-6);
        }
    }

    #[test]
    fn test_bf16_within_mixed_precision_tolerance() {
        let input_f: Vec<f32> = (0..32).map(|i| (i as f32 * 0.11).cos()).collect();
        let weight_f = vec![1.0f32; 32];
        let input: Vec<bf16> = input_f.iter().map(|&v| bf16::from_f32(v)).collect();
        let weight: Vec<bf16> = weight_f.iter().map(|&v| bf16::from_f32(v)).collect();
        let mut out = vec![bf16::from_bits(0); 32];
        rms_norm(&mut out, &input, &weight, 1e-6, 1, 32);
        let want = reference_rms_norm(&input_f, &weight_f, 1e-6);
        for (g, w) in out.iter().zip(want.iter()) {
            let g = g.to_f32();
            assert!((g - w).abs() <= 0.05 + 0.05 * w.abs(), "bf16 norm: {g} vs {w}");
        }
    }
}
