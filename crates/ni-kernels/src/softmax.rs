//! Row-wise softmax with the max-shift / exponentiate / divide three-pass
//! scheme. A scaled variant folds an attention `1/sqrt(d)` factor into
//! the shift, and the in-place form exists because attention probability
//! buffers are normalised where they stand.

use crate::dtype::Element;

/// `out[r, i] = exp(in[r, i] - max_r) / sum_j exp(in[r, j] - max_r)`.
pub fn softmax<T: Element>(out: &mut [T], input: &[T], num_rows: usize, row_size: usize) {
    softmax_scaled(out, input, num_rows, row_size, 1.0);
}

/// Softmax of `scale * input`, applied before the stabilising shift.
pub fn softmax_scaled<T: Element>(
    out: &mut [T],
    input: &[T],
    num_rows: usize,
    row_size: usize,
    scale: f32,
) {
    if num_rows == 0 || row_size == 0 {
        return;
    }
    let n = num_rows * row_size;
    assert!(out.len() >= n && input.len() >= n, "softmax: buffer too small");

    #[cfg(target_arch = "aarch64")]
    if crate::caps::caps().has_neon {
        if let (Some(out_f), Some(in_f)) = (T::as_f32_slice_mut(out), T::as_f32_slice(input)) {
            neon::softmax_scaled_f32(out_f, in_f, num_rows, row_size, scale);
            return;
        }
        if T::DTYPE == DType::BF16 {
            if let (Some(out_b), Some(in_b)) = (T::as_u16_slice_mut(out), T::as_u16_slice(input)) {
                neon::softmax_scaled_bf16(out_b, in_b, num_rows, row_size, scale);
                return;
            }
        }
    }

    for r in 0..num_rows {
        let off = r * row_size;
        let mut max = f32::NEG_INFINITY;
        for i in 0..row_size {
            max = max.max(input[off + i].to_f32() * scale);
        }
        let mut sum = 0.0f32;
        for i in 0..row_size {
            let e = (input[off + i].to_f32() * scale - max).exp();
            out[off + i] = T::from_f32(e);
            sum += e;
        }
        let inv = 1.0 / sum;
        for i in 0..row_size {
            out[off + i] = T::from_f32(out[off + i].to_f32() * inv);
        }
    }
}

/// In-place softmax; the Rust spelling of the `out == in` overlap the
/// operator contract permits.
pub fn softmax_inplace<T: Element>(data: &mut [T], num_rows: usize, row_size: usize) {
    if num_rows == 0 || row_size == 0 {
        return;
    }
    let n = num_rows * row_size;
    assert!(data.len() >= n, "softmax_inplace: buffer too small");

    for r in 0..num_rows {
        let off = r * row_size;
        let mut max = f32::NEG_INFINITY;
        for i in 0..row_size {
            max = max.max(data[off + i].to_f32());
        }
        let mut sum = 0.0f32;
        for i in 0..row_size {
            let e = (data[off + i].to_f32() - max).exp();
            data[off + i] = T::from_f32(e);
            sum += e;
        }
        let inv = 1.0 / sum;
        for i in 0..row_size {
            data[off + i] = T::from_f32(data[off + i].to_f32() * inv);
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use std::arch::aarch64::*;

    use crate::convert::neon::{bf16x4_to_f32x4, f32x4_to_bf16x4};
    use crate::mathfun::fast_exp_f32x4;

    pub(super) fn softmax_scaled_f32(
        out: &mut [f32],
        input: &[f32],
        num_rows: usize,
        row_size: usize,
        scale: f32,
    ) {
        let simd_len = row_size / 4;
        for r in 0..num_rows {
            let off = r * row_size;
            let in_row = &input[off..off + row_size];

            // Pass 1: scaled row maximum.
            // SAFETY: offsets bounded by simd_len * 4 <= row_size.
            let mut max = unsafe {
                let vscale = vdupq_n_f32(scale);
                let mut vmax = vdupq_n_f32(f32::NEG_INFINITY);
                let p = in_row.as_ptr();
                for i in 0..simd_len {
                    vmax = vmaxq_f32(vmax, vmulq_f32(vld1q_f32(p.add(i * 4)), vscale));
                }
                vmaxvq_f32(vmax)
            };
            for i in simd_len * 4..row_size {
                max = max.max(in_row[i] * scale);
            }

            // Pass 2: exponentials and their sum.
            let mut sum = unsafe {
                let vscale = vdupq_n_f32(scale);
                let vmax = vdupq_n_f32(max);
                let mut vsum = vdupq_n_f32(0.0);
                let p = in_row.as_ptr();
                let o = out.as_mut_ptr().add(off);
                for i in 0..simd_len {
                    let shifted = vsubq_f32(vmulq_f32(vld1q_f32(p.add(i * 4)), vscale), vmax);
                    let e = fast_exp_f32x4(shifted);
                    vst1q_f32(o.add(i * 4), e);
                    vsum = vaddq_f32(vsum, e);
                }
                vaddvq_f32(vsum)
            };
            for i in simd_len * 4..row_size {
                let e = (in_row[i] * scale - max).exp();
                out[off + i] = e;
                sum += e;
            }

            // Pass 3: divide.
            let inv = 1.0 / sum;
            unsafe {
                let vinv = vdupq_n_f32(inv);
                let o = out.as_mut_ptr().add(off);
                for i in 0..simd_len {
                    vst1q_f32(o.add(i * 4), vmulq_f32(vld1q_f32(o.add(i * 4)), vinv));
                }
            }
            for i in simd_len * 4..row_size {
                out[off + i] *= inv;
            }
        }
    }

    /// bf16 rows widen by the bit shift; the exponentials park in `out`
    /// as bf16 between passes 2 and 3, and the f32 sum keeps the divide
    /// well inside the mixed-precision tolerance.
    pub(super) fn softmax_scaled_bf16(
        out: &mut [u16],
        input: &[u16],
        num_rows: usize,
        row_size: usize,
        scale: f32,
    ) {
        let simd_len = row_size / 4;
        for r in 0..num_rows {
            let off = r * row_size;
            let in_row = &input[off..off + row_size];

            // SAFETY: offsets bounded by simd_len * 4 <= row_size.
            let mut max = unsafe {
                let vscale = vdupq_n_f32(scale);
                let mut vmax = vdupq_n_f32(f32::NEG_INFINITY);
                let p = in_row.as_ptr();
                for i in 0..simd_len {
                    vmax = vmaxq_f32(vmax, vmulq_f32(bf16x4_to_f32x4(p.add(i * 4)), vscale));
                }
                vmaxvq_f32(vmax)
            };
            for i in simd_len * 4..row_size {
                max = max.max(f32::from_bits((in_row[i] as u32) << 16) * scale);
            }

            let mut sum = unsafe {
                let vscale = vdupq_n_f32(scale);
                let vmax = vdupq_n_f32(max);
                let mut vsum = vdupq_n_f32(0.0);
                let p = in_row.as_ptr();
                let o = out.as_mut_ptr().add(off);
                for i in 0..simd_len {
                    let shifted =
                        vsubq_f32(vmulq_f32(bf16x4_to_f32x4(p.add(i * 4)), vscale), vmax);
                    let e = fast_exp_f32x4(shifted);
                    f32x4_to_bf16x4(e, o.add(i * 4));
                    vsum = vaddq_f32(vsum, e);
                }
                vaddvq_f32(vsum)
            };
            for i in simd_len * 4..row_size {
                let e = (f32::from_bits((in_row[i] as u32) << 16) * scale - max).exp();
                out[off + i] = crate::convert::f32_to_bf16(e).to_bits();
                sum += e;
            }

            let inv = 1.0 / sum;
            unsafe {
                let vinv = vdupq_n_f32(inv);
                let o = out.as_mut_ptr().add(off);
                for i in 0..simd_len {
                    let e = bf16x4_to_f32x4(o.add(i * 4));
                    f32x4_to_bf16x4(vmulq_f32(e, vinv), o.add(i * 4));
                }
            }
            for i in simd_len * 4..row_size {
                let e = f32::from_bits((out[off + i] as u32) << 16);
                out[off + i] = crate::convert::f32_to_bf16(e * inv).to_bits();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_uniform_input() {
        let mut out = vec![0.0f32; 4];
        softmax(&mut out, &[1.0f32; 4], 1, 4);
        for v in &out {
            assert_relative_eq!(*v, 0.25, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_rows_sum_to_one() {
        let input: Vec<f32> = (0..3 * 17).map(|i| (i as f32 * 0.77).sin() * 6.0).collect();
        let mut out = vec![0.0f32; input.len()];
        softmax(&mut out, &input, 3, 17);
        for r in 0..3 {
            let sum: f32 = out[r * 17..(r + 1) * 17].iter().sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-4);
            assert!(out[r * 17..(r + 1) * 17].iter().all(|&p| (0.0..=1.0).contains(&p)));
        }
    }

    #[test]
    fn test_shift_invariance() {
        let input = vec![0.3f32, -1.2, 4.0, 2.5];
        let shifted: Vec<f32> = input.iter().map(|v| v + 123.0).collect();
        let mut a = vec![0.0f32; 4];
        let mut b = vec![0.0f32; 4];
        softmax(&mut a, &input, 1, 4);
        softmax(&mut b, &shifted, 1, 4);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_relative_eq!(x, y, max_relative = 1e-4, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_scaled_folds_factor() {
        let input = vec![1.0f32, 2.0, 3.0];
        let prescaled: Vec<f32> = input.iter().map(|v| v * 0.125).collect();
        let mut a = vec![0.0f32; 3];
        let mut b = vec![0.0f32; 3];
        softmax_scaled(&mut a, &input, 1, 3, 0.125);
        softmax(&mut b, &prescaled, 1, 3);
        for (x, y) in a.iter().zip(b.iter()) {
            assert_relative_eq!(x, y, max_relative = 1e-4, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_inplace_matches_out_of_place() {
        let input: Vec<f32> = (0..23).map(|i| (i as f32 - 11.0) * 0.4).collect();
        let mut out = vec![0.0f32; 23];
        softmax(&mut out, &input, 1, 23);
        let mut data = input.clone();
        softmax_inplace(&mut data, 1, 23);
        for (a, b) in out.iter().zip(data.iter()) {
            assert_relative_eq!(a, b, max_relative = 1e-4, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_large_magnitude_inputs_stay_finite() {
        let mut out = vec![0.0f32; 3];
        softmax(&mut out, &[1000.0f32, 999.0, -1000.0], 1, 3);
        assert!(out.iter().all(|v| v.is_finite()));
        let sum: f32 = out.iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-4);
    }
}
