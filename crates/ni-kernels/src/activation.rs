//! Elementwise activation functions and their gated variants.
//!
//! The gated `*_and_mul` forms take input laid out as `[num_tokens, 2d]`
//! where the first `d` columns are the activation argument and the last
//! `d` columns the gate, producing `[num_tokens, d]`. The transformer FFN
//! composes SwiGLU from two separate projections instead (the gate and up
//! matrices have independent weights), so the gated forms here serve
//! models whose checkpoint fuses the two projections into one tensor.

use crate::dtype::Element;

#[inline]
fn scalar_silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

#[inline]
fn scalar_gelu(x: f32) -> f32 {
    x * 0.5 * (1.0 + scalar_erf(x * std::f32::consts::FRAC_1_SQRT_2))
}

#[inline]
fn scalar_gelu_tanh(x: f32) -> f32 {
    // sqrt(2/pi)
    const W1: f32 = 0.797_884_56;
    const W3: f32 = 0.044_715;
    let inner = W1 * (x + x * x * x * W3);
    0.5 * x * (1.0 + inner.tanh())
}

#[inline]
fn scalar_gelu_quick(x: f32) -> f32 {
    x / (1.0 + (-1.702 * x).exp())
}

/// erf via the Abramowitz-Stegun 5-term rational approximation, the same
/// formula the vector path uses (std has no erf).
#[inline]
fn scalar_erf(x: f32) -> f32 {
    const A1: f32 = 0.254_829_59;
    const A2: f32 = -0.284_496_74;
    const A3: f32 = 1.421_413_7;
    const A4: f32 = -1.453_152;
    const A5: f32 = 1.061_405_4;
    const P: f32 = 0.327_591_1;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

macro_rules! define_activation {
    ($name:ident, $gated:ident, $name_bf16:ident, $scalar:path, $doc:literal) => {
        #[doc = $doc]
        pub fn $name<T: Element>(out: &mut [T], input: &[T], num_tokens: usize, d: usize) {
            if num_tokens == 0 || d == 0 {
                return;
            }
            let n = num_tokens * d;
            assert!(
                out.len() >= n && input.len() >= n,
                concat!(stringify!($name), ": buffer too small")
            );

            #[cfg(target_arch = "aarch64")]
            if crate::caps::caps().has_neon {
                if let (Some(out_f), Some(in_f)) =
                    (T::as_f32_slice_mut(out), T::as_f32_slice(input))
                {
                    neon::$name(&mut out_f[..n], &in_f[..n]);
                    return;
                }
                if T::DTYPE == crate::dtype::DType::BF16 {
                    if let (Some(out_b), Some(in_b)) =
                        (T::as_u16_slice_mut(out), T::as_u16_slice(input))
                    {
                        neon::$name_bf16(&mut out_b[..n], &in_b[..n]);
                        return;
                    }
                }
            }

            for i in 0..n {
                out[i] = T::from_f32($scalar(input[i].to_f32()));
            }
        }

        #[doc = concat!("Gated variant: `out[t, j] = ", stringify!($name), "(x[t, j]) * x[t, d + j]`.")]
        pub fn $gated<T: Element>(out: &mut [T], input: &[T], num_tokens: usize, d: usize) {
            if num_tokens == 0 || d == 0 {
                return;
            }
            assert!(out.len() >= num_tokens * d, concat!(stringify!($gated), ": out too small"));
            assert!(
                input.len() >= num_tokens * 2 * d,
                concat!(stringify!($gated), ": input smaller than [num_tokens, 2d]")
            );

            for t in 0..num_tokens {
                let in_row = &input[t * 2 * d..(t + 1) * 2 * d];
                let out_row = &mut out[t * d..(t + 1) * d];
                for j in 0..d {
                    let x = in_row[j].to_f32();
                    let gate = in_row[d + j].to_f32();
                    out_row[j] = T::from_f32($scalar(x) * gate);
                }
            }
        }
    };
}

define_activation!(silu, silu_and_mul, silu_bf16, scalar_silu, "SiLU: `x * sigmoid(x)`.");
define_activation!(
    gelu,
    gelu_and_mul,
    gelu_bf16,
    scalar_gelu,
    "Exact GELU: `x * 0.5 * (1 + erf(x / sqrt(2)))`."
);
define_activation!(
    gelu_tanh,
    gelu_tanh_and_mul,
    gelu_tanh_bf16,
    scalar_gelu_tanh,
    "Tanh-approximated GELU."
);
define_activation!(
    gelu_quick,
    gelu_quick_and_mul,
    gelu_quick_bf16,
    scalar_gelu_quick,
    "Quick GELU: `x * sigmoid(1.702 * x)`."
);

/// SiLU applied where the data stands; the FFN gate buffer is activated
/// in place before the elementwise multiply with the up projection.
pub fn silu_inplace<T: Element>(data: &mut [T], num_tokens: usize, d: usize) {
    let n = num_tokens * d;
    assert!(data.len() >= n, "silu_inplace: buffer too small");
    for v in data[..n].iter_mut() {
        *v = T::from_f32(scalar_silu(v.to_f32()));
    }
}

/// Elementwise product `out[i] = a[i] * b[i]`, the multiply half of the
/// two-projection SwiGLU composition.
pub fn mul_inplace<T: Element>(a: &mut [T], b: &[T]) {
    assert_eq!(a.len(), b.len(), "mul_inplace: length mismatch");
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x = T::from_f32(x.to_f32() * y.to_f32());
    }
}

#[cfg(target_arch = "aarch64")]
mod neon {
    use std::arch::aarch64::*;

    use crate::convert::neon::{bf16x4_to_f32x4, f32x4_to_bf16x4};
    use crate::mathfun::{fast_erf_f32x4, fast_exp_f32x4, fast_sigmoid_f32x4, fast_tanh_f32x4};

    macro_rules! define_neon_map {
        ($name:ident, $name_bf16:ident, $vector:expr, $scalar:path) => {
            pub(super) fn $name(out: &mut [f32], input: &[f32]) {
                let n = input.len();
                let simd_len = n / 4;
                let ip = input.as_ptr();
                let op = out.as_mut_ptr();
                for i in 0..simd_len {
                    // SAFETY: i * 4 + 4 <= n for both slices.
                    unsafe {
                        let v = vld1q_f32(ip.add(i * 4));
                        vst1q_f32(op.add(i * 4), $vector(v));
                    }
                }
                for i in simd_len * 4..n {
                    out[i] = $scalar(input[i]);
                }
            }

            pub(super) fn $name_bf16(out: &mut [u16], input: &[u16]) {
                let n = input.len();
                let simd_len = n / 4;
                let ip = input.as_ptr();
                let op = out.as_mut_ptr();
                for i in 0..simd_len {
                    // SAFETY: i * 4 + 4 <= n for both slices.
                    unsafe {
                        let v = bf16x4_to_f32x4(ip.add(i * 4));
                        f32x4_to_bf16x4($vector(v), op.add(i * 4));
                    }
                }
                for i in simd_len * 4..n {
                    let x = f32::from_bits((input[i] as u32) << 16);
                    out[i] = crate::convert::f32_to_bf16($scalar(x)).to_bits();
                }
            }
        };
    }

    #[inline]
    fn silu_f32x4(x: float32x4_t) -> float32x4_t {
        // SAFETY: NEON is baseline on aarch64.
        unsafe { vmulq_f32(x, fast_sigmoid_f32x4(x)) }
    }

    #[inline]
    fn gelu_f32x4(x: float32x4_t) -> float32x4_t {
        // SAFETY: NEON is baseline on aarch64.
        unsafe {
            let arg = vmulq_f32(x, vdupq_n_f32(std::f32::consts::FRAC_1_SQRT_2));
            let cdf = vmulq_f32(
                vdupq_n_f32(0.5),
                vaddq_f32(vdupq_n_f32(1.0), fast_erf_f32x4(arg)),
            );
            vmulq_f32(x, cdf)
        }
    }

    #[inline]
    fn gelu_tanh_f32x4(x: float32x4_t) -> float32x4_t {
        // SAFETY: NEON is baseline on aarch64.
        unsafe {
            let w1 = vdupq_n_f32(0.797_884_56);
            let w3 = vdupq_n_f32(0.044_715);
            let x3 = vmulq_f32(vmulq_f32(x, x), x);
            let inner = vmulq_f32(w1, vfmaq_f32(x, x3, w3));
            let t = fast_tanh_f32x4(inner);
            vmulq_f32(vmulq_f32(vdupq_n_f32(0.5), x), vaddq_f32(vdupq_n_f32(1.0), t))
        }
    }

    #[inline]
    fn gelu_quick_f32x4(x: float32x4_t) -> float32x4_t {
        // SAFETY: NEON is baseline on aarch64.
        unsafe {
            let scaled = vmulq_f32(x, vdupq_n_f32(-1.702));
            let denom = vaddq_f32(vdupq_n_f32(1.0), fast_exp_f32x4(scaled));
            vdivq_f32(x, denom)
        }
    }

    define_neon_map!(silu, silu_bf16, silu_f32x4, super::scalar_silu);
    define_neon_map!(gelu, gelu_bf16, gelu_f32x4, super::scalar_gelu);
    define_neon_map!(gelu_tanh, gelu_tanh_bf16, gelu_tanh_f32x4, super::scalar_gelu_tanh);
    define_neon_map!(gelu_quick, gelu_quick_bf16, gelu_quick_f32x4, super::scalar_gelu_quick);
}
