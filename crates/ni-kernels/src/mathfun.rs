//! Shared NEON transcendental approximations for the vector kernels.
//!
//! `fast_exp` uses range reduction `exp(x) = 2^(x * log2(e))` with a
//! 5th-order polynomial on the reduced argument and IEEE exponent
//! reconstruction; inputs are clamped to |x| <= 88 so the reconstructed
//! exponent stays in range. `tanh` folds onto the sigmoid identity
//! `2*sigmoid(2x) - 1`, and `erf` uses the Abramowitz-Stegun 5-term
//! rational approximation with sign folding.

use std::arch::aarch64::*;

/// Vector exp over 4 lanes.
#[inline]
pub(crate) fn fast_exp_f32x4(x: float32x4_t) -> float32x4_t {
    // SAFETY: NEON is baseline on aarch64; purely register arithmetic.
    unsafe {
        let log2e = vdupq_n_f32(1.442_695_f32);
        let ln2 = vdupq_n_f32(0.693_147_2_f32);
        let c0 = vdupq_n_f32(1.0);
        let c1 = vdupq_n_f32(1.0);
        let c2 = vdupq_n_f32(0.5);
        let c3 = vdupq_n_f32(0.166_666_67);
        let c4 = vdupq_n_f32(0.041_666_67);
        let c5 = vdupq_n_f32(0.008_333_333);

        let x = vmaxq_f32(x, vdupq_n_f32(-88.0));
        let x = vminq_f32(x, vdupq_n_f32(88.0));

        let z = vmulq_f32(x, log2e);
        let floor_z = vrndmq_f32(z);
        let n = vcvtq_s32_f32(floor_z);
        // Reduced argument r = x - floor(z) * ln2, r in [0, ln2).
        let r = vfmsq_f32(x, floor_z, ln2);

        let mut p = c5;
        p = vfmaq_f32(c4, p, r);
        p = vfmaq_f32(c3, p, r);
        p = vfmaq_f32(c2, p, r);
        p = vfmaq_f32(c1, p, r);
        p = vfmaq_f32(c0, p, r);

        // 2^n by building the IEEE exponent directly.
        let n = vaddq_s32(n, vdupq_n_s32(127));
        let scale = vreinterpretq_f32_s32(vshlq_n_s32::<23>(n));

        vmulq_f32(p, scale)
    }
}

/// Vector sigmoid: 1 / (1 + exp(-x)).
#[inline]
pub(crate) fn fast_sigmoid_f32x4(x: float32x4_t) -> float32x4_t {
    // SAFETY: NEON is baseline on aarch64.
    unsafe {
        let exp_neg = fast_exp_f32x4(vnegq_f32(x));
        let one = vdupq_n_f32(1.0);
        vdivq_f32(one, vaddq_f32(one, exp_neg))
    }
}

/// Vector tanh via 2*sigmoid(2x) - 1.
#[inline]
pub(crate) fn fast_tanh_f32x4(x: float32x4_t) -> float32x4_t {
    // SAFETY: NEON is baseline on aarch64.
    unsafe {
        let two = vdupq_n_f32(2.0);
        let s = fast_sigmoid_f32x4(vmulq_f32(two, x));
        vfmaq_f32(vdupq_n_f32(-1.0), two, s)
    }
}

/// Vector erf, Abramowitz-Stegun 7.1.26 with sign folding.
#[inline]
pub(crate) fn fast_erf_f32x4(x: float32x4_t) -> float32x4_t {
    // SAFETY: NEON is baseline on aarch64.
    unsafe {
        let a1 = vdupq_n_f32(0.254_829_59);
        let a2 = vdupq_n_f32(-0.284_496_74);
        let a3 = vdupq_n_f32(1.421_413_7);
        let a4 = vdupq_n_f32(-1.453_152);
        let a5 = vdupq_n_f32(1.061_405_4);
        let p = vdupq_n_f32(0.327_591_1);
        let one = vdupq_n_f32(1.0);

        let abs_x = vabsq_f32(x);
        let t = vdivq_f32(one, vfmaq_f32(one, p, abs_x));

        // Horner over t: ((((a5 t + a4) t + a3) t + a2) t + a1) t
        let mut poly = a5;
        poly = vfmaq_f32(a4, poly, t);
        poly = vfmaq_f32(a3, poly, t);
        poly = vfmaq_f32(a2, poly, t);
        poly = vfmaq_f32(a1, poly, t);
        poly = vmulq_f32(poly, t);

        let exp_term = fast_exp_f32x4(vnegq_f32(vmulq_f32(abs_x, abs_x)));
        let result = vfmsq_f32(one, poly, exp_term);

        // Fold the sign back in: erf(-x) = -erf(x).
        let neg = vcltq_f32(x, vdupq_n_f32(0.0));
        vbslq_f32(neg, vnegq_f32(result), result)
    }
}
