//! Scalar and array-granular conversions between F32, BF16, and F16.
//!
//! These conversions are the correctness backbone of every
//! mixed-precision kernel: 16-bit operands are widened to f32, all
//! arithmetic runs in f32, and results are narrowed back only on store.
//!
//! Widening is exact in both 16-bit formats and delegates to the `half`
//! crate. Narrowing is implemented here on the raw bits because the
//! semantics differ from `half`'s defaults: BF16 rounds half-to-even via
//! the bias trick (the same arithmetic the NEON vector path uses, so
//! scalar and vector results match bit-for-bit), while F16 saturates and
//! truncates toward zero.

use half::{bf16, f16};

#[cfg(target_arch = "aarch64")]
use crate::caps::caps;

/// Narrows f32 to bfloat16, rounding half-to-even.
#[inline]
pub fn f32_to_bf16(x: f32) -> bf16 {
    let bits = x.to_bits();
    let lsb = (bits >> 16) & 1;
    let rounded = bits.wrapping_add(0x7fff + lsb);
    bf16::from_bits((rounded >> 16) as u16)
}

/// Widens bfloat16 to f32 by zero-padding the low 16 mantissa bits.
#[inline]
pub fn bf16_to_f32(x: bf16) -> f32 {
    f32::from_bits((x.to_bits() as u32) << 16)
}

/// Narrows f32 to IEEE binary16 with round-toward-zero.
///
/// Exponents that overflow binary16 (>= 31) saturate to infinity,
/// exponents that underflow (<= 0) flush to signed zero, and NaN maps to
/// the canonical quiet NaN.
#[inline]
pub fn f32_to_f16(x: f32) -> f16 {
    let bits = x.to_bits();
    let sign = bits & 0x8000_0000;
    let exp = (bits >> 23) & 0xff;
    let mant = bits & 0x007f_ffff;

    if exp == 0xff {
        if mant != 0 {
            return f16::from_bits(0x7e00);
        }
        return f16::from_bits(((sign >> 16) | 0x7c00) as u16);
    }
    if exp == 0 && mant == 0 {
        return f16::from_bits((sign >> 16) as u16);
    }

    let new_exp = exp as i32 - 127 + 15;
    if new_exp <= 0 {
        return f16::from_bits((sign >> 16) as u16);
    }
    if new_exp >= 31 {
        return f16::from_bits(((sign >> 16) | 0x7c00) as u16);
    }

    let f16_exp = (new_exp as u32) << 10;
    let f16_mant = mant >> 13;
    f16::from_bits(((sign >> 16) | f16_exp | f16_mant) as u16)
}

/// Widens IEEE binary16 to f32, including subnormals.
#[inline]
pub fn f16_to_f32(x: f16) -> f32 {
    x.to_f32()
}

/// Widens a contiguous bfloat16 buffer into `dst`.
pub fn bf16_to_f32_array(src: &[bf16], dst: &mut [f32]) {
    assert_eq!(src.len(), dst.len(), "bf16_to_f32_array: length mismatch");

    #[cfg(target_arch = "aarch64")]
    if caps().has_neon {
        neon::bf16_to_f32_array(src, dst);
        return;
    }

    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d = bf16_to_f32(*s);
    }
}

/// Narrows a contiguous f32 buffer into a bfloat16 `dst`.
pub fn f32_to_bf16_array(src: &[f32], dst: &mut [bf16]) {
    assert_eq!(src.len(), dst.len(), "f32_to_bf16_array: length mismatch");

    #[cfg(target_arch = "aarch64")]
    if caps().has_neon {
        neon::f32_to_bf16_array(src, dst);
        return;
    }

    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d = f32_to_bf16(*s);
    }
}

/// Widens a contiguous binary16 buffer into `dst`.
pub fn f16_to_f32_array(src: &[f16], dst: &mut [f32]) {
    assert_eq!(src.len(), dst.len(), "f16_to_f32_array: length mismatch");
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d = f16_to_f32(*s);
    }
}

/// Narrows a contiguous f32 buffer into a binary16 `dst`.
pub fn f32_to_f16_array(src: &[f32], dst: &mut [f16]) {
    assert_eq!(src.len(), dst.len(), "f32_to_f16_array: length mismatch");
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d = f32_to_f16(*s);
    }
}

#[cfg(target_arch = "aarch64")]
pub(crate) mod neon {
    use std::arch::aarch64::*;

    use half::bf16;

    /// Widens 4 bf16 lanes by the 16-bit shift.
    ///
    /// # Safety
    /// `src .. src + 4` must be a valid u16 range.
    #[inline(always)]
    pub(crate) unsafe fn bf16x4_to_f32x4(src: *const u16) -> float32x4_t {
        vreinterpretq_f32_u32(vshll_n_u16::<16>(vld1_u16(src)))
    }

    /// Narrows 4 f32 lanes to bf16 with round half-to-even, bit-matching
    /// the scalar `f32_to_bf16`.
    ///
    /// # Safety
    /// `dst .. dst + 4` must be a valid u16 range.
    #[inline(always)]
    pub(crate) unsafe fn f32x4_to_bf16x4(v: float32x4_t, dst: *mut u16) {
        let u = vreinterpretq_u32_f32(v);
        let lsb = vandq_u32(vshrq_n_u32::<16>(u), vdupq_n_u32(1));
        let rounded = vaddq_u32(u, vaddq_u32(vdupq_n_u32(0x7fff), lsb));
        vst1_u16(dst, vshrn_n_u32::<16>(rounded));
    }

    pub(super) fn bf16_to_f32_array(src: &[bf16], dst: &mut [f32]) {
        let len = src.len();
        let simd_len = len / 4;
        let src_ptr = src.as_ptr() as *const u16;
        let dst_ptr = dst.as_mut_ptr();

        for i in 0..simd_len {
            let off = i * 4;
            // SAFETY: off + 4 <= len; NEON is baseline on aarch64.
            unsafe {
                let h = vld1_u16(src_ptr.add(off));
                let w = vshll_n_u16::<16>(h);
                vst1q_f32(dst_ptr.add(off), vreinterpretq_f32_u32(w));
            }
        }

        for i in simd_len * 4..len {
            dst[i] = super::bf16_to_f32(src[i]);
        }
    }

    pub(super) fn f32_to_bf16_array(src: &[f32], dst: &mut [bf16]) {
        let len = src.len();
        let simd_len = len / 4;
        let src_ptr = src.as_ptr();
        let dst_ptr = dst.as_mut_ptr() as *mut u16;

        for i in 0..simd_len {
            let off = i * 4;
            // SAFETY: off + 4 <= len; NEON is baseline on aarch64.
            unsafe {
                let v = vreinterpretq_u32_f32(vld1q_f32(src_ptr.add(off)));
                let lsb = vandq_u32(vshrq_n_u32::<16>(v), vdupq_n_u32(1));
                let biased = vaddq_u32(v, vaddq_u32(vdupq_n_u32(0x7fff), lsb));
                vst1_u16(dst_ptr.add(off), vshrn_n_u32::<16>(biased));
            }
        }

        for i in simd_len * 4..len {
            dst[i] = super::f32_to_bf16(src[i]);
        }
    }
}
