//! NEON GEMM kernels for aarch64.
//!
//! The f32 path keeps an 8x8 output tile resident in 16 accumulator
//! registers for the whole K loop; 16-bit paths widen operands on the
//! fly (bf16 by a bit shift, f16 through scalar conversion because the
//! NEON f16 vector types are nightly-only) and accumulate in f32.
//! Multi-threaded variants split the output rows into tile-aligned,
//! disjoint `chunks_mut` slices and fork/join with `std::thread::scope`.

use std::arch::aarch64::*;
use std::thread;

use half::{bf16, f16};

use crate::convert;

/// Software prefetch into L1. `prfm` never faults, and the address is
/// computed with `wrapping_add`, so running past the end of B near the
/// K boundary is harmless.
#[inline(always)]
unsafe fn prefetch_read(p: *const u8) {
    core::arch::asm!("prfm pldl1keep, [{0}]", in(reg) p, options(nostack, preserves_flags, readonly));
}

// ---------------- f32 ----------------

/// Single-thread f32 kernel: zeroes C, then GEMV for `M == 1` or 8x8
/// tiles otherwise.
pub(super) fn gemm_f32_kernel(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
    c[..m * n].fill(0.0);

    if m == 1 {
        gemv_f32(a, b, c, n, k);
        return;
    }

    let mut mi = 0;
    while mi < m {
        let mut ni = 0;
        while ni < n {
            // SAFETY: tile offsets are bounded by (m, n, k) and the
            // slice lengths checked in the public entry.
            unsafe {
                micro_kernel_8x8(a.as_ptr(), b.as_ptr(), c.as_mut_ptr(), m, n, k, k, n, n, mi, ni);
            }
            ni += 8;
        }
        mi += 8;
    }
}

/// One K-step of the GEMV body: broadcast lane `LANE` of the A vector
/// against a 16-wide B row starting at `row`.
///
/// # Safety
/// `row .. row + 16` must be a valid f32 range.
#[inline(always)]
unsafe fn gemv_lane_f32<const LANE: i32>(row: *const f32, av: float32x4_t, s: &mut [float32x4_t; 4]) {
    s[0] = vfmaq_laneq_f32::<LANE>(s[0], vld1q_f32(row), av);
    s[1] = vfmaq_laneq_f32::<LANE>(s[1], vld1q_f32(row.add(4)), av);
    s[2] = vfmaq_laneq_f32::<LANE>(s[2], vld1q_f32(row.add(8)), av);
    s[3] = vfmaq_laneq_f32::<LANE>(s[3], vld1q_f32(row.add(12)), av);
}

/// GEMV fast path: 16 N-lanes per iteration, K unrolled by 4 with lane
/// broadcasts from a single A vector, B prefetched 8 rows ahead.
fn gemv_f32(a: &[f32], b: &[f32], c: &mut [f32], n: usize, k: usize) {
    let ap = a.as_ptr();
    let bp = b.as_ptr();
    let cp = c.as_mut_ptr();

    let mut j = 0;
    while j + 16 <= n {
        // SAFETY: j + 16 <= n and kk + 4 <= k bound every access below.
        unsafe {
            let mut s = [vdupq_n_f32(0.0); 4];

            let mut kk = 0;
            while kk + 4 <= k {
                prefetch_read(bp.wrapping_add((kk + 8) * n + j).cast());
                let av = vld1q_f32(ap.add(kk));
                gemv_lane_f32::<0>(bp.add(kk * n + j), av, &mut s);
                gemv_lane_f32::<1>(bp.add((kk + 1) * n + j), av, &mut s);
                gemv_lane_f32::<2>(bp.add((kk + 2) * n + j), av, &mut s);
                gemv_lane_f32::<3>(bp.add((kk + 3) * n + j), av, &mut s);
                kk += 4;
            }
            while kk < k {
                let av = *ap.add(kk);
                let row = bp.add(kk * n + j);
                s[0] = vfmaq_n_f32(s[0], vld1q_f32(row), av);
                s[1] = vfmaq_n_f32(s[1], vld1q_f32(row.add(4)), av);
                s[2] = vfmaq_n_f32(s[2], vld1q_f32(row.add(8)), av);
                s[3] = vfmaq_n_f32(s[3], vld1q_f32(row.add(12)), av);
                kk += 1;
            }

            vst1q_f32(cp.add(j), s[0]);
            vst1q_f32(cp.add(j + 4), s[1]);
            vst1q_f32(cp.add(j + 8), s[2]);
            vst1q_f32(cp.add(j + 12), s[3]);
        }
        j += 16;
    }

    for jj in j..n {
        let mut sum = 0.0f32;
        for kk in 0..k {
            sum += a[kk] * b[kk * n + jj];
        }
        c[jj] = sum;
    }
}

/// 8x8 register-blocked tile: 8 rows x 2 half-rows of 4 f32 lanes stay
/// in registers for the full K loop, accumulating into C.
///
/// # Safety
/// All of `(mi..mi+8) x (ni..ni+8)` clipped to `(m, n)` must be valid in
/// A (leading dim `lda`), B (`ldb`), and C (`ldc`).
#[allow(clippy::too_many_arguments)]
unsafe fn micro_kernel_8x8(
    a: *const f32,
    b: *const f32,
    c: *mut f32,
    m: usize,
    n: usize,
    k: usize,
    lda: usize,
    ldb: usize,
    ldc: usize,
    mi: usize,
    ni: usize,
) {
    let actual_m = if mi + 8 > m { m - mi } else { 8 };
    let actual_n = if ni + 8 > n { n - ni } else { 8 };

    if actual_m == 8 && actual_n == 8 {
        let mut acc_lo = [vdupq_n_f32(0.0); 8];
        let mut acc_hi = [vdupq_n_f32(0.0); 8];

        let mut kk = 0;
        while kk + 4 <= k {
            prefetch_read(b.wrapping_add((kk + 8) * ldb + ni).cast());
            for step in 0..4 {
                let b0 = vld1q_f32(b.add((kk + step) * ldb + ni));
                let b1 = vld1q_f32(b.add((kk + step) * ldb + ni + 4));
                for r in 0..8 {
                    let av = *a.add((mi + r) * lda + kk + step);
                    acc_lo[r] = vfmaq_n_f32(acc_lo[r], b0, av);
                    acc_hi[r] = vfmaq_n_f32(acc_hi[r], b1, av);
                }
            }
            kk += 4;
        }
        while kk < k {
            let b0 = vld1q_f32(b.add(kk * ldb + ni));
            let b1 = vld1q_f32(b.add(kk * ldb + ni + 4));
            for r in 0..8 {
                let av = *a.add((mi + r) * lda + kk);
                acc_lo[r] = vfmaq_n_f32(acc_lo[r], b0, av);
                acc_hi[r] = vfmaq_n_f32(acc_hi[r], b1, av);
            }
            kk += 1;
        }

        for r in 0..8 {
            let cr = c.add((mi + r) * ldc + ni);
            vst1q_f32(cr, vaddq_f32(vld1q_f32(cr), acc_lo[r]));
            vst1q_f32(cr.add(4), vaddq_f32(vld1q_f32(cr.add(4)), acc_hi[r]));
        }
    } else {
        // Boundary tile: scalar remainder over just this tile.
        for i in 0..actual_m {
            for j in 0..actual_n {
                let mut sum = 0.0f32;
                for kk in 0..k {
                    sum += *a.add((mi + i) * lda + kk) * *b.add(kk * ldb + ni + j);
                }
                *c.add((mi + i) * ldc + ni + j) += sum;
            }
        }
    }
}

/// Multi-threaded f32 kernel over disjoint row chunks.
pub(super) fn gemm_f32_mt(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    n: usize,
    k: usize,
    nt: usize,
) {
    if nt <= 1 || m < 16 {
        gemm_f32_kernel(a, b, c, m, n, k);
        return;
    }
    let nt = nt.min(m / 8).max(1);
    // Round the per-worker row count up to the 8-row tile height.
    let rows_per = ((m + nt - 1) / nt + 7) / 8 * 8;

    thread::scope(|scope| {
        for (idx, c_chunk) in c[..m * n].chunks_mut(rows_per * n).enumerate() {
            let rows = c_chunk.len() / n;
            let a_chunk = &a[idx * rows_per * k..idx * rows_per * k + rows * k];
            scope.spawn(move || gemm_f32_kernel(a_chunk, b, c_chunk, rows, n, k));
        }
    });
}

// ---------------- bf16 ----------------

#[inline(always)]
unsafe fn bf16x8_to_f32x8(src: *const u16) -> (float32x4_t, float32x4_t) {
    let h = vld1q_u16(src);
    let lo = vreinterpretq_f32_u32(vshll_n_u16::<16>(vget_low_u16(h)));
    let hi = vreinterpretq_f32_u32(vshll_n_u16::<16>(vget_high_u16(h)));
    (lo, hi)
}

#[inline(always)]
unsafe fn bf16x4_to_f32x4(src: *const u16) -> float32x4_t {
    vreinterpretq_f32_u32(vshll_n_u16::<16>(vld1_u16(src)))
}

/// Narrows two f32 vectors to 8 bf16 lanes with round half-to-even, the
/// vector twin of `convert::f32_to_bf16`.
#[inline(always)]
unsafe fn f32x8_to_bf16x8(lo: float32x4_t, hi: float32x4_t, dst: *mut u16) {
    let bias = vdupq_n_u32(0x7fff);
    let one = vdupq_n_u32(1);
    let lo_u = vreinterpretq_u32_f32(lo);
    let hi_u = vreinterpretq_u32_f32(hi);
    let lo_r = vaddq_u32(lo_u, vaddq_u32(bias, vandq_u32(vshrq_n_u32::<16>(lo_u), one)));
    let hi_r = vaddq_u32(hi_u, vaddq_u32(bias, vandq_u32(vshrq_n_u32::<16>(hi_u), one)));
    vst1_u16(dst, vshrn_n_u32::<16>(lo_r));
    vst1_u16(dst.add(4), vshrn_n_u32::<16>(hi_r));
}

pub(super) fn gemm_bf16_kernel(a: &[bf16], b: &[bf16], c: &mut [bf16], m: usize, n: usize, k: usize) {
    let ap = a.as_ptr().cast::<u16>();
    let bp = b.as_ptr().cast::<u16>();
    let cp = c.as_mut_ptr().cast::<u16>();

    if m == 1 {
        gemv_bf16(a, b, c, n, k);
        return;
    }

    let mut mi = 0;
    while mi < m {
        let mut ni = 0;
        while ni < n {
            // SAFETY: tile offsets bounded by (m, n, k) and the slice
            // lengths checked in the public entry.
            unsafe {
                micro_kernel_bf16_8x8(ap, bp, cp, m, n, k, mi, ni);
            }
            ni += 8;
        }
        mi += 8;
    }
}

/// One K-step of the bf16 GEMV body over a 16-wide widened B row.
///
/// # Safety
/// `row .. row + 16` must be a valid u16 range.
#[inline(always)]
unsafe fn gemv_lane_bf16<const LANE: i32>(row: *const u16, av: float32x4_t, s: &mut [float32x4_t; 4]) {
    let (b0, b1) = bf16x8_to_f32x8(row);
    let (b2, b3) = bf16x8_to_f32x8(row.add(8));
    s[0] = vfmaq_laneq_f32::<LANE>(s[0], b0, av);
    s[1] = vfmaq_laneq_f32::<LANE>(s[1], b1, av);
    s[2] = vfmaq_laneq_f32::<LANE>(s[2], b2, av);
    s[3] = vfmaq_laneq_f32::<LANE>(s[3], b3, av);
}

fn gemv_bf16(a: &[bf16], b: &[bf16], c: &mut [bf16], n: usize, k: usize) {
    let ap = a.as_ptr().cast::<u16>();
    let bp = b.as_ptr().cast::<u16>();
    let cp = c.as_mut_ptr().cast::<u16>();

    let mut j = 0;
    while j + 16 <= n {
        // SAFETY: j + 16 <= n and kk + 4 <= k bound every access below.
        unsafe {
            let mut s = [vdupq_n_f32(0.0); 4];

            let mut kk = 0;
            while kk + 4 <= k {
                prefetch_read(bp.wrapping_add((kk + 8) * n + j).cast());
                let av = bf16x4_to_f32x4(ap.add(kk));
                gemv_lane_bf16::<0>(bp.add(kk * n + j), av, &mut s);
                gemv_lane_bf16::<1>(bp.add((kk + 1) * n + j), av, &mut s);
                gemv_lane_bf16::<2>(bp.add((kk + 2) * n + j), av, &mut s);
                gemv_lane_bf16::<3>(bp.add((kk + 3) * n + j), av, &mut s);
                kk += 4;
            }
            while kk < k {
                let av = convert::bf16_to_f32(a[kk]);
                let row = bp.add(kk * n + j);
                let (b0, b1) = bf16x8_to_f32x8(row);
                let (b2, b3) = bf16x8_to_f32x8(row.add(8));
                s[0] = vfmaq_n_f32(s[0], b0, av);
                s[1] = vfmaq_n_f32(s[1], b1, av);
                s[2] = vfmaq_n_f32(s[2], b2, av);
                s[3] = vfmaq_n_f32(s[3], b3, av);
                kk += 1;
            }

            f32x8_to_bf16x8(s[0], s[1], cp.add(j));
            f32x8_to_bf16x8(s[2], s[3], cp.add(j + 8));
        }
        j += 16;
    }

    for jj in j..n {
        let mut sum = 0.0f32;
        for kk in 0..k {
            sum += convert::bf16_to_f32(a[kk]) * convert::bf16_to_f32(b[kk * n + jj]);
        }
        c[jj] = convert::f32_to_bf16(sum);
    }
}

/// # Safety
/// Same contract as `micro_kernel_8x8`, with `lda = k`, `ldb = ldc = n`.
unsafe fn micro_kernel_bf16_8x8(
    a: *const u16,
    b: *const u16,
    c: *mut u16,
    m: usize,
    n: usize,
    k: usize,
    mi: usize,
    ni: usize,
) {
    let actual_m = if mi + 8 > m { m - mi } else { 8 };
    let actual_n = if ni + 8 > n { n - ni } else { 8 };

    if actual_m == 8 && actual_n == 8 {
        let mut acc_lo = [vdupq_n_f32(0.0); 8];
        let mut acc_hi = [vdupq_n_f32(0.0); 8];

        let mut kk = 0;
        while kk + 4 <= k {
            prefetch_read(b.wrapping_add((kk + 8) * n + ni).cast());
            let (b00, b01) = bf16x8_to_f32x8(b.add(kk * n + ni));
            let (b10, b11) = bf16x8_to_f32x8(b.add((kk + 1) * n + ni));
            let (b20, b21) = bf16x8_to_f32x8(b.add((kk + 2) * n + ni));
            let (b30, b31) = bf16x8_to_f32x8(b.add((kk + 3) * n + ni));
            for r in 0..8 {
                let av = bf16x4_to_f32x4(a.add((mi + r) * k + kk));
                acc_lo[r] = vfmaq_laneq_f32::<0>(acc_lo[r], b00, av);
                acc_hi[r] = vfmaq_laneq_f32::<0>(acc_hi[r], b01, av);
                acc_lo[r] = vfmaq_laneq_f32::<1>(acc_lo[r], b10, av);
                acc_hi[r] = vfmaq_laneq_f32::<1>(acc_hi[r], b11, av);
                acc_lo[r] = vfmaq_laneq_f32::<2>(acc_lo[r], b20, av);
                acc_hi[r] = vfmaq_laneq_f32::<2>(acc_hi[r], b21, av);
                acc_lo[r] = vfmaq_laneq_f32::<3>(acc_lo[r], b30, av);
                acc_hi[r] = vfmaq_laneq_f32::<3>(acc_hi[r], b31, av);
            }
            kk += 4;
        }
        while kk < k {
            let (b0, b1) = bf16x8_to_f32x8(b.add(kk * n + ni));
            for r in 0..8 {
                let av = convert::bf16_to_f32(bf16::from_bits(*a.add((mi + r) * k + kk)));
                acc_lo[r] = vfmaq_n_f32(acc_lo[r], b0, av);
                acc_hi[r] = vfmaq_n_f32(acc_hi[r], b1, av);
            }
            kk += 1;
        }

        for r in 0..8 {
            f32x8_to_bf16x8(acc_lo[r], acc_hi[r], c.add((mi + r) * n + ni));
        }
    } else {
        for i in 0..actual_m {
            for j in 0..actual_n {
                let mut sum = 0.0f32;
                for kk in 0..k {
                    sum += convert::bf16_to_f32(bf16::from_bits(*a.add((mi + i) * k + kk)))
                        * convert::bf16_to_f32(bf16::from_bits(*b.add(kk * n + ni + j)));
                }
                *c.add((mi + i) * n + ni + j) = convert::f32_to_bf16(sum).to_bits();
            }
        }
    }
}

pub(super) fn gemm_bf16_mt(
    a: &[bf16],
    b: &[bf16],
    c: &mut [bf16],
    m: usize,
    n: usize,
    k: usize,
    nt: usize,
) {
    if nt <= 1 || m < 16 {
        gemm_bf16_kernel(a, b, c, m, n, k);
        return;
    }
    let nt = nt.min(m / 8).max(1);
    let rows_per = ((m + nt - 1) / nt + 7) / 8 * 8;

    thread::scope(|scope| {
        for (idx, c_chunk) in c[..m * n].chunks_mut(rows_per * n).enumerate() {
            let rows = c_chunk.len() / n;
            let a_chunk = &a[idx * rows_per * k..idx * rows_per * k + rows * k];
            scope.spawn(move || gemm_bf16_kernel(a_chunk, b, c_chunk, rows, n, k));
        }
    });
}

// ---------------- f16 ----------------

/// Widens 4 f16 lanes through scalar conversion. The NEON f16 vector
/// types (`float16x4_t`, `vcvt_f32_f16`) are still nightly-only, so the
/// widen goes through `convert` and a stack array.
#[inline(always)]
unsafe fn f16x4_to_f32x4(src: *const u16) -> float32x4_t {
    let tmp = [
        convert::f16_to_f32(f16::from_bits(*src)),
        convert::f16_to_f32(f16::from_bits(*src.add(1))),
        convert::f16_to_f32(f16::from_bits(*src.add(2))),
        convert::f16_to_f32(f16::from_bits(*src.add(3))),
    ];
    vld1q_f32(tmp.as_ptr())
}

#[inline(always)]
unsafe fn f32x4_to_f16x4(v: float32x4_t, dst: *mut u16) {
    let mut tmp = [0.0f32; 4];
    vst1q_f32(tmp.as_mut_ptr(), v);
    for (i, &x) in tmp.iter().enumerate() {
        *dst.add(i) = convert::f32_to_f16(x).to_bits();
    }
}

pub(super) fn gemm_f16_kernel(a: &[f16], b: &[f16], c: &mut [f16], m: usize, n: usize, k: usize) {
    let ap = a.as_ptr().cast::<u16>();
    let bp = b.as_ptr().cast::<u16>();
    let cp = c.as_mut_ptr().cast::<u16>();

    if m == 1 {
        // GEMV: 8 lanes per iteration, f32 accumulators.
        let mut j = 0;
        while j + 8 <= n {
            // SAFETY: j + 8 <= n and kk < k bound every access below.
            unsafe {
                let mut s0 = vdupq_n_f32(0.0);
                let mut s1 = vdupq_n_f32(0.0);
                for kk in 0..k {
                    prefetch_read(bp.wrapping_add((kk + 8) * n + j).cast());
                    let av = convert::f16_to_f32(a[kk]);
                    let row = bp.add(kk * n + j);
                    s0 = vfmaq_n_f32(s0, f16x4_to_f32x4(row), av);
                    s1 = vfmaq_n_f32(s1, f16x4_to_f32x4(row.add(4)), av);
                }
                f32x4_to_f16x4(s0, cp.add(j));
                f32x4_to_f16x4(s1, cp.add(j + 4));
            }
            j += 8;
        }
        for jj in j..n {
            let mut sum = 0.0f32;
            for kk in 0..k {
                sum += convert::f16_to_f32(a[kk]) * convert::f16_to_f32(b[kk * n + jj]);
            }
            c[jj] = convert::f32_to_f16(sum);
        }
        return;
    }

    let mut mi = 0;
    while mi < m {
        let mut ni = 0;
        while ni < n {
            // SAFETY: tile offsets bounded by (m, n, k) and the slice
            // lengths checked in the public entry.
            unsafe {
                micro_kernel_f16_8x8(ap, bp, cp, m, n, k, mi, ni);
            }
            ni += 8;
        }
        mi += 8;
    }
}

/// # Safety
/// Same contract as `micro_kernel_8x8`, with `lda = k`, `ldb = ldc = n`.
unsafe fn micro_kernel_f16_8x8(
    a: *const u16,
    b: *const u16,
    c: *mut u16,
    m: usize,
    n: usize,
    k: usize,
    mi: usize,
    ni: usize,
) {
    let actual_m = if mi + 8 > m { m - mi } else { 8 };
    let actual_n = if ni + 8 > n { n - ni } else { 8 };

    if actual_m == 8 && actual_n == 8 {
        let mut acc_lo = [vdupq_n_f32(0.0); 8];
        let mut acc_hi = [vdupq_n_f32(0.0); 8];

        let mut kk = 0;
        while kk + 4 <= k {
            prefetch_read(b.wrapping_add((kk + 8) * n + ni).cast());
            let b00 = f16x4_to_f32x4(b.add(kk * n + ni));
            let b01 = f16x4_to_f32x4(b.add(kk * n + ni + 4));
            let b10 = f16x4_to_f32x4(b.add((kk + 1) * n + ni));
            let b11 = f16x4_to_f32x4(b.add((kk + 1) * n + ni + 4));
            let b20 = f16x4_to_f32x4(b.add((kk + 2) * n + ni));
            let b21 = f16x4_to_f32x4(b.add((kk + 2) * n + ni + 4));
            let b30 = f16x4_to_f32x4(b.add((kk + 3) * n + ni));
            let b31 = f16x4_to_f32x4(b.add((kk + 3) * n + ni + 4));
            for r in 0..8 {
                let av = f16x4_to_f32x4(a.add((mi + r) * k + kk));
                acc_lo[r] = vfmaq_laneq_f32::<0>(acc_lo[r], b00, av);
                acc_hi[r] = vfmaq_laneq_f32::<0>(acc_hi[r], b01, av);
                acc_lo[r] = vfmaq_laneq_f32::<1>(acc_lo[r], b10, av);
                acc_hi[r] = vfmaq_laneq_f32::<1>(acc_hi[r], b11, av);
                acc_lo[r] = vfmaq_laneq_f32::<2>(acc_lo[r], b20, av);
                acc_hi[r] = vfmaq_laneq_f32::<2>(acc_hi[r], b21, av);
                acc_lo[r] = vfmaq_laneq_f32::<3>(acc_lo[r], b30, av);
                acc_hi[r] = vfmaq_laneq_f32::<3>(acc_hi[r], b31, av);
            }
            kk += 4;
        }
        while kk < k {
            let b0 = f16x4_to_f32x4(b.add(kk * n + ni));
            let b1 = f16x4_to_f32x4(b.add(kk * n + ni + 4));
            for r in 0..8 {
                let av = convert::f16_to_f32(f16::from_bits(*a.add((mi + r) * k + kk)));
                acc_lo[r] = vfmaq_n_f32(acc_lo[r], b0, av);
                acc_hi[r] = vfmaq_n_f32(acc_hi[r], b1, av);
            }
            kk += 1;
        }

        for r in 0..8 {
            f32x4_to_f16x4(acc_lo[r], c.add((mi + r) * n + ni));
            f32x4_to_f16x4(acc_hi[r], c.add((mi + r) * n + ni + 4));
        }
    } else {
        for i in 0..actual_m {
            for j in 0..actual_n {
                let mut sum = 0.0f32;
                for kk in 0..k {
                    sum += convert::f16_to_f32(f16::from_bits(*a.add((mi + i) * k + kk)))
                        * convert::f16_to_f32(f16::from_bits(*b.add(kk * n + ni + j)));
                }
                *c.add((mi + i) * n + ni + j) = convert::f32_to_f16(sum).to_bits();
            }
        }
    }
}

pub(super) fn gemm_f16_mt(
    a: &[f16],
    b: &[f16],
    c: &mut [f16],
    m: usize,
    n: usize,
    k: usize,
    nt: usize,
) {
    if nt <= 1 || m < 16 {
        gemm_f16_kernel(a, b, c, m, n, k);
        return;
    }
    let nt = nt.min(m / 8).max(1);
    let rows_per = ((m + nt - 1) / nt + 7) / 8 * 8;

    thread::scope(|scope| {
        for (idx, c_chunk) in c[..m * n].chunks_mut(rows_per * n).enumerate() {
            let rows = c_chunk.len() / n;
            let a_chunk = &a[idx * rows_per * k..idx * rows_per * k + rows * k];
            scope.spawn(move || gemm_f16_kernel(a_chunk, b, c_chunk, rows, n, k));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
        let mut c = vec![0.0f32; m * n];
        for i in 0..m {
            for j in 0..n {
                let mut sum = 0.0;
                for p in 0..k {
                    sum += a[i * k + p] * b[p * n + j];
                }
                c[i * n + j] = sum;
            }
        }
        c
    }

    fn fill(n: usize, seed: u32) -> Vec<f32> {
        let mut state = seed | 1;
        (0..n)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state as f32 / u32::MAX as f32) * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_kernel_matches_naive_odd_sizes() {
        // Sizes chosen to hit full tiles, boundary tiles, and K tails.
        for &(m, n, k) in &[(8, 8, 8), (13, 19, 21), (16, 24, 7), (9, 8, 12)] {
            let a = fill(m * k, 3);
            let b = fill(k * n, 5);
            let mut c = vec![0.0f32; m * n];
            gemm_f32_kernel(&a, &b, &mut c, m, n, k);
            let want = naive(&a, &b, m, n, k);
            for (g, w) in c.iter().zip(want.iter()) {
                assert!((g - w).abs() < 1e-4, "({m},{n},{k}): {g} vs {w}");
            }
        }
    }

    #[test]
    fn test_mt_matches_single_thread() {
        let (m, n, k) = (64, 40, 32);
        let a = fill(m * k, 7);
        let b = fill(k * n, 11);
        let mut st = vec![0.0f32; m * n];
        let mut mt = vec![0.0f32; m * n];
        gemm_f32_kernel(&a, &b, &mut st, m, n, k);
        gemm_f32_mt(&a, &b, &mut mt, m, n, k, 4);
        for (x, y) in st.iter().zip(mt.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_mt_uneven_row_split() {
        // 70 rows across workers of 24 tile-aligned rows: the last chunk
        // is short and not a multiple of the tile height.
        let (m, n, k) = (70, 16, 16);
        let a = fill(m * k, 13);
        let b = fill(k * n, 17);
        let mut mt = vec![0.0f32; m * n];
        gemm_f32_mt(&a, &b, &mut mt, m, n, k, 4);
        let want = naive(&a, &b, m, n, k);
        for (g, w) in mt.iter().zip(want.iter()) {
            assert!((g - w).abs() < 1e-4);
        }
    }

    #[test]
    fn test_bf16_kernel_vs_f32() {
        let (m, n, k) = (16, 24, 32);
        let af = fill(m * k, 19);
        let bf = fill(k * n, 23);
        let a: Vec<bf16> = af.iter().map(|&v| bf16::from_f32(v)).collect();
        let b: Vec<bf16> = bf.iter().map(|&v| bf16::from_f32(v)).collect();
        let mut c = vec![bf16::from_bits(0); m * n];
        gemm_bf16_kernel(&a, &b, &mut c, m, n, k);

        let aw: Vec<f32> = a.iter().map(|v| v.to_f32()).collect();
        let bw: Vec<f32> = b.iter().map(|v| v.to_f32()).collect();
        let want = naive(&aw, &bw, m, n, k);
        for (g, w) in c.iter().zip(want.iter()) {
            assert!((g.to_f32() - w).abs() <= 0.05 + 0.05 * w.abs());
        }
    }

    #[test]
    fn test_f16_kernel_vs_f32() {
        let (m, n, k) = (9, 17, 12);
        let af = fill(m * k, 29);
        let bf = fill(k * n, 31);
        let a: Vec<f16> = af.iter().map(|&v| f16::from_f32(v)).collect();
        let b: Vec<f16> = bf.iter().map(|&v| f16::from_f32(v)).collect();
        let mut c = vec![f16::from_bits(0); m * n];
        gemm_f16_kernel(&a, &b, &mut c, m, n, k);

        let aw: Vec<f32> = a.iter().map(|v| v.to_f32()).collect();
        let bw: Vec<f32> = b.iter().map(|v| v.to_f32()).collect();
        let want = naive(&aw, &bw, m, n, k);
        for (g, w) in c.iter().zip(want.iter()) {
            assert!((g.to_f32() - w).abs() <= 0.05 + 0.05 * w.abs());
        }
    }
}
