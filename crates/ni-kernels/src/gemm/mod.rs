//! General matrix multiply, row-major: `A [M, K] @ B [K, N] -> C [M, N]`.
//!
//! Dispatch ladder for each dtype, in order of preference:
//!
//! 1. Accelerate BLAS (`accelerate` feature, macOS, f32 without
//!    transposes only).
//! 2. `M == 1`: NEON GEMV fast path (K unrolled by 4, 16 output lanes
//!    per iteration, B prefetched 8 rows ahead).
//! 3. NEON 8x8 register-blocked micro-kernel; boundary tiles fall back
//!    to a scalar remainder loop over that tile only.
//! 4. AMX tiles for f16 when `M >= 32 && N >= 32` (native F16 FMA with
//!    f32 accumulation). BF16 stays on NEON: the up-cast to f32 costs
//!    more than the coprocessor saves.
//! 5. Scalar naive reference, always present.
//!
//! 16-bit inputs accumulate in f32 and are narrowed only when written to
//! C. When the configured worker count, `M >= 64`, and
//! `M * N * K * 2 >= 2^20` all hold, the M dimension is split into
//! tile-aligned chunks, each worker owning a disjoint output row range;
//! the workers join before the public entry returns.

use half::{bf16, f16};

#[cfg(target_arch = "aarch64")]
use crate::caps::caps;
use crate::convert;
#[cfg(target_arch = "aarch64")]
use crate::threads::num_threads;

#[cfg(target_arch = "aarch64")]
mod neon;

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
pub mod amx;

#[cfg(target_arch = "aarch64")]
const MT_MIN_M: usize = 64;
#[cfg(target_arch = "aarch64")]
const MT_MIN_FLOPS: u64 = 1 << 20;

#[cfg(target_arch = "aarch64")]
#[inline]
fn flops(m: usize, n: usize, k: usize) -> u64 {
    2 * m as u64 * n as u64 * k as u64
}

/// `C = op(A) @ op(B)` in f32, supporting all four transpose
/// combinations. `A` holds `m * k` elements (`[m, k]`, or `[k, m]` when
/// `trans_a`), `B` holds `k * n`, `C` holds `m * n`.
#[allow(clippy::too_many_arguments)]
pub fn gemm_f32(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    n: usize,
    k: usize,
    trans_a: bool,
    trans_b: bool,
) {
    if m == 0 || n == 0 || k == 0 {
        return;
    }
    assert!(a.len() >= m * k, "gemm_f32: A smaller than m * k");
    assert!(b.len() >= k * n, "gemm_f32: B smaller than k * n");
    assert!(c.len() >= m * n, "gemm_f32: C smaller than m * n");

    #[cfg(all(feature = "accelerate", target_os = "macos"))]
    if !trans_a && !trans_b {
        blas::sgemm_nn(a, b, c, m, n, k);
        return;
    }

    #[cfg(target_arch = "aarch64")]
    if caps().has_neon && !trans_a && !trans_b {
        let nt = num_threads();
        if nt > 1 && m >= MT_MIN_M && flops(m, n, k) >= MT_MIN_FLOPS {
            neon::gemm_f32_mt(a, b, c, m, n, k, nt);
        } else {
            neon::gemm_f32_kernel(a, b, c, m, n, k);
        }
        return;
    }

    gemm_f32_naive(a, b, c, m, n, k, trans_a, trans_b);
}

/// `C = A @ B` in bfloat16 storage with f32 accumulation.
pub fn gemm_bf16(a: &[bf16], b: &[bf16], c: &mut [bf16], m: usize, n: usize, k: usize) {
    if m == 0 || n == 0 || k == 0 {
        return;
    }
    assert!(a.len() >= m * k, "gemm_bf16: A smaller than m * k");
    assert!(b.len() >= k * n, "gemm_bf16: B smaller than k * n");
    assert!(c.len() >= m * n, "gemm_bf16: C smaller than m * n");

    #[cfg(target_arch = "aarch64")]
    if caps().has_neon {
        let nt = num_threads();
        if nt > 1 && m >= MT_MIN_M && flops(m, n, k) >= MT_MIN_FLOPS {
            neon::gemm_bf16_mt(a, b, c, m, n, k, nt);
        } else {
            neon::gemm_bf16_kernel(a, b, c, m, n, k);
        }
        return;
    }

    gemm_bf16_naive(a, b, c, m, n, k);
}

/// `C = A @ B` in binary16 storage with f32 accumulation.
pub fn gemm_f16(a: &[f16], b: &[f16], c: &mut [f16], m: usize, n: usize, k: usize) {
    if m == 0 || n == 0 || k == 0 {
        return;
    }
    assert!(a.len() >= m * k, "gemm_f16: A smaller than m * k");
    assert!(b.len() >= k * n, "gemm_f16: B smaller than k * n");
    assert!(c.len() >= m * n, "gemm_f16: C smaller than m * n");

    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    if caps().has_amx && m >= 32 && n >= 32 {
        let nt = num_threads();
        if nt > 1 && m >= MT_MIN_M && flops(m, n, k) >= MT_MIN_FLOPS {
            amx::gemm_f16_amx_mt(a, b, c, m, n, k, nt);
        } else {
            amx::gemm_f16_amx(a, b, c, m, n, k);
        }
        return;
    }

    #[cfg(target_arch = "aarch64")]
    if caps().has_neon {
        let nt = num_threads();
        if nt > 1 && m >= MT_MIN_M && flops(m, n, k) >= MT_MIN_FLOPS {
            neon::gemm_f16_mt(a, b, c, m, n, k, nt);
        } else {
            neon::gemm_f16_kernel(a, b, c, m, n, k);
        }
        return;
    }

    gemm_f16_naive(a, b, c, m, n, k);
}

#[allow(clippy::too_many_arguments)]
fn gemm_f32_naive(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    n: usize,
    k: usize,
    trans_a: bool,
    trans_b: bool,
) {
    let at = |i: usize, p: usize| if trans_a { a[p * m + i] } else { a[i * k + p] };
    let bt = |p: usize, j: usize| if trans_b { b[j * k + p] } else { b[p * n + j] };

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += at(i, p) * bt(p, j);
            }
            c[i * n + j] = sum;
        }
    }
}

fn gemm_bf16_naive(a: &[bf16], b: &[bf16], c: &mut [bf16], m: usize, n: usize, k: usize) {
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += convert::bf16_to_f32(a[i * k + p]) * convert::bf16_to_f32(b[p * n + j]);
            }
            c[i * n + j] = convert::f32_to_bf16(sum);
        }
    }
}

fn gemm_f16_naive(a: &[f16], b: &[f16], c: &mut [f16], m: usize, n: usize, k: usize) {
    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0f32;
            for p in 0..k {
                sum += convert::f16_to_f32(a[i * k + p]) * convert::f16_to_f32(b[p * n + j]);
            }
            c[i * n + j] = convert::f32_to_f16(sum);
        }
    }
}

#[cfg(all(feature = "accelerate", target_os = "macos"))]
mod blas {
    const CBLAS_ROW_MAJOR: i32 = 101;
    const CBLAS_NO_TRANS: i32 = 111;

    #[link(name = "Accelerate", kind = "framework")]
    extern "C" {
        fn cblas_sgemm(
            order: i32,
            trans_a: i32,
            trans_b: i32,
            m: i32,
            n: i32,
            k: i32,
            alpha: f32,
            a: *const f32,
            lda: i32,
            b: *const f32,
            ldb: i32,
            beta: f32,
            c: *mut f32,
            ldc: i32,
        );
    }

    pub(super) fn sgemm_nn(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) {
        // SAFETY: slice lengths were validated by the caller against
        // [m, k] / [k, n] / [m, n]; Accelerate only reads A and B and
        // writes C within those bounds.
        unsafe {
            cblas_sgemm(
                CBLAS_ROW_MAJOR,
                CBLAS_NO_TRANS,
                CBLAS_NO_TRANS,
                m as i32,
                n as i32,
                k as i32,
                1.0,
                a.as_ptr(),
                k as i32,
                b.as_ptr(),
                n as i32,
                0.0,
                c.as_mut_ptr(),
                n as i32,
            );
        }
    }
}
