//! Apple matrix-coprocessor (AMX) GEMM tiles.
//!
//! F16 uses the native F16 FMA in 32x32 tiles with f32 accumulation in
//! the Z registers. BF16 is not a native AMX datatype: its kernel widens
//! to f32 and runs the 16x16 F32 mode, which is why the public dispatch
//! keeps BF16 on NEON (re-measure before porting this routing to another
//! coprocessor).
//!
//! The coprocessor is enabled per-thread through [`AmxGuard`], whose
//! `Drop` issues `AMX_CLR` even on unwind, so coprocessor state never
//! leaks past a single GEMM call. A tiles are packed transposed
//! (`K x tile_M`) so `LDY` loads consecutive A columns; B tiles are
//! packed row-major for `LDX`. Tile scratch is 64-byte aligned and
//! released at the end of the call.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::marker::PhantomData;
use std::thread;

use half::{bf16, f16};

use crate::convert;

/// Raw AMX instruction encodings: `.word 0x201000 | (op << 5) | operand`,
/// with the GPR operand pinned to x0.
mod ops {
    use std::arch::asm;

    /// Tags a pointer with a register-file row index for the load/store ops.
    #[inline(always)]
    pub(super) fn ptr_row(ptr: *const u8, row: u64) -> u64 {
        ptr as u64 | (row << 56)
    }

    macro_rules! amx_gpr_op {
        ($name:ident, $word:literal) => {
            #[inline(always)]
            pub(super) unsafe fn $name(operand: u64) {
                asm!(concat!(".word ", $word), in("x0") operand, options(nostack));
            }
        };
    }

    amx_gpr_op!(ldx, "0x00201000"); // op 0
    amx_gpr_op!(ldy, "0x00201020"); // op 1
    amx_gpr_op!(stz, "0x002010a0"); // op 5
    amx_gpr_op!(fma32, "0x00201180"); // op 12
    amx_gpr_op!(fma16, "0x002011e0"); // op 15

    /// op 17, operand 0: enable the coprocessor for this thread.
    #[inline(always)]
    pub(super) unsafe fn set() {
        asm!(".word 0x00201220", options(nostack));
    }

    /// op 17, operand 1: release the coprocessor.
    #[inline(always)]
    pub(super) unsafe fn clr() {
        asm!(".word 0x00201221", options(nostack));
    }
}

/// Scoped coprocessor acquisition: construction issues `AMX_SET`,
/// destruction `AMX_CLR`. Not `Send`: AMX state is per-thread.
pub struct AmxGuard {
    _not_send: PhantomData<*const ()>,
}

impl AmxGuard {
    pub fn new() -> Self {
        // SAFETY: AMX_SET is valid on Apple Silicon, which is the only
        // target this module compiles for; the matching CLR runs on drop.
        unsafe { ops::set() };
        AmxGuard { _not_send: PhantomData }
    }
}

impl Default for AmxGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AmxGuard {
    fn drop(&mut self) {
        // SAFETY: paired with the SET in `new`.
        unsafe { ops::clr() };
    }
}

/// Tile scratch with the 64-byte alignment the LDX/LDY loads want.
struct AlignedBuf<T> {
    ptr: *mut T,
    len: usize,
}

impl<T> AlignedBuf<T> {
    fn zeroed(len: usize) -> Self {
        let layout = Layout::from_size_align(len * std::mem::size_of::<T>(), 64)
            .expect("AlignedBuf: invalid layout");
        // SAFETY: layout has non-zero size for all call sites (len > 0).
        let ptr = unsafe { alloc_zeroed(layout) } as *mut T;
        assert!(!ptr.is_null(), "AlignedBuf: allocation failed");
        AlignedBuf { ptr, len }
    }

    #[inline]
    fn as_ptr(&self) -> *const T {
        self.ptr
    }

    #[inline]
    fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr
    }
}

impl<T> Drop for AlignedBuf<T> {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len * std::mem::size_of::<T>(), 64)
            .expect("AlignedBuf: invalid layout");
        // SAFETY: ptr came from alloc_zeroed with this exact layout.
        unsafe { dealloc(self.ptr as *mut u8, layout) };
    }
}

const FMA16_Z_F32: u64 = 1 << 62;
const FMA_SKIP_Z: u64 = 1 << 27;

#[inline]
fn fma16_op(z_row: u64, x_off: u64, y_off: u64, skip_z: bool) -> u64 {
    let mut op = FMA16_Z_F32;
    op |= (z_row & 0x3f) << 20;
    op |= (x_off & 0x1ff) << 10;
    op |= y_off & 0x1ff;
    if skip_z {
        op |= FMA_SKIP_Z;
    }
    op
}

#[inline]
fn fma32_op(z_row: u64, x_off: u64, y_off: u64, skip_z: bool) -> u64 {
    let mut op = 0u64;
    op |= (z_row & 0x3f) << 20;
    op |= (x_off & 0x1ff) << 10;
    op |= y_off & 0x1ff;
    if skip_z {
        op |= FMA_SKIP_Z;
    }
    op
}

// ---------------- f16: native 32x32 tiles ----------------

const F16_TILE: usize = 32;

/// Packs an A tile transposed to `[K, F16_TILE]` so LDY sees consecutive
/// A columns; rows past `m_len` are zero padding.
fn pack_a_f16(a: &[f16], lda: usize, m_len: usize, k: usize, packed: &mut AlignedBuf<u16>) {
    let p = packed.as_mut_ptr();
    for kk in 0..k {
        for mm in 0..F16_TILE {
            let v = if mm < m_len { a[mm * lda + kk].to_bits() } else { 0 };
            // SAFETY: kk * F16_TILE + mm < k * F16_TILE == packed.len.
            unsafe { *p.add(kk * F16_TILE + mm) = v };
        }
    }
}

/// Packs a B tile row-major to `[K, F16_TILE]` for LDX.
fn pack_b_f16(b: &[f16], ldb: usize, n_len: usize, k: usize, packed: &mut AlignedBuf<u16>) {
    let p = packed.as_mut_ptr();
    for kk in 0..k {
        for nn in 0..F16_TILE {
            let v = if nn < n_len { b[kk * ldb + nn].to_bits() } else { 0 };
            // SAFETY: kk * F16_TILE + nn < k * F16_TILE == packed.len.
            unsafe { *p.add(kk * F16_TILE + nn) = v };
        }
    }
}

/// Rank-1 updates over the packed tiles: one LDY/LDX/FMA16 per K step,
/// Z cleared by skip_z on the first step.
fn amx_f16_tile_kernel(pa: &AlignedBuf<u16>, pb: &AlignedBuf<u16>, k: usize) {
    for kk in 0..k {
        // SAFETY: each row is 32 u16 = 64 bytes inside the packed
        // buffers; the guard holding AMX enabled is on this thread.
        unsafe {
            ops::ldy(ops::ptr_row(pa.as_ptr().add(kk * F16_TILE).cast(), 0));
            ops::ldx(ops::ptr_row(pb.as_ptr().add(kk * F16_TILE).cast(), 0));
            ops::fma16(fma16_op(0, 0, 0, kk == 0));
        }
    }
}

/// Reads the f32 Z accumulators back out and narrows into C.
///
/// In F16-with-F32-accumulation mode, C row `i` lives in Z rows `2i`
/// (even columns) and `2i + 1` (odd columns), 16 f32 each; the two are
/// interleaved back into column order before narrowing.
fn store_f16_tile(c: &mut [f16], ldc: usize, m_len: usize, n_len: usize) {
    let mut even = [0.0f32; 16];
    let mut odd = [0.0f32; 16];
    for i in 0..m_len {
        // SAFETY: 16 f32 = 64 bytes per STZ into the stack buffers.
        unsafe {
            ops::stz(ops::ptr_row(even.as_mut_ptr().cast(), (2 * i) as u64));
            ops::stz(ops::ptr_row(odd.as_mut_ptr().cast(), (2 * i + 1) as u64));
        }
        for j in 0..n_len {
            let v = if j % 2 == 0 { even[j / 2] } else { odd[j / 2] };
            c[i * ldc + j] = convert::f32_to_f16(v);
        }
    }
}

pub(super) fn gemm_f16_amx(a: &[f16], b: &[f16], c: &mut [f16], m: usize, n: usize, k: usize) {
    let mut pack_a = AlignedBuf::<u16>::zeroed(k * F16_TILE);
    let mut pack_b = AlignedBuf::<u16>::zeroed(k * F16_TILE);

    let _guard = AmxGuard::new();

    let mut mi = 0;
    while mi < m {
        let m_len = (m - mi).min(F16_TILE);
        pack_a_f16(&a[mi * k..], k, m_len, k, &mut pack_a);

        let mut ni = 0;
        while ni < n {
            let n_len = (n - ni).min(F16_TILE);
            pack_b_f16(&b[ni..], n, n_len, k, &mut pack_b);

            amx_f16_tile_kernel(&pack_a, &pack_b, k);
            store_f16_tile(&mut c[mi * n + ni..], n, m_len, n_len);

            ni += F16_TILE;
        }
        mi += F16_TILE;
    }
}

/// Multi-threaded f16 AMX: tile-aligned disjoint row chunks, one guard
/// and one scratch pair per worker.
pub(super) fn gemm_f16_amx_mt(
    a: &[f16],
    b: &[f16],
    c: &mut [f16],
    m: usize,
    n: usize,
    k: usize,
    nt: usize,
) {
    if nt <= 1 {
        gemm_f16_amx(a, b, c, m, n, k);
        return;
    }
    let rows_per = ((m + nt - 1) / nt + F16_TILE - 1) / F16_TILE * F16_TILE;

    thread::scope(|scope| {
        for (idx, c_chunk) in c[..m * n].chunks_mut(rows_per * n).enumerate() {
            let rows = c_chunk.len() / n;
            let a_chunk = &a[idx * rows_per * k..idx * rows_per * k + rows * k];
            scope.spawn(move || gemm_f16_amx(a_chunk, b, c_chunk, rows, n, k));
        }
    });
}

// ---------------- bf16: widened 16x16 f32 tiles ----------------

const BF16_TILE: usize = 16;

fn pack_a_bf16_to_f32(a: &[bf16], lda: usize, m_len: usize, k: usize, packed: &mut AlignedBuf<f32>) {
    let p = packed.as_mut_ptr();
    for kk in 0..k {
        for mm in 0..BF16_TILE {
            let v = if mm < m_len { convert::bf16_to_f32(a[mm * lda + kk]) } else { 0.0 };
            // SAFETY: kk * BF16_TILE + mm < k * BF16_TILE == packed.len.
            unsafe { *p.add(kk * BF16_TILE + mm) = v };
        }
    }
}

fn pack_b_bf16_to_f32(b: &[bf16], ldb: usize, n_len: usize, k: usize, packed: &mut AlignedBuf<f32>) {
    let p = packed.as_mut_ptr();
    for kk in 0..k {
        for nn in 0..BF16_TILE {
            let v = if nn < n_len { convert::bf16_to_f32(b[kk * ldb + nn]) } else { 0.0 };
            // SAFETY: kk * BF16_TILE + nn < k * BF16_TILE == packed.len.
            unsafe { *p.add(kk * BF16_TILE + nn) = v };
        }
    }
}

fn amx_f32_tile_kernel(pa: &AlignedBuf<f32>, pb: &AlignedBuf<f32>, k: usize) {
    for kk in 0..k {
        // SAFETY: each row is 16 f32 = 64 bytes inside the packed
        // buffers; the guard holding AMX enabled is on this thread.
        unsafe {
            ops::ldy(ops::ptr_row(pa.as_ptr().add(kk * BF16_TILE).cast(), 0));
            ops::ldx(ops::ptr_row(pb.as_ptr().add(kk * BF16_TILE).cast(), 0));
            ops::fma32(fma32_op(0, 0, 0, kk == 0));
        }
    }
}

/// F32 mode uses every fourth Z row; narrow back with the same
/// round-half-to-even as the scalar conversion.
fn store_bf16_tile(c: &mut [bf16], ldc: usize, m_len: usize, n_len: usize) {
    let mut row = [0.0f32; 16];
    for i in 0..m_len {
        // SAFETY: 16 f32 = 64 bytes per STZ into the stack buffer.
        unsafe {
            ops::stz(ops::ptr_row(row.as_mut_ptr().cast(), (i * 4) as u64));
        }
        for j in 0..n_len {
            c[i * ldc + j] = convert::f32_to_bf16(row[j]);
        }
    }
}

/// BF16 through the f32 tile mode. Not wired into the public dispatch
/// (NEON wins once the widening cost is paid); kept callable for the
/// routing comparison in the GEMM benchmark.
pub fn gemm_bf16_amx(a: &[bf16], b: &[bf16], c: &mut [bf16], m: usize, n: usize, k: usize) {
    if m == 0 || n == 0 || k == 0 {
        return;
    }
    assert!(a.len() >= m * k && b.len() >= k * n && c.len() >= m * n, "gemm_bf16_amx: buffer too small");

    let mut pack_a = AlignedBuf::<f32>::zeroed(k * BF16_TILE);
    let mut pack_b = AlignedBuf::<f32>::zeroed(k * BF16_TILE);

    let _guard = AmxGuard::new();

    let mut mi = 0;
    while mi < m {
        let m_len = (m - mi).min(BF16_TILE);
        pack_a_bf16_to_f32(&a[mi * k..], k, m_len, k, &mut pack_a);

        let mut ni = 0;
        while ni < n {
            let n_len = (n - ni).min(BF16_TILE);
            pack_b_bf16_to_f32(&b[ni..], n, n_len, k, &mut pack_b);

            amx_f32_tile_kernel(&pack_a, &pack_b, k);
            store_bf16_tile(&mut c[mi * n + ni..], n, m_len, n_len);

            ni += BF16_TILE;
        }
        mi += BF16_TILE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fma16_op_encoding() {
        let op = fma16_op(0, 0, 0, true);
        assert_eq!(op, FMA16_Z_F32 | FMA_SKIP_Z);
        let op = fma16_op(3, 64, 128, false);
        assert_eq!(op, FMA16_Z_F32 | (3 << 20) | (64 << 10) | 128);
    }

    #[test]
    fn test_ptr_row_tagging() {
        let buf = [0u8; 64];
        let tagged = ops::ptr_row(buf.as_ptr(), 5);
        assert_eq!(tagged >> 56, 5);
        assert_eq!(tagged & ((1 << 56) - 1), buf.as_ptr() as u64);
    }

    #[test]
    fn test_amx_gemm_f16_matches_scalar() {
        let (m, n, k) = (33, 40, 20);
        let a: Vec<f16> = (0..m * k).map(|i| f16::from_f32(((i % 13) as f32 - 6.0) * 0.1)).collect();
        let b: Vec<f16> = (0..k * n).map(|i| f16::from_f32(((i % 7) as f32 - 3.0) * 0.2)).collect();
        let mut c = vec![f16::from_bits(0); m * n];
        gemm_f16_amx(&a, &b, &mut c, m, n, k);

        for i in 0..m {
            for j in 0..n {
                let mut want = 0.0f32;
                for p in 0..k {
                    want += a[i * k + p].to_f32() * b[p * n + j].to_f32();
                }
                let got = c[i * n + j].to_f32();
                assert!(
                    (got - want).abs() <= 0.05 + 0.05 * want.abs(),
                    "C[{i},{j}] = {got}, want {want}"
                );
            }
        }
    }
}
