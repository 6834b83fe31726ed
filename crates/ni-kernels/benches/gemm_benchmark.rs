use criterion::{criterion_group, criterion_main, Criterion};
use half::{bf16, f16};
use ni_kernels::gemm::{gemm_bf16, gemm_f16, gemm_f32};

const M: usize = 256;
const N: usize = 256;
const K: usize = 256;

fn bench_gemm(c: &mut Criterion) {
    let mut group = c.benchmark_group("gemm_256");

    let a: Vec<f32> = (0..M * K).map(|i| ((i % 251) as f32 - 125.0) * 0.01).collect();
    let b: Vec<f32> = (0..K * N).map(|i| ((i % 241) as f32 - 120.0) * 0.01).collect();

    let mut c_f32 = vec![0.0f32; M * N];
    group.bench_function("f32", |bench| {
        bench.iter(|| gemm_f32(&a, &b, &mut c_f32, M, N, K, false, false));
    });

    let a_bf: Vec<bf16> = a.iter().map(|&v| bf16::from_f32(v)).collect();
    let b_bf: Vec<bf16> = b.iter().map(|&v| bf16::from_f32(v)).collect();
    let mut c_bf = vec![bf16::from_bits(0); M * N];
    group.bench_function("bf16", |bench| {
        bench.iter(|| gemm_bf16(&a_bf, &b_bf, &mut c_bf, M, N, K));
    });

    let a_f16: Vec<f16> = a.iter().map(|&v| f16::from_f32(v)).collect();
    let b_f16: Vec<f16> = b.iter().map(|&v| f16::from_f32(v)).collect();
    let mut c_f16 = vec![f16::from_bits(0); M * N];
    group.bench_function("f16", |bench| {
        bench.iter(|| gemm_f16(&a_f16, &b_f16, &mut c_f16, M, N, K));
    });

    // The routing question the dispatcher answers by construction: on
    // Apple Silicon, compare bf16 through the widened f32 AMX tiles
    // against the NEON path the dispatcher actually picks.
    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    group.bench_function("bf16_amx_widened", |bench| {
        bench.iter(|| ni_kernels::gemm::amx::gemm_bf16_amx(&a_bf, &b_bf, &mut c_bf, M, N, K));
    });

    group.finish();
}

criterion_group!(benches, bench_gemm);
criterion_main!(benches);
