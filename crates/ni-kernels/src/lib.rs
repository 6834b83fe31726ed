//! `ni-kernels` - CPU numeric kernels for nanoinfer.
//!
//! This crate provides:
//! - Runtime CPU capability detection and per-operator kernel dispatch
//! - Mixed-precision conversions between F32, BF16, and F16
//! - The operator layer composed by the transformer forward pass:
//!   embedding lookup, RMSNorm, rotary embeddings, activations, softmax,
//!   GEMM, KV-cache append, and online-softmax attention
//!
//! Every operator is synchronous from the caller's perspective. The only
//! threads ever spawned are the workers inside a single multi-threaded
//! GEMM call, which partition the output rows disjointly and join before
//! the call returns. Kernels borrow their buffers for the duration of the
//! call and hold no state afterwards; the only global knobs are the
//! capability record (probed once) and the worker-thread count.

pub mod activation;
pub mod attention;
pub mod caps;
pub mod convert;
pub mod dtype;
pub mod embedding;
pub mod gemm;
pub mod kv_cache;
#[cfg(target_arch = "aarch64")]
pub(crate) mod mathfun;
pub mod norm;
pub mod rope;
pub mod softmax;
pub mod threads;

// Re-export primary types at the crate root for convenience.
pub use caps::{caps, CpuCaps};
pub use dtype::{DType, Element};
pub use rope::RopeStyle;
pub use threads::{num_threads, set_num_threads};
