//! `ni-sampler` - token sampling for nanoinfer.
//!
//! Logit filters (temperature, top-k, top-p, min-p) and the two
//! selectors (greedy argmax, seeded categorical draw) compose through
//! the [`Sampler`] trait and [`SamplerChain`]. [`sample`] builds and
//! runs the standard chain over raw logits, and [`prob`] inspects a
//! single post-softmax probability without sampling.

pub mod categorical;
pub mod greedy;
pub mod min_p;
pub mod sampler;
pub mod temperature;
pub mod top_k;
pub mod top_p;

pub use categorical::{prob, sample, SamplingRng};
pub use greedy::{DistSampler, GreedySampler};
pub use min_p::MinPSampler;
pub use sampler::{Sampler, SamplerChain, TokenLogit};
pub use temperature::TemperatureSampler;
pub use top_k::TopKSampler;
pub use top_p::TopPSampler;
