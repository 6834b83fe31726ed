use crate::sampler::{softmax_probs, Sampler, TokenLogit};

/// Drops every token whose probability falls below `min_p` times the
/// probability of the most likely token. `min_p <= 0` disables the
/// filter.
pub struct MinPSampler {
    min_p: f32,
}

impl MinPSampler {
    /// Create a new min-p sampler with the given relative threshold.
    pub fn new(min_p: f32) -> Self {
        Self { min_p }
    }
}

impl Sampler for MinPSampler {
    fn name(&self) -> &str {
        "min_p"
    }

    fn apply(&mut self, logits: &mut Vec<TokenLogit>) {
        if logits.is_empty() || self.min_p <= 0.0 {
            return;
        }

        let probs = softmax_probs(logits);
        let max_prob = probs.iter().copied().fold(0.0f32, f32::max);
        let floor = self.min_p * max_prob;

        let mut i = 0;
        logits.retain(|_| {
            let keep = probs[i] >= floor;
            i += 1;
            keep
        });
    }
}
