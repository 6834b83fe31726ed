use crate::sampler::{sort_descending, Sampler, TokenLogit};

/// Keeps only the top K tokens by logit value, discarding the rest.
/// `k == 0` disables the filter.
pub struct TopKSampler {
    k: usize,
}

impl TopKSampler {
    /// Create a new top-K sampler that retains the `k` highest-logit tokens.
    pub fn new(k: usize) -> Self {
        Self { k }
    }
}

impl Sampler for TopKSampler {
    fn name(&self) -> &str {
        "top_k"
    }

    fn apply(&mut self, logits: &mut Vec<TokenLogit>) {
        if self.k == 0 || self.k >= logits.len() {
            return;
        }
        sort_descending(logits);
        logits.truncate(self.k);
    }
}
