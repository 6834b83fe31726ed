use crate::sampler::{softmax_probs, sort_descending, Sampler, TokenLogit};

/// Nucleus sampling: keeps the smallest descending-probability prefix
/// whose cumulative probability first reaches `p`. `p >= 1` disables
/// the filter.
pub struct TopPSampler {
    p: f32,
}

impl TopPSampler {
    /// Create a new top-p (nucleus) sampler with the given probability
    /// threshold.
    pub fn new(p: f32) -> Self {
        Self { p }
    }
}

impl Sampler for TopPSampler {
    fn name(&self) -> &str {
        "top_p"
    }

    fn apply(&mut self, logits: &mut Vec<TokenLogit>) {
        if logits.is_empty() || self.p >= 1.0 {
            return;
        }

        sort_descending(logits);
        let probs = softmax_probs(logits);

        let mut cumulative = 0.0f32;
        let mut cutoff = logits.len();
        for (i, &prob) in probs.iter().enumerate() {
            cumulative += prob;
            if cumulative >= self.p {
                cutoff = i + 1;
                break;
            }
        }

        // Always keep at least one token.
        logits.truncate(cutoff.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(logits: &[f32]) -> Vec<TokenLogit> {
        logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| TokenLogit { token_id: i as u32, logit })
            .collect()
    }

    #[test]
    fn test_keeps_smallest_covering_prefix() {
        // Probabilities ~ [0.64, 0.24, 0.09, 0.03]; p = 0.6 keeps one.
        let mut c = candidates(&[4.0, 3.0, 2.0, 1.0]);
        TopPSampler::new(0.6).apply(&mut c);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].token_id, 0);
    }

    #[test]
    fn test_wider_threshold_keeps_more() {
        let mut c = candidates(&[4.0, 3.0, 2.0, 1.0]);
        TopPSampler::new(0.85).apply(&mut c);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_p_one_disables() {
        let mut c = candidates(&[1.0, 2.0, 3.0]);
        TopPSampler::new(1.0).apply(&mut c);
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn test_always_keeps_one() {
        let mut c = candidates(&[5.0, 0.0]);
        TopPSampler::new(1e-9).apply(&mut c);
        assert_eq!(c.len(), 1);
    }
}
