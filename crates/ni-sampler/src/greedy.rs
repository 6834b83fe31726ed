use crate::categorical::SamplingRng;
use crate::sampler::{softmax_probs, sort_descending, Sampler, TokenLogit};

/// Greedy selector: keeps the single token with the highest logit.
pub struct GreedySampler;

impl GreedySampler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GreedySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for GreedySampler {
    fn name(&self) -> &str {
        "greedy"
    }

    fn apply(&mut self, logits: &mut Vec<TokenLogit>) {
        if logits.is_empty() {
            return;
        }
        sort_descending(logits);
        logits.truncate(1);
    }
}

/// Categorical selector: softmax over the surviving candidates, then an
/// inverse-CDF draw against a uniform from the borrowed RNG. The RNG
/// state advances across applications, so one generation loop threads a
/// single seeded stream through every step.
pub struct DistSampler<'a> {
    rng: &'a mut SamplingRng,
}

impl<'a> DistSampler<'a> {
    pub fn new(rng: &'a mut SamplingRng) -> Self {
        Self { rng }
    }
}

impl Sampler for DistSampler<'_> {
    fn name(&self) -> &str {
        "dist"
    }

    fn apply(&mut self, logits: &mut Vec<TokenLogit>) {
        if logits.is_empty() {
            return;
        }

        let probs = softmax_probs(logits);
        let u = self.rng.next_f32();

        let mut selected = logits.len() - 1;
        let mut cumulative = 0.0f32;
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p;
            if u < cumulative {
                selected = i;
                break;
            }
        }
        // Rounding can leave the cumulative sum a hair under u; the
        // last candidate absorbs the remainder.

        let survivor = logits[selected].clone();
        logits.clear();
        logits.push(survivor);
    }
}
