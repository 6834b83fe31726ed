/// A token ID paired with its logit value.
#[derive(Debug, Clone)]
pub struct TokenLogit {
    pub token_id: u32,
    pub logit: f32,
}

/// Trait for samplers that modify or select from a set of token logits.
///
/// Filters shrink or rescale the candidate set; selectors (greedy, or
/// the categorical draw) reduce it to a single survivor. Selectors carry
/// RNG state, so `apply` takes `&mut self`.
pub trait Sampler: Send + Sync {
    /// Returns the name of this sampler.
    fn name(&self) -> &str;

    /// Modify logits in-place (filtering, scaling, selecting).
    fn apply(&mut self, logits: &mut Vec<TokenLogit>);
}

/// Composes multiple samplers into a pipeline. The last sampler in the
/// chain should be a selector ([`crate::GreedySampler`] or
/// [`crate::DistSampler`]) so that one candidate survives.
pub struct SamplerChain<'a> {
    samplers: Vec<Box<dyn Sampler + 'a>>,
}

impl<'a> SamplerChain<'a> {
    /// Create a new empty sampler chain.
    pub fn new() -> Self {
        Self {
            samplers: Vec::new(),
        }
    }

    /// Add a sampler to the end of the chain. Returns self for
    /// builder-style usage.
    pub fn with(mut self, sampler: Box<dyn Sampler + 'a>) -> Self {
        self.samplers.push(sampler);
        self
    }

    /// Converts raw logits into `TokenLogit` candidates (token_id =
    /// index) and applies each sampler in sequence, returning the
    /// surviving candidates.
    pub fn run(&mut self, logits: &[f32]) -> Vec<TokenLogit> {
        let mut candidates: Vec<TokenLogit> = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| TokenLogit {
                token_id: i as u32,
                logit,
            })
            .collect();

        for sampler in &mut self.samplers {
            sampler.apply(&mut candidates);
        }

        candidates
    }

    /// Runs the chain and returns the first surviving token's id.
    pub fn sample(&mut self, logits: &[f32]) -> u32 {
        self.run(logits).first().map(|t| t.token_id).unwrap_or(0)
    }
}

impl Default for SamplerChain<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Sorts candidates descending by logit; ties keep index order.
pub(crate) fn sort_descending(logits: &mut [TokenLogit]) {
    logits.sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));
}

/// Softmax over the candidates' logits, in candidate order.
pub(crate) fn softmax_probs(logits: &[TokenLogit]) -> Vec<f32> {
    let max_logit = logits.iter().map(|t| t.logit).fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|t| (t.logit - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}
