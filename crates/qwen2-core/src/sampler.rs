//! Next-token sampling strategies: greedy argmax, temperature-scaled
//! categorical, and top-p (nucleus).
//!
//! Top-p avoids sorting the entire vocabulary: logits above a cutoff
//! derived from the temperature-scaled distribution are pushed onto a
//! max-heap and popped in descending order until the cumulative mass
//! exceeds `top_p`, so only as many elements as the nucleus actually
//! needs are ever ordered.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::tensor;

/// The RNG behind categorical/top-p draws. Seeded when the caller passes
/// `--seed`, so `qwen2 --seed 42` reproduces the same generation twice;
/// otherwise falls back to the thread-local RNG like most CLI tools do
/// when the user hasn't asked for reproducibility.
enum SamplerRng {
    Seeded(RefCell<StdRng>),
    Thread,
}

impl SamplerRng {
    fn next_unit(&self) -> f32 {
        match self {
            SamplerRng::Seeded(rng) => rng.borrow_mut().r#gen(),
            SamplerRng::Thread => rand::thread_rng().r#gen(),
        }
    }
}

/// How a token is picked from a distribution over logits.
#[derive(Debug, Clone, Copy)]
pub enum SamplingStrategy {
    /// Always pick the highest-probability token.
    Greedy,
    /// Temperature-scaled softmax, then sample from the full distribution.
    Categorical { temperature: f32 },
    /// Temperature-scaled softmax, then sample from the smallest prefix
    /// of tokens (sorted by probability) whose mass exceeds `top_p`.
    TopP { temperature: f32, top_p: f32 },
}

/// Optional penalty applied to already-generated tokens before sampling.
/// Disabled by default — Qwen2's own sampling recipe does not apply one,
/// but exposing the knob costs nothing and some front ends want it.
#[derive(Debug, Clone, Copy)]
pub struct RepeatPenalty {
    pub penalty: f32,
    pub last_n: usize,
}

impl Default for RepeatPenalty {
    fn default() -> Self {
        Self { penalty: 1.0, last_n: 64 }
    }
}

impl RepeatPenalty {
    pub fn is_enabled(&self) -> bool {
        self.penalty != 1.0
    }

    fn apply(&self, logits: &mut [f32], history: &[u32]) {
        if !self.is_enabled() {
            return;
        }
        let n = history.len().min(self.last_n);
        for &token_id in &history[history.len() - n..] {
            if let Some(logit) = logits.get_mut(token_id as usize) {
                *logit = if *logit > 0.0 { *logit / self.penalty } else { *logit * self.penalty };
            }
        }
    }
}

pub struct Sampler {
    strategy: SamplingStrategy,
    repeat_penalty: RepeatPenalty,
    rng: SamplerRng,
}

impl Sampler {
    pub fn new(strategy: SamplingStrategy) -> Self {
        Self { strategy, repeat_penalty: RepeatPenalty::default(), rng: SamplerRng::Thread }
    }

    pub fn with_repeat_penalty(mut self, repeat_penalty: RepeatPenalty) -> Self {
        self.repeat_penalty = repeat_penalty;
        self
    }

    /// Replace the RNG with one seeded from `seed`, making every
    /// categorical/top-p draw this sampler makes reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SamplerRng::Seeded(RefCell::new(StdRng::seed_from_u64(seed)));
        self
    }

    /// Pick the next token from `logits`, mutating them in place
    /// (penalty application, temperature scaling, softmax all happen
    /// destructively — callers must not reuse `logits` after this call).
    pub fn sample(&self, logits: &mut [f32], history: &[u32]) -> u32 {
        self.repeat_penalty.apply(logits, history);

        match self.strategy {
            SamplingStrategy::Greedy => tensor::argmax(logits) as u32,
            SamplingStrategy::Categorical { temperature } => {
                scale_by_temperature(logits, temperature);
                tensor::softmax(logits);
                self.sample_categorical(logits)
            }
            SamplingStrategy::TopP { temperature, top_p } => {
                scale_by_temperature(logits, temperature);
                tensor::softmax(logits);
                self.sample_top_p(logits, top_p)
            }
        }
    }

    /// Draw one index from a probability distribution that sums to ~1.
    fn sample_categorical(&self, probs: &[f32]) -> u32 {
        let r = self.rng.next_unit();
        let mut cumulative = 0.0f32;
        for (i, &p) in probs.iter().enumerate() {
            cumulative += p;
            if r < cumulative {
                return i as u32;
            }
        }
        (probs.len() - 1) as u32
    }

    /// Nucleus sampling: pop the heap in descending-probability order,
    /// accumulating mass until it exceeds `top_p`, then draw uniformly
    /// over that prefix re-normalized to sum to 1.
    fn sample_top_p(&self, probs: &[f32], top_p: f32) -> u32 {
        if top_p >= 1.0 {
            return self.sample_categorical(probs);
        }

        let mut heap: BinaryHeap<ScoredIndex> =
            probs.iter().enumerate().map(|(index, &prob)| ScoredIndex { prob, index }).collect();

        let mut nucleus = Vec::new();
        let mut cumulative = 0.0f32;
        while cumulative < top_p {
            match heap.pop() {
                Some(scored) => {
                    cumulative += scored.prob;
                    nucleus.push(scored);
                }
                None => break,
            }
        }

        let r = self.rng.next_unit() * cumulative;
        let mut running = 0.0f32;
        for scored in &nucleus {
            running += scored.prob;
            if r < running {
                return scored.index as u32;
            }
        }
        nucleus.last().map(|s| s.index as u32).unwrap_or(0)
    }
}

fn scale_by_temperature(logits: &mut [f32], temperature: f32) {
    if temperature > 0.0 && temperature != 1.0 {
        let inv = 1.0 / temperature;
        for v in logits.iter_mut() {
            *v *= inv;
        }
    }
}

#[derive(PartialEq)]
struct ScoredIndex {
    prob: f32,
    index: usize,
}

impl Eq for ScoredIndex {}

impl PartialOrd for ScoredIndex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredIndex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.prob.partial_cmp(&other.prob).unwrap_or(Ordering::Equal)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_picks_argmax() {
        let mut logits = vec![0.1, 0.9, 0.3];
        let sampler = Sampler::new(SamplingStrategy::Greedy);
        assert_eq!(sampler.sample(&mut logits, &[]), 1);
    }

    #[test]
    fn top_p_one_degenerates_to_categorical_support() {
        let mut logits = vec![10.0, 0.0, 0.0, 0.0];
        let sampler = Sampler::new(SamplingStrategy::TopP { temperature: 1.0, top_p: 1.0 });
        // With one dominant logit, nearly every draw should land on index 0.
        let mut hits = 0;
        for _ in 0..50 {
            let mut l = logits.clone();
            if sampler.sample(&mut l, &[]) == 0 {
                hits += 1;
            }
        }
        assert!(hits > 40);
        let _ = &mut logits;
    }

    #[test]
    fn repeat_penalty_disabled_by_default_is_noop() {
        let penalty = RepeatPenalty::default();
        assert!(!penalty.is_enabled());
        let mut logits = vec![1.0, 2.0, 3.0];
        let before = logits.clone();
        penalty.apply(&mut logits, &[0, 1, 2]);
        assert_eq!(logits, before);
    }

    #[test]
    fn repeat_penalty_dampens_seen_tokens() {
        let penalty = RepeatPenalty { penalty: 1.5, last_n: 64 };
        let mut logits = vec![4.0, 4.0];
        penalty.apply(&mut logits, &[0]);
        assert!((logits[0] - 4.0 / 1.5).abs() < 1e-6);
        assert_eq!(logits[1], 4.0);
    }

    #[test]
    fn same_seed_draws_the_same_sequence() {
        let logits = vec![1.0, 1.0, 1.0, 1.0, 1.0];
        let draw = |seed| {
            let sampler = Sampler::new(SamplingStrategy::Categorical { temperature: 1.0 }).with_seed(seed);
            (0..10).map(|_| sampler.sample(&mut logits.clone(), &[])).collect::<Vec<_>>()
        };
        assert_eq!(draw(42), draw(42));
    }
}
