//! Token sampling: temperature scaling + top-p (nucleus) sampling
//!
//! Temperature 0 short-circuits to argmax. Otherwise logits are scaled,
//! softmaxed, optionally truncated to the smallest set of tokens whose
//! cumulative probability exceeds `top_p`, and drawn by inverse CDF. On
//! numerical underflow the draw falls back to the last in-nucleus index.

use std::cell::Cell;

use crate::inference::ops;

pub struct Sampler {
    temperature: f32,
    top_p: f32,
    rng_state: Cell<u64>,
}

impl Sampler {
    /// A sampler with an explicit seed so runs are reproducible.
    pub fn new(temperature: f32, top_p: f32, seed: u64) -> Self {
        let mut state = seed ^ 0x517cc1b727220a95;
        if state == 0 {
            state = 0x9e3779b97f4a7c15;
        }
        Self {
            temperature,
            top_p,
            rng_state: Cell::new(state),
        }
    }

    /// Sample a token id from raw logits. Scales and softmaxes in place.
    pub fn sample(&self, logits: &mut [f32]) -> u32 {
        if self.temperature == 0.0 {
            return argmax(logits) as u32;
        }

        for l in logits.iter_mut() {
            *l /= self.temperature;
        }
        ops::softmax(logits);

        let r = self.random_f32();

        if self.top_p > 0.0 && self.top_p < 1.0 {
            // Sort indices by probability, descending
            let mut probs: Vec<(usize, f32)> =
                logits.iter().enumerate().map(|(i, &p)| (i, p)).collect();
            probs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

            // Cutoff: smallest prefix whose mass exceeds top_p
            let mut cum_prob = 0.0f32;
            let mut last_idx = probs.len() - 1;
            for (i, &(_, p)) in probs.iter().enumerate() {
                cum_prob += p;
                if cum_prob > self.top_p {
                    last_idx = i;
                    break;
                }
            }

            // Inverse CDF over the nucleus, scaled to its mass
            let r_scaled = r * cum_prob;
            let mut cdf = 0.0f32;
            for &(idx, p) in &probs[..=last_idx] {
                cdf += p;
                if r_scaled < cdf {
                    return idx as u32;
                }
            }
            probs[last_idx].0 as u32
        } else {
            let mut cdf = 0.0f32;
            for (i, &p) in logits.iter().enumerate() {
                cdf += p;
                if r < cdf {
                    return i as u32;
                }
            }
            (logits.len() - 1) as u32
        }
    }

    /// xorshift64 PRNG returning f32 in [0, 1)
    fn random_f32(&self) -> f32 {
        let mut state = self.rng_state.get();
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        self.rng_state.set(state);
        ((state >> 11) as f64 / (1u64 << 53) as f64) as f32
    }
}

fn argmax(v: &[f32]) -> usize {
    v.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}
