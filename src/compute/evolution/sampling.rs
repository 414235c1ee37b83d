//! Weighted random sampling used by the selector.

use rand::distributions::{Distribution, WeightedIndex};
use rand::prelude::*;

/// Random number generator wrapper for selection.
pub struct SelectionRng {
    rng: StdRng,
}

impl SelectionRng {
    /// Create from seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Create with random seed.
    pub fn random() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Seeded when a seed is given, random otherwise.
    pub fn from_seed(seed: Option<u64>) -> Self {
        seed.map(Self::new).unwrap_or_else(Self::random)
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Derive an independent seed, e.g. for a child generator.
    pub fn next_seed(&mut self) -> u64 {
        self.rng.r#gen()
    }
}

fn sanitize(weight: f32) -> f32 {
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        0.0
    }
}

/// Draw one index proportionally to `weights`.
///
/// Negative and non-finite weights count as zero. When no weight is
/// positive the draw is uniform. Returns `None` only for an empty slice.
pub fn weighted_index<R: Rng + ?Sized>(weights: &[f32], rng: &mut R) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    match WeightedIndex::new(weights.iter().map(|&w| sanitize(w))) {
        Ok(dist) => Some(dist.sample(rng)),
        Err(_) => Some(rng.gen_range(0..weights.len())),
    }
}

/// Draw up to `k` distinct indices, each draw proportional to the weights of
/// the indices not yet drawn.
pub fn weighted_sample_indices<R: Rng + ?Sized>(
    weights: &[f32],
    k: usize,
    rng: &mut R,
) -> Vec<usize> {
    weighted_sample_with(weights.len(), k, rng, |i, _| weights[i])
        .into_iter()
        .map(|(i, _)| i)
        .collect()
}

/// Draw up to `k` distinct indices out of `0..n` without replacement.
///
/// Before every draw, `weight(i, picked)` is asked for the weight of each
/// remaining index given the indices drawn so far, so weights may depend on
/// earlier picks. Returns each drawn index with the weight it was drawn at.
pub fn weighted_sample_with<R, F>(n: usize, k: usize, rng: &mut R, mut weight: F) -> Vec<(usize, f32)>
where
    R: Rng + ?Sized,
    F: FnMut(usize, &[usize]) -> f32,
{
    let mut remaining: Vec<usize> = (0..n).collect();
    let mut picked: Vec<usize> = Vec::with_capacity(k.min(n));
    let mut drawn = Vec::with_capacity(k.min(n));

    while picked.len() < k && !remaining.is_empty() {
        let pool: Vec<f32> = remaining.iter().map(|&i| weight(i, &picked)).collect();
        let Some(slot) = weighted_index(&pool, rng) else {
            break;
        };
        let index = remaining.swap_remove(slot);
        picked.push(index);
        drawn.push((index, pool[slot]));
    }
    drawn
}

/// Weighted sampling without replacement over arbitrary candidates.
///
/// Deterministic for a given seeded `rng`. Returns `min(k, candidates.len())`
/// distinct candidates; `weights` shorter than `candidates` pad with zero.
pub fn weighted_sample_without_replacement<'a, T, R: Rng + ?Sized>(
    candidates: &'a [T],
    weights: &[f32],
    k: usize,
    rng: &mut R,
) -> Vec<&'a T> {
    let padded: Vec<f32> = (0..candidates.len())
        .map(|i| weights.get(i).copied().unwrap_or(0.0))
        .collect();
    weighted_sample_indices(&padded, k, rng)
        .into_iter()
        .map(|i| &candidates[i])
        .collect()
}
