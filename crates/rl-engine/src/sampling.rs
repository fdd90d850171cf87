//! Random draws and confidence estimates shared by the bandit selector and
//! the Q-learning agent.

use rand::Rng;
use rand_distr::{Distribution, Gamma};

/// z-score for a 95% Wilson interval.
pub const WILSON_Z: f64 = 1.96;

/// Gamma shapes below this are floored so that statistics with
/// `rewards > pulls` still produce a valid Beta posterior.
const MIN_SHAPE: f64 = 1e-3;

/// True with probability `epsilon`. Never true for `epsilon <= 0`.
pub fn explore<R: Rng + ?Sized>(rng: &mut R, epsilon: f64) -> bool {
    epsilon > 0.0 && rng.gen::<f64>() < epsilon
}

/// Uniform index in `0..len`. `len` must be non-zero.
pub fn uniform_index<R: Rng + ?Sized>(rng: &mut R, len: usize) -> usize {
    rng.gen_range(0..len)
}

/// Index of the largest score. Ties resolve to the lowest index.
pub fn argmax_first<I>(scores: I) -> Option<usize>
where
    I: IntoIterator<Item = f64>,
{
    let mut best: Option<(usize, f64)> = None;
    for (idx, score) in scores.into_iter().enumerate() {
        match best {
            Some((_, best_score)) if score <= best_score || score.is_nan() => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// One Gamma(shape, 1) variate (Marsaglia–Tsang inside `rand_distr`).
pub fn sample_gamma<R: Rng + ?Sized>(rng: &mut R, shape: f64) -> f64 {
    let shape = if shape.is_finite() {
        shape.max(MIN_SHAPE)
    } else {
        MIN_SHAPE
    };
    match Gamma::new(shape, 1.0) {
        Ok(gamma) => gamma.sample(rng),
        Err(_) => shape,
    }
}

/// One Beta(alpha, beta) variate built from two independent Gamma draws.
pub fn sample_beta<R: Rng + ?Sized>(rng: &mut R, alpha: f64, beta: f64) -> f64 {
    let x = sample_gamma(rng, alpha);
    let y = sample_gamma(rng, beta);
    let total = x + y;
    if total > 0.0 && total.is_finite() {
        x / total
    } else {
        // Both draws underflowed; fall back to the posterior mean.
        let a = alpha.max(MIN_SHAPE);
        let b = beta.max(MIN_SHAPE);
        a / (a + b)
    }
}

/// Lower bound of the Wilson score interval for an observed rate `avg`
/// over `n` trials. Zero when nothing has been observed.
pub fn wilson_lower_bound(avg: f64, n: u64) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    let z2 = WILSON_Z * WILSON_Z;

    let center = avg + z2 / (2.0 * n);
    // Rewards outside [0, 1] can push the variance term negative.
    let radicand = ((avg * (1.0 - avg) + z2 / (4.0 * n)) / n).max(0.0);
    let margin = WILSON_Z * radicand.sqrt();
    let denominator = 1.0 + z2 / n;

    (center - margin) / denominator
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_argmax_prefers_first_on_ties() {
        assert_eq!(argmax_first(vec![0.2, 0.5, 0.5, 0.1]), Some(1));
        assert_eq!(argmax_first(vec![0.0, 0.0]), Some(0));
        assert_eq!(argmax_first(Vec::<f64>::new()), None);
        assert_eq!(argmax_first(vec![-3.0, -1.0, -2.0]), Some(1));
    }

    #[test]
    fn test_wilson_lower_bound_known_values() {
        assert_eq!(wilson_lower_bound(0.0, 0), 0.0);

        // 10 successes out of 10 trials.
        let lb = wilson_lower_bound(1.0, 10);
        assert!((lb - 0.7225).abs() < 1e-3, "got {lb}");

        // 50% over 100 trials.
        let lb = wilson_lower_bound(0.5, 100);
        assert!((lb - 0.4038).abs() < 1e-3, "got {lb}");

        // Bound tightens with more evidence.
        assert!(wilson_lower_bound(0.8, 1000) > wilson_lower_bound(0.8, 10));
    }

    #[test]
    fn test_wilson_handles_rewards_above_one() {
        let lb = wilson_lower_bound(5.0, 3);
        assert!(lb.is_finite());
    }

    #[test]
    fn test_beta_samples_stay_in_unit_interval() {
        let mut rng = StdRng::seed_from_u64(7);
        for (a, b) in [(1.0, 1.0), (51.0, 1.0), (1.0, 51.0), (0.5, 2.5), (3.0, -4.0)] {
            for _ in 0..200 {
                let x = sample_beta(&mut rng, a, b);
                assert!((0.0..=1.0).contains(&x), "Beta({a}, {b}) produced {x}");
            }
        }
    }

    #[test]
    fn test_beta_sample_mean_tracks_posterior() {
        let mut rng = StdRng::seed_from_u64(42);
        let draws = 5_000;
        let mean: f64 = (0..draws)
            .map(|_| sample_beta(&mut rng, 8.0, 2.0))
            .sum::<f64>()
            / draws as f64;
        assert!((mean - 0.8).abs() < 0.02, "mean {mean}");
    }

    #[test]
    fn test_explore_respects_zero_and_one() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!((0..1000).all(|_| !explore(&mut rng, 0.0)));
        assert!((0..1000).all(|_| explore(&mut rng, 1.0)));
    }
}
