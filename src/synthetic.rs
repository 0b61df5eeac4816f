//! Seeded synthetic series for demos and tests.
//!
//! All randomness lives here, outside the scoring path. Callers that want
//! "realistic" noise generate it before handing samples to the engine.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

/// Standard normal draw (Box-Muller).
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Independent gaussian samples around `mean`.
pub fn white_noise(seed: u64, n: usize, mean: f64, std: f64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| mean + std * gaussian(&mut rng)).collect()
}

/// Cumulative sum of gaussian steps starting at `start`.
pub fn random_walk(seed: u64, n: usize, start: f64, step_std: f64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x = start;
    (0..n)
        .map(|_| {
            x += step_std * gaussian(&mut rng);
            x
        })
        .collect()
}

/// AR(1) process: `x[t] = phi * x[t-1] + noise`, shifted by `mean`.
///
/// Raising `phi` towards 1 mimics critical slowing down.
pub fn ar1(seed: u64, n: usize, mean: f64, phi: f64, noise_std: f64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x = 0.0;
    (0..n)
        .map(|_| {
            x = phi * x + noise_std * gaussian(&mut rng);
            mean + x
        })
        .collect()
}

/// `baseline_len` samples at `base`, followed by `spike_len` at `base * factor`.
pub fn step_spike(baseline_len: usize, spike_len: usize, base: f64, factor: f64) -> Vec<f64> {
    let mut out = vec![base; baseline_len];
    out.extend(std::iter::repeat(base * factor).take(spike_len));
    out
}

/// Add gaussian jitter with the given relative amplitude.
pub fn jitter(seed: u64, values: &[f64], relative: f64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    values
        .iter()
        .map(|v| v * (1.0 + relative * gaussian(&mut rng)))
        .collect()
}
