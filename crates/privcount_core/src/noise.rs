//! Per-round Gaussian noise draws (§4.3).
//!
//! Each DC draws noise exactly once per (counter, bin) at round start, using
//! the Box-Muller transform over a CSPRNG. The per-DC multiplier is
//! `sqrt(w_d)`, not `w_d`: with independent draws `Z_d ~ N(0,1)`,
//! `Var(sum_d sqrt(w_d) * sigma * Z_d) = sigma^2 * sum_d w_d = sigma^2` when
//! `sum_d w_d = 1`, matching the round-trip law in §8 that the aggregate
//! noise must distribute as `N(0, sigma^2)` regardless of DC count.

use num_bigint::BigInt;
use rand_core::{CryptoRng, RngCore};

use crate::field::Fe;

/// Draws one standard-normal sample via Box-Muller, consuming two uniform
/// draws from `rng`. Two draws are produced per call upstream in practice,
/// but PrivCount needs one independent draw per bin so we only keep `z0`.
fn standard_normal<R: RngCore + CryptoRng>(rng: &mut R) -> f64 {
    let u1 = uniform_open(rng);
    let u2 = (rng.next_u64() as f64) / (u64::MAX as f64);
    let r = (-2.0 * u1.ln()).sqrt();
    let theta = 2.0 * std::f64::consts::PI * u2;
    r * theta.cos()
}

/// Uniform draw in `(0, 1]`, avoiding the `ln(0)` singularity at the Box-
/// Muller transform's boundary.
fn uniform_open<R: RngCore + CryptoRng>(rng: &mut R) -> f64 {
    let u = (rng.next_u64() as f64) / (u64::MAX as f64);
    if u < 1e-10 {
        1e-10
    } else {
        u
    }
}

/// Draws `n_c = round(sigma_c * sqrt(w_d) * Z)` for one (counter, bin) and
/// reduces it into Z_q (negative draws become `q + n_c`, §4.3).
pub fn draw_noise<R: RngCore + CryptoRng>(rng: &mut R, sigma: f64, weight: f64) -> Fe {
    let z = standard_normal(rng);
    let n = (sigma * weight.sqrt() * z).round() as i64;
    Fe::from_signed(&BigInt::from(n))
}

/// Draws noise for every bin of a counter in one pass, or `None` bins
/// (all-zero) if the counter does not require noise.
pub fn draw_noise_for_counter<R: RngCore + CryptoRng>(
    rng: &mut R,
    sigma: f64,
    weight: f64,
    bin_count: usize,
    noise_required: bool,
) -> Vec<Fe> {
    if !noise_required || sigma == 0.0 {
        return vec![Fe::zero(); bin_count.max(1)];
    }
    (0..bin_count.max(1))
        .map(|_| draw_noise(rng, sigma, weight))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use num_traits::FromPrimitive;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn ensure_modulus() {
        let _ = crate::field::set_modulus(BigUint::from_u64(1u64 << 62).unwrap());
    }

    #[test]
    fn zero_sigma_yields_zero_noise() {
        ensure_modulus();
        let mut rng = ChaCha20Rng::from_seed([7u8; 32]);
        let bins = draw_noise_for_counter(&mut rng, 0.0, 1.0, 3, true);
        assert!(bins.iter().all(|b| b.is_zero()));
    }

    #[test]
    fn aggregate_noise_matches_target_variance() {
        ensure_modulus();
        let mut rng = ChaCha20Rng::from_seed([11u8; 32]);
        let sigma = 10.0;
        let weights = [0.5, 0.3, 0.2];
        let trials = 2000;
        let mut samples = Vec::with_capacity(trials);
        for _ in 0..trials {
            let mut total = BigInt::from(0);
            for w in weights {
                let fe = draw_noise(&mut rng, sigma, w);
                total += fe.to_signed();
            }
            samples.push(total);
        }
        let mean: f64 =
            samples.iter().map(|v| v.to_string().parse::<f64>().unwrap()).sum::<f64>()
                / trials as f64;
        assert!(mean.abs() < 2.0, "mean {mean} should be near 0");
        let variance: f64 = samples
            .iter()
            .map(|v| {
                let x = v.to_string().parse::<f64>().unwrap() - mean;
                x * x
            })
            .sum::<f64>()
            / trials as f64;
        let stddev = variance.sqrt();
        assert!(
            (stddev - sigma).abs() < sigma * 0.15,
            "stddev {stddev} should be within 15% of sigma {sigma}"
        );
    }
}
