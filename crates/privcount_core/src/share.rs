//! Blinding-share generation and the `S_{d,c,b} = sum_s r_{d,s,c,b}` sum a DC
//! uses to mask its local counts (§3 "Share", §4.2).

use rand_core::{CryptoRng, RngCore};
use std::collections::BTreeMap;

use crate::counter::CounterDef;
use crate::field::Fe;

/// One DC's blinding payload destined for a single SK: `r_{s,c,b}` for every
/// (counter, bin) this round defines.
#[derive(Debug, Clone)]
pub struct SkSharePayload {
    pub to_sk: String,
    pub shares: BTreeMap<String, Vec<Fe>>,
}

/// Samples a fresh uniform share per (SK, counter, bin) and returns both the
/// per-SK payloads (step 1-2 of §4.2) and the DC's own `S_{d,c,b}` sum used
/// by [`crate::counter::CounterStore::initialize`].
pub fn generate_shares<R: RngCore + CryptoRng>(
    rng: &mut R,
    sk_ids: &[String],
    defs: &[CounterDef],
) -> (Vec<SkSharePayload>, BTreeMap<String, Vec<Fe>>) {
    let mut per_sk: Vec<SkSharePayload> = sk_ids
        .iter()
        .map(|sk| SkSharePayload {
            to_sk: sk.clone(),
            shares: BTreeMap::new(),
        })
        .collect();
    let mut sums: BTreeMap<String, Vec<Fe>> = BTreeMap::new();

    for def in defs {
        let bin_count = def.bins.len().max(1);
        let mut counter_sums = vec![Fe::zero(); bin_count];
        for payload in per_sk.iter_mut() {
            let bins: Vec<Fe> = (0..bin_count).map(|_| Fe::sample_uniform(rng)).collect();
            for (b, share) in bins.iter().enumerate() {
                counter_sums[b] = counter_sums[b].add(share);
            }
            payload.shares.insert(def.name.clone(), bins);
        }
        sums.insert(def.name.clone(), counter_sums);
    }

    (per_sk, sums)
}

/// An SK's running per-DC accumulation. The SK sums every DC's share for a
/// counter/bin as envelopes arrive; at round end this *is* `share_sum`.
#[derive(Debug, Default)]
pub struct ShareAccumulator {
    sums: BTreeMap<String, Vec<Fe>>,
}

impl ShareAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, payload: &BTreeMap<String, Vec<Fe>>) {
        for (counter, bins) in payload {
            let entry = self
                .sums
                .entry(counter.clone())
                .or_insert_with(|| vec![Fe::zero(); bins.len()]);
            for (b, share) in bins.iter().enumerate() {
                entry[b] = entry[b].add(share);
            }
        }
    }

    pub fn share_sum(&self) -> BTreeMap<String, Vec<Fe>> {
        self.sums.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{Bin, CounterKind};
    use num_bigint::BigUint;
    use num_traits::FromPrimitive;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn ensure_modulus() {
        let _ = crate::field::set_modulus(BigUint::from_u64(1u64 << 61).unwrap());
    }

    fn scalar_def(name: &str) -> CounterDef {
        CounterDef {
            name: name.into(),
            kind: CounterKind::Scalar,
            bins: vec![Bin::scalar()],
            sigma: 0.0,
            noise_required: false,
        }
    }

    #[test]
    fn masking_cancellation_across_multiple_sks() {
        ensure_modulus();
        let mut rng = ChaCha20Rng::from_seed([3u8; 32]);
        let defs = vec![scalar_def("TestCounter")];
        let sks: Vec<String> = vec!["sk-a".into(), "sk-b".into(), "sk-c".into()];

        let (payloads, dc_sum) = generate_shares(&mut rng, &sks, &defs);

        let mut accumulators: BTreeMap<String, ShareAccumulator> =
            sks.iter().map(|s| (s.clone(), ShareAccumulator::new())).collect();
        for payload in &payloads {
            accumulators
                .get_mut(&payload.to_sk)
                .unwrap()
                .accumulate(&payload.shares);
        }

        // Sum of every SK's accumulated share_sum must equal the DC's S_{d,c,b}.
        let mut total = Fe::zero();
        for acc in accumulators.values() {
            total = total.add(&acc.share_sum()["TestCounter"][0]);
        }
        assert_eq!(total, dc_sum["TestCounter"][0]);
    }
}
