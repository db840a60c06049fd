//! Counter and histogram data model (§3, §4.1).

use crate::field::Fe;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// A half-open bin `[lo, hi)`. The last bin of a histogram may be closed
/// (`hi = +inf`), in which case a value of `+inf` belongs to it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    pub lo: f64,
    pub hi: f64,
}

impl Bin {
    pub fn scalar() -> Self {
        Bin {
            lo: f64::NEG_INFINITY,
            hi: f64::INFINITY,
        }
    }

    fn contains(&self, v: f64) -> bool {
        if v == f64::INFINITY && self.hi == f64::INFINITY {
            return true;
        }
        v >= self.lo && v < self.hi
    }
}

/// What a counter's bins were generated from. `TrafficModel` counters are
/// materialized by [`crate::traffic_model`] at configuration time; by the
/// time a `CounterDef` reaches the store they look like ordinary histograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterKind {
    Scalar,
    Histogram,
    TrafficModel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterDef {
    pub name: String,
    pub kind: CounterKind,
    pub bins: Vec<Bin>,
    /// Standard deviation of the Gaussian noise added to this counter.
    pub sigma: f64,
    pub noise_required: bool,
}

#[derive(Debug, Error)]
pub enum CounterDefError {
    #[error("bin {index} in counter {name} has lo >= hi")]
    BinNotOrdered { name: String, index: usize },
    #[error("bins in counter {name} are not sorted or overlap at index {index}")]
    BinsOverlap { name: String, index: usize },
    #[error("sigma for counter {name} is negative")]
    NegativeSigma { name: String },
}

impl CounterDef {
    /// I2/I3: sigma non-negative, bins sorted and non-overlapping, each
    /// bin's lo < hi.
    pub fn validate(&self) -> Result<(), CounterDefError> {
        if self.sigma < 0.0 {
            return Err(CounterDefError::NegativeSigma {
                name: self.name.clone(),
            });
        }
        for (i, bin) in self.bins.iter().enumerate() {
            if !(bin.lo < bin.hi) {
                return Err(CounterDefError::BinNotOrdered {
                    name: self.name.clone(),
                    index: i,
                });
            }
            if i > 0 && self.bins[i - 1].hi > bin.lo {
                return Err(CounterDefError::BinsOverlap {
                    name: self.name.clone(),
                    index: i,
                });
            }
        }
        Ok(())
    }

    /// Finds the unique bin index containing `v`, or `None` if `v` falls in
    /// a gap (silently dropped per §4.1).
    pub fn bin_index_for(&self, v: f64) -> Option<usize> {
        self.bins.iter().position(|b| b.contains(v))
    }
}

/// Reserved counter whose post-aggregation value is the round's integrity
/// check (§I5). It has no bins and is never incremented by event traffic.
pub const ZERO_COUNT: &str = "ZeroCount";

/// Counter names this deployment recognizes for DC/TS name validation
/// (§4.6 "Counter names: DC and TS validate against known set"). SKs accept
/// any name for forward compatibility and never consult this list.
/// `CounterKind::TrafficModel` counters are exempt too: their names are
/// generated by `traffic_model::expand_counters` from whatever states the
/// round's model declares, not drawn from a fixed set.
pub const KNOWN_COUNTERS: &[&str] = &[
    ZERO_COUNT,
    "StreamCount",
    "StreamBytesHistogram",
    "StreamEndedCount",
    "CircuitEndedCount",
    "ConnectionEndedCount",
    "DnsResolvedCount",
    "HsdirCacheStoreCount",
    "CircuitCellCount",
    "CircuitCloseCount",
];

pub fn is_known_counter(name: &str) -> bool {
    KNOWN_COUNTERS.contains(&name)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("increment for counter {counter} matches no bin for value {value}")]
    BinGap { counter: String, value: f64 },
    #[error("unknown counter {0}")]
    UnknownCounter(String),
}

/// A DC's masked field-element store: counter_name -> bin_index -> Fe.
#[derive(Debug, Default)]
pub struct CounterStore {
    values: BTreeMap<String, Vec<Fe>>,
}

impl CounterStore {
    /// `store[c][b] = (noise[c][b] - S[c][b]) mod q`. `noise` and `shares`
    /// must contain an entry per bin for every counter in `defs`; noise for
    /// sigma=0 counters is the zero element.
    pub fn initialize(
        defs: &[CounterDef],
        shares: &BTreeMap<String, Vec<Fe>>,
        noise: &BTreeMap<String, Vec<Fe>>,
    ) -> Self {
        let mut values = BTreeMap::new();
        for def in defs {
            let n = def.bins.len().max(1);
            let mut bins = Vec::with_capacity(n);
            for b in 0..n {
                let s = shares
                    .get(&def.name)
                    .and_then(|v| v.get(b))
                    .cloned()
                    .unwrap_or_else(Fe::zero);
                let noise_b = noise
                    .get(&def.name)
                    .and_then(|v| v.get(b))
                    .cloned()
                    .unwrap_or_else(Fe::zero);
                bins.push(noise_b.sub(&s));
            }
            values.insert(def.name.clone(), bins);
        }
        CounterStore { values }
    }

    /// `store[c][b] = (store[c][b] + delta) mod q`. `delta` is always a
    /// small positive integer (§4.1).
    pub fn increment_bin(&mut self, counter: &str, bin: usize, delta: u64) -> Result<(), StoreError> {
        let bins = self
            .values
            .get_mut(counter)
            .ok_or_else(|| StoreError::UnknownCounter(counter.to_string()))?;
        let cell = bins
            .get_mut(bin)
            .ok_or_else(|| StoreError::UnknownCounter(counter.to_string()))?;
        *cell = cell.add(&Fe::from_u64(delta));
        Ok(())
    }

    /// Looks up the bin for `value` and increments it by `delta`; reports
    /// [`StoreError::BinGap`] (logged, non-fatal) if no bin matches.
    pub fn increment(
        &mut self,
        def: &CounterDef,
        value: f64,
        delta: u64,
    ) -> Result<(), StoreError> {
        match def.bin_index_for(value) {
            Some(idx) => self.increment_bin(&def.name, idx, delta),
            None => Err(StoreError::BinGap {
                counter: def.name.clone(),
                value,
            }),
        }
    }

    /// Masked totals ready for transmission in a `TALLY` message.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<Fe>> {
        self.values.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use num_traits::FromPrimitive;

    fn ensure_modulus() {
        let _ = crate::field::set_modulus(BigUint::from_u64(1_000_003).unwrap());
    }

    fn histogram() -> CounterDef {
        CounterDef {
            name: "StreamBytes".into(),
            kind: CounterKind::Histogram,
            bins: vec![
                Bin { lo: 0.0, hi: 10.0 },
                Bin { lo: 10.0, hi: 100.0 },
                Bin {
                    lo: 100.0,
                    hi: f64::INFINITY,
                },
            ],
            sigma: 0.0,
            noise_required: false,
        }
    }

    #[test]
    fn bin_lookup_matches_spec_scenario() {
        let def = histogram();
        assert_eq!(def.bin_index_for(0.0), Some(0));
        assert_eq!(def.bin_index_for(9.0), Some(0));
        assert_eq!(def.bin_index_for(10.0), Some(1));
        assert_eq!(def.bin_index_for(1000.0), Some(2));
    }

    #[test]
    fn gap_outside_bins_is_dropped() {
        let def = CounterDef {
            bins: vec![Bin { lo: 0.0, hi: 5.0 }, Bin { lo: 10.0, hi: 20.0 }],
            ..histogram()
        };
        assert_eq!(def.bin_index_for(7.0), None);
    }

    #[test]
    fn overlapping_bins_rejected() {
        let def = CounterDef {
            bins: vec![Bin { lo: 0.0, hi: 10.0 }, Bin { lo: 5.0, hi: 20.0 }],
            ..histogram()
        };
        assert!(def.validate().is_err());
    }

    #[test]
    fn increment_then_snapshot_histogram_counts() {
        ensure_modulus();
        let def = histogram();
        let mut store = CounterStore::initialize(&[def.clone()], &BTreeMap::new(), &BTreeMap::new());
        for v in [0.0, 9.0, 10.0, 1000.0] {
            store.increment(&def, v, 1).unwrap();
        }
        let snap = store.snapshot();
        let bins = &snap["StreamBytes"];
        assert_eq!(bins[0].to_signed(), num_bigint::BigInt::from(2));
        assert_eq!(bins[1].to_signed(), num_bigint::BigInt::from(1));
        assert_eq!(bins[2].to_signed(), num_bigint::BigInt::from(1));
    }
}
