//! Validated round configuration (§4.6, Design Notes §9: "define a validated
//! configuration record with enumerated variants ... parsing and validation
//! are one step"). This module owns the Initial Checks and Round-Start
//! Checks; node-role config (YAML loading, CLI) lives in `privcount_node`.

use std::collections::BTreeMap;

use num_bigint::BigInt;
use num_traits::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::counter::{CounterDef, CounterKind};
use crate::error::PrivCountError;
use crate::traffic_model::TrafficModel;

/// Event-source authentication mode, in TS-preferred order (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    SafeCookie,
    HashedPassword,
    Null,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Periods {
    pub collect_period_secs: u64,
    pub event_period_secs: u64,
    pub checkin_period_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Thresholds {
    pub dc_threshold: usize,
    pub sk_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundConfig {
    pub round_id: String,
    pub counters: Vec<CounterDef>,
    /// Per-DC noise weight `w_d`; must sum to 1 across participating DCs.
    pub noise_weights: BTreeMap<String, f64>,
    /// SK fingerprint -> hex-encoded SHA-256 of its RSA public key.
    pub sk_fingerprints: BTreeMap<String, String>,
    pub periods: Periods,
    pub thresholds: Thresholds,
    pub always_delay: bool,
    /// Declarative HMM driving the TrafficModel counters in `counters`
    /// (§4.4). `None` if this round has no traffic model configured.
    #[serde(default)]
    pub traffic_model: Option<TrafficModel>,
}

/// Outcome of comparing a new round's config against the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayDecision {
    NoDelayNeeded,
    DelayRequired,
}

impl RoundConfig {
    /// Initial Checks (§4.6): independent of round history. Any failure
    /// refuses the round. `validate_counter_names` is true for DC and TS
    /// ("DC and TS validate against known set"); SKs pass `false` since they
    /// accept any name for forward compatibility.
    pub fn initial_checks(&self, validate_counter_names: bool) -> Result<(), PrivCountError> {
        for def in &self.counters {
            def.validate().map_err(|e| PrivCountError::ConfigInvalid {
                round_id: self.round_id.clone(),
                reason: e.to_string(),
            })?;
            if validate_counter_names
                && def.kind != CounterKind::TrafficModel
                && !crate::counter::is_known_counter(&def.name)
            {
                return Err(PrivCountError::ConfigInvalid {
                    round_id: self.round_id.clone(),
                    reason: format!("counter {} is not in the known counter set", def.name),
                });
            }
        }

        let weight_sum: f64 = self.noise_weights.values().sum();
        if self.noise_weights.values().any(|&w| w < 0.0) {
            return Err(PrivCountError::ConfigInvalid {
                round_id: self.round_id.clone(),
                reason: "noise weight must be >= 0".into(),
            });
        }
        if (weight_sum - 1.0).abs() > 1e-6 && !self.noise_weights.is_empty() {
            return Err(PrivCountError::ConfigInvalid {
                round_id: self.round_id.clone(),
                reason: format!("noise weights must sum to 1, got {weight_sum}"),
            });
        }

        // sum(w_d * max_bin) < q: a loose bound on the largest masked value
        // any DC's store can hold, so an honest round never wraps mod q.
        // Skipped if the field modulus hasn't been installed yet (config
        // unit tests that never touch field arithmetic).
        if let Some(q) = crate::field::try_modulus() {
            let max_bin = self
                .counters
                .iter()
                .flat_map(|c| c.bins.iter())
                .map(|b| b.hi)
                .filter(|h| h.is_finite())
                .fold(0.0_f64, f64::max);
            let bound = weight_sum * max_bin;
            if bound.is_finite() && bound > 0.0 {
                if let Some(bound_int) = BigInt::from_f64(bound.ceil()) {
                    if bound_int >= BigInt::from(q.clone()) {
                        return Err(PrivCountError::ConfigInvalid {
                            round_id: self.round_id.clone(),
                            reason: format!(
                                "sum(w_d * max_bin) = {bound} must be < field modulus q"
                            ),
                        });
                    }
                }
            }
        }

        let p = &self.periods;
        if p.collect_period_secs < 4 {
            return Err(PrivCountError::ConfigInvalid {
                round_id: self.round_id.clone(),
                reason: "collect_period must be >= 4s".into(),
            });
        }
        if p.event_period_secs < 2 {
            return Err(PrivCountError::ConfigInvalid {
                round_id: self.round_id.clone(),
                reason: "event_period must be >= 2s".into(),
            });
        }
        if p.checkin_period_secs > p.event_period_secs {
            return Err(PrivCountError::ConfigInvalid {
                round_id: self.round_id.clone(),
                reason: "checkin_period must be <= event_period".into(),
            });
        }
        if p.collect_period_secs < 2 * p.event_period_secs {
            return Err(PrivCountError::ConfigInvalid {
                round_id: self.round_id.clone(),
                reason: "collect_period must cover at least 2 event_periods".into(),
            });
        }

        if self.thresholds.dc_threshold < 1 || self.thresholds.sk_threshold < 1 {
            return Err(PrivCountError::ConfigInvalid {
                round_id: self.round_id.clone(),
                reason: "dc_threshold and sk_threshold must be >= 1".into(),
            });
        }

        Ok(())
    }

    /// Round-Start Checks (§4.6): compares to the previous round. `pinned`
    /// holds, per counter, the sigma from the first round of the current
    /// undelayed sequence (not necessarily the immediately previous round —
    /// "pinned to the first round in an undelayed sequence ... to prevent
    /// counter creep").
    pub fn round_start_checks(
        &self,
        previous: Option<&RoundConfig>,
        pinned_sigma: &BTreeMap<String, f64>,
        epsilon: f64,
    ) -> DelayDecision {
        if self.always_delay {
            return DelayDecision::DelayRequired;
        }

        let Some(previous) = previous else {
            return DelayDecision::NoDelayNeeded;
        };

        let prev_names: std::collections::BTreeSet<_> =
            previous.counters.iter().map(|c| c.name.clone()).collect();
        let cur_names: std::collections::BTreeSet<_> =
            self.counters.iter().map(|c| c.name.clone()).collect();
        if prev_names != cur_names {
            return DelayDecision::DelayRequired;
        }

        for def in &self.counters {
            if let Some(&pinned) = pinned_sigma.get(&def.name) {
                if def.sigma < pinned - epsilon {
                    return DelayDecision::DelayRequired;
                }
            }
        }

        DelayDecision::NoDelayNeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{Bin, CounterKind};

    fn base_config(sigma: f64) -> RoundConfig {
        RoundConfig {
            round_id: "r1".into(),
            counters: vec![CounterDef {
                name: "StreamCount".into(),
                kind: CounterKind::Scalar,
                bins: vec![Bin::scalar()],
                sigma,
                noise_required: sigma > 0.0,
            }],
            noise_weights: BTreeMap::from([("dc1".to_string(), 1.0)]),
            sk_fingerprints: BTreeMap::new(),
            periods: Periods {
                collect_period_secs: 60,
                event_period_secs: 10,
                checkin_period_secs: 5,
            },
            thresholds: Thresholds {
                dc_threshold: 1,
                sk_threshold: 2,
            },
            always_delay: false,
            traffic_model: None,
        }
    }

    #[test]
    fn valid_config_passes_initial_checks() {
        assert!(base_config(10.0).initial_checks(true).is_ok());
    }

    #[test]
    fn negative_weight_sum_mismatch_rejected() {
        let mut cfg = base_config(10.0);
        cfg.noise_weights.insert("dc2".into(), 1.0);
        assert!(cfg.initial_checks(true).is_err());
    }

    #[test]
    fn short_collect_period_rejected() {
        let mut cfg = base_config(10.0);
        cfg.periods.collect_period_secs = 2;
        assert!(cfg.initial_checks(true).is_err());
    }

    #[test]
    fn unknown_counter_name_rejected_for_dc_and_ts_but_not_sk() {
        let mut cfg = base_config(10.0);
        cfg.counters[0].name = "SomeMadeUpCounter".into();
        assert!(cfg.initial_checks(true).is_err());
        assert!(cfg.initial_checks(false).is_ok());
    }

    #[test]
    fn sigma_decrease_triggers_delay() {
        let prev = base_config(10.0);
        let next = base_config(5.0);
        let pinned = BTreeMap::from([("StreamCount".to_string(), 10.0)]);
        assert_eq!(
            next.round_start_checks(Some(&prev), &pinned, 0.01),
            DelayDecision::DelayRequired
        );
    }

    #[test]
    fn identical_sigma_allocation_needs_no_delay() {
        let prev = base_config(10.0);
        let next = base_config(10.0);
        let pinned = BTreeMap::from([("StreamCount".to_string(), 10.0)]);
        assert_eq!(
            next.round_start_checks(Some(&prev), &pinned, 0.01),
            DelayDecision::NoDelayNeeded
        );
    }

    #[test]
    fn always_delay_forces_delay_regardless_of_sigma() {
        let prev = base_config(10.0);
        let mut next = base_config(10.0);
        next.always_delay = true;
        assert_eq!(
            next.round_start_checks(Some(&prev), &BTreeMap::new(), 0.01),
            DelayDecision::DelayRequired
        );
    }
}
