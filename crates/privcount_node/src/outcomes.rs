//! Outcomes file writer (§4.7, §6). Publishes a JSON document shaped
//! `{Context: {...}, Tally: {counter_name: {sigma, bins: [[lo, hi, value], ...]}}}`.
//! Infinities serialize as the literal tokens `.inf` / `-.inf` (quoted, so the
//! document stays strict JSON) to match the source format.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use num_bigint::BigInt;
use privcount_core::counter::{CounterDef, ZERO_COUNT};
use privcount_core::field::Fe;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutcomesError {
    #[error("round is marked invalid: {reason}")]
    Invalid { reason: String },
    #[error("io error writing outcomes file: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct Context {
    pub round_id: String,
    pub start_time: u64,
    pub end_time: u64,
    pub dc_fingerprints: Vec<String>,
    pub sk_fingerprints: Vec<String>,
}

fn bin_bound(v: f64) -> Value {
    if v == f64::INFINITY {
        Value::String(".inf".to_string())
    } else if v == f64::NEG_INFINITY {
        Value::String("-.inf".to_string())
    } else {
        serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Builds the full outcomes document and checks the ZeroCount validity
/// invariant (I5) before returning it; callers must not publish a
/// `Err(Invalid)` result (§4.7 "Validity check").
pub fn build_outcomes(
    context: Context,
    defs: &[CounterDef],
    noisy_totals: &BTreeMap<String, Vec<Fe>>,
) -> Result<Value, OutcomesError> {
    let zero_count_ok = noisy_totals
        .get(ZERO_COUNT)
        .map(|bins| bins.iter().all(|b| b.is_zero()))
        .unwrap_or(true);
    if !zero_count_ok {
        return Err(OutcomesError::Invalid {
            reason: "ZeroCount != 0 after aggregation".into(),
        });
    }

    let mut tally = serde_json::Map::new();
    for def in defs {
        let bins = noisy_totals.get(&def.name).cloned().unwrap_or_default();
        let rows: Vec<Value> = def
            .bins
            .iter()
            .zip(bins.iter())
            .map(|(bin, value)| {
                let signed: BigInt = value.to_signed();
                Value::Array(vec![
                    bin_bound(bin.lo),
                    bin_bound(bin.hi),
                    Value::String(signed.to_string()),
                ])
            })
            .collect();
        tally.insert(
            def.name.clone(),
            serde_json::json!({ "sigma": def.sigma, "bins": rows }),
        );
    }

    Ok(serde_json::json!({
        "Context": context,
        "Tally": Value::Object(tally),
    }))
}

pub fn write_outcomes(path: &Path, doc: &Value) -> Result<(), OutcomesError> {
    let text = serde_json::to_string_pretty(doc)?;
    fs::write(path, text)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use num_traits::FromPrimitive;
    use privcount_core::counter::{Bin, CounterKind};

    fn ensure_modulus() {
        let _ = privcount_core::field::set_modulus(BigUint::from_u64(1_000_003).unwrap());
    }

    #[test]
    fn zero_count_nonzero_marks_invalid() {
        ensure_modulus();
        let ctx = Context {
            round_id: "r1".into(),
            start_time: 0,
            end_time: 1,
            dc_fingerprints: vec![],
            sk_fingerprints: vec![],
        };
        let defs = vec![CounterDef {
            name: ZERO_COUNT.into(),
            kind: CounterKind::Scalar,
            bins: vec![Bin::scalar()],
            sigma: 0.0,
            noise_required: false,
        }];
        let mut totals = BTreeMap::new();
        totals.insert(ZERO_COUNT.to_string(), vec![Fe::from_u64(3)]);
        assert!(build_outcomes(ctx, &defs, &totals).is_err());
    }

    #[test]
    fn infinite_bin_bound_serializes_as_dot_inf() {
        ensure_modulus();
        let ctx = Context {
            round_id: "r1".into(),
            start_time: 0,
            end_time: 1,
            dc_fingerprints: vec![],
            sk_fingerprints: vec![],
        };
        let defs = vec![CounterDef {
            name: "Hist".into(),
            kind: CounterKind::Histogram,
            bins: vec![Bin {
                lo: 100.0,
                hi: f64::INFINITY,
            }],
            sigma: 0.0,
            noise_required: false,
        }];
        let mut totals = BTreeMap::new();
        totals.insert("Hist".to_string(), vec![Fe::from_u64(5)]);
        let doc = build_outcomes(ctx, &defs, &totals).unwrap();
        let bins = &doc["Tally"]["Hist"]["bins"][0];
        assert_eq!(bins[1], Value::String(".inf".to_string()));
    }
}
