//! Arithmetic over Z_q, the additive field the round's masked values and
//! blinding shares live in. `q` is a deployment-wide constant, large enough
//! that no honest sum of counts, noise, and shares wraps (Design Notes §9:
//! "treat as per-deployment constant").

use num_bigint::{BigInt, BigUint, RandBigInt};
use num_traits::Zero;
use rand_core::CryptoRng;
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// A field element in [0, q). Backed by an arbitrary-precision integer since
/// q is typically 2048 bits or larger.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fe(#[serde(with = "biguint_hex")] BigUint);

impl fmt::Debug for Fe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fe({})", self.0)
    }
}

mod biguint_hex {
    use num_bigint::BigUint;
    use num_traits::Num;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &BigUint, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_str_radix(16))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BigUint, D::Error> {
        let text = String::deserialize(d)?;
        BigUint::from_str_radix(&text, 16).map_err(serde::de::Error::custom)
    }
}

/// The field modulus. Fixed at process startup by [`set_modulus`]; every
/// [`Fe`] operation reduces against it.
static MODULUS: OnceLock<BigUint> = OnceLock::new();

/// Installs the deployment-wide modulus. Must be called once, before any
/// [`Fe`] arithmetic, from the config loader. Returns `false` if a modulus
/// was already set (callers should treat a second call as a logic error).
pub fn set_modulus(q: BigUint) -> bool {
    MODULUS.set(q).is_ok()
}

fn modulus() -> &'static BigUint {
    MODULUS
        .get()
        .expect("field modulus not initialized: call set_modulus at startup")
}

/// Fallible modulus accessor for callers that may run before `set_modulus`
/// (config validation in unit tests that never touch field arithmetic).
pub(crate) fn try_modulus() -> Option<&'static BigUint> {
    MODULUS.get()
}

impl Fe {
    pub fn zero() -> Self {
        Fe(BigUint::zero())
    }

    pub fn from_u64(v: u64) -> Self {
        Fe(BigUint::from(v) % modulus())
    }

    /// Samples a uniform element of Z_q using a CSPRNG, per §4.2 ("samples
    /// r_{s,c,b} uniformly in [0, q)").
    pub fn sample_uniform<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Fe(rng.gen_biguint_below(modulus()))
    }

    pub fn add(&self, other: &Fe) -> Fe {
        Fe((&self.0 + &other.0) % modulus())
    }

    pub fn sub(&self, other: &Fe) -> Fe {
        let q = modulus();
        let a = &self.0 % q;
        let b = &other.0 % q;
        if a >= b {
            Fe(a - b)
        } else {
            Fe(q - (b - a))
        }
    }

    /// Reduces a possibly-negative noise draw into Z_q: "negative draw
    /// becomes q + n_c" (§4.3).
    pub fn from_signed(v: &BigInt) -> Fe {
        let q = BigInt::from(modulus().clone());
        let reduced = ((v % &q) + &q) % &q;
        Fe(reduced.to_biguint().expect("non-negative after reduction"))
    }

    /// Lifts a field element to a signed integer: values >= q/2 map to
    /// `value - q` (§4.7 publication rule).
    pub fn to_signed(&self) -> BigInt {
        let q = modulus();
        let half = q / 2u32;
        if self.0 >= half {
            BigInt::from(self.0.clone()) - BigInt::from(q.clone())
        } else {
            BigInt::from(self.0.clone())
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Hex encoding used on the wire (§6): plain, unsigned, no `0x` prefix.
    pub fn to_hex(&self) -> String {
        self.0.to_str_radix(16)
    }

    pub fn from_hex(s: &str) -> Option<Fe> {
        BigUint::parse_bytes(s.as_bytes(), 16).map(Fe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    fn ensure_modulus() {
        let _ = set_modulus(BigUint::from_u64(65537 * 2).unwrap());
    }

    #[test]
    fn add_sub_roundtrip() {
        ensure_modulus();
        let a = Fe::from_u64(40);
        let b = Fe::from_u64(90000);
        let s = a.add(&b);
        assert_eq!(s.sub(&b), a);
    }

    #[test]
    fn signed_lift_wraps_high_half() {
        ensure_modulus();
        let q = BigUint::from_u64(65537 * 2).unwrap();
        let near_q = Fe(q - BigUint::from(1u32));
        assert_eq!(near_q.to_signed(), BigInt::from(-1));
    }

    #[test]
    fn negative_noise_reduces_into_field() {
        ensure_modulus();
        let n = Fe::from_signed(&BigInt::from(-5));
        assert_eq!(n.to_signed(), BigInt::from(-5));
    }
}
