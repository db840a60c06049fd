//! SHA-256 HMAC challenge-response proving knowledge of a shared secret
//! handshake key `K`, without ever transmitting `K` (§4.5).

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 32;

fn mac(key: &[u8], role: &[u8], n_s: &[u8; NONCE_LEN], n_c: &[u8; NONCE_LEN]) -> [u8; 32] {
    let mut m = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    m.update(role);
    m.update(n_s);
    m.update(n_c);
    m.finalize().into_bytes().into()
}

/// Client side of step 2: `H(K || "client" || N_s || N_c)`.
pub fn client_response(key: &[u8], n_s: &[u8; NONCE_LEN], n_c: &[u8; NONCE_LEN]) -> [u8; 32] {
    mac(key, b"client", n_s, n_c)
}

/// Server side of step 3: `H(K || "server" || N_s || N_c)`.
pub fn server_response(key: &[u8], n_s: &[u8; NONCE_LEN], n_c: &[u8; NONCE_LEN]) -> [u8; 32] {
    mac(key, b"server", n_s, n_c)
}

/// Constant-time-ish verification (the underlying `Mac::verify_slice` is
/// constant time) of a peer's response against the expected MAC.
pub fn verify(expected: &[u8; 32], received: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    expected.ct_eq(received).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_and_server_responses_differ() {
        let key = b"shared-secret";
        let n_s = [1u8; NONCE_LEN];
        let n_c = [2u8; NONCE_LEN];
        assert_ne!(client_response(key, &n_s, &n_c), server_response(key, &n_s, &n_c));
    }

    #[test]
    fn mismatched_key_fails_verification() {
        let n_s = [1u8; NONCE_LEN];
        let n_c = [2u8; NONCE_LEN];
        let resp = client_response(b"secret-a", &n_s, &n_c);
        let expected = client_response(b"secret-b", &n_s, &n_c);
        assert!(!verify(&expected, &resp));
    }

    #[test]
    fn matching_response_verifies() {
        let key = b"shared-secret";
        let n_s = [5u8; NONCE_LEN];
        let n_c = [9u8; NONCE_LEN];
        let resp = client_response(key, &n_s, &n_c);
        assert!(verify(&client_response(key, &n_s, &n_c), &resp));
    }
}
