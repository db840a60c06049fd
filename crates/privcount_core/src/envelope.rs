//! Hybrid envelope encryption for blinding-share delivery (§4.2, step 3):
//! a random symmetric key encrypts the payload under an AEAD, and the key
//! itself is wrapped under the recipient SK's RSA public key (OAEP/SHA-256).
//! This lifts RSA's message-size limit since the payload can be arbitrarily
//! large (one share per bin per counter).

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand_core::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

/// First byte of every envelope; bumped if the AEAD or KEM ever changes so
/// an old envelope is never misinterpreted under a new scheme.
const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("rsa operation failed: {0}")]
    Rsa(String),
    #[error("aead operation failed")]
    Aead,
    #[error("envelope too short or malformed")]
    Malformed,
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u8),
}

/// Encrypts `payload` for `recipient`, returning `[version][rsa_key_len:2][wrapped_key][nonce][ciphertext]`.
pub fn seal(recipient: &RsaPublicKey, payload: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut sym_key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut sym_key_bytes);
    let key = Key::<Aes256Gcm>::from_slice(&sym_key_bytes);
    let cipher = Aes256Gcm::new(key);

    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, payload)
        .map_err(|_| EnvelopeError::Aead)?;

    let wrapped_key = recipient
        .encrypt(&mut rsa::rand_core::OsRng, Oaep::new::<Sha256>(), &sym_key_bytes)
        .map_err(|e| EnvelopeError::Rsa(e.to_string()))?;

    let mut out = Vec::with_capacity(1 + 2 + wrapped_key.len() + 12 + ciphertext.len());
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(&(wrapped_key.len() as u16).to_be_bytes());
    out.extend_from_slice(&wrapped_key);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts an envelope produced by [`seal`] using the recipient's private key.
pub fn open(recipient: &RsaPrivateKey, envelope: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if envelope.is_empty() {
        return Err(EnvelopeError::Malformed);
    }
    let version = envelope[0];
    if version != ENVELOPE_VERSION {
        return Err(EnvelopeError::UnsupportedVersion(version));
    }
    if envelope.len() < 3 {
        return Err(EnvelopeError::Malformed);
    }
    let key_len = u16::from_be_bytes([envelope[1], envelope[2]]) as usize;
    let key_start = 3;
    let key_end = key_start
        .checked_add(key_len)
        .ok_or(EnvelopeError::Malformed)?;
    if envelope.len() < key_end + 12 {
        return Err(EnvelopeError::Malformed);
    }
    let wrapped_key = &envelope[key_start..key_end];
    let nonce_bytes = &envelope[key_end..key_end + 12];
    let ciphertext = &envelope[key_end + 12..];

    let sym_key_bytes = recipient
        .decrypt(Oaep::new::<Sha256>(), wrapped_key)
        .map_err(|e| EnvelopeError::Rsa(e.to_string()))?;
    let key = Key::<Aes256Gcm>::from_slice(&sym_key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EnvelopeError::Aead)
}

/// SHA-256 fingerprint of an SK's DER-encoded RSA public key, used as the
/// out-of-band trust anchor checked against the TS-provided fingerprint
/// (§4.2).
pub fn fingerprint(key: &RsaPublicKey) -> Result<[u8; 32], EnvelopeError> {
    use rsa::pkcs8::EncodePublicKey;
    use sha2::Digest;
    let der = key
        .to_public_key_der()
        .map_err(|e| EnvelopeError::Rsa(e.to_string()))?;
    Ok(Sha256::digest(der.as_bytes()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPrivateKey;

    #[test]
    fn seal_open_roundtrip() {
        let mut rng = rand::thread_rng();
        let sk_private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let sk_public = RsaPublicKey::from(&sk_private);

        let payload = b"blinding shares for round abc123";
        let envelope = seal(&sk_public, payload).unwrap();
        let recovered = open(&sk_private, &envelope).unwrap();
        assert_eq!(&recovered, payload);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let mut rng = rand::thread_rng();
        let sk_private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let sk_public = RsaPublicKey::from(&sk_private);
        let other_private = RsaPrivateKey::new(&mut rng, 2048).unwrap();

        let envelope = seal(&sk_public, b"payload").unwrap();
        assert!(open(&other_private, &envelope).is_err());
    }

    #[test]
    fn fingerprint_is_stable_for_same_key() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        assert_eq!(fingerprint(&public).unwrap(), fingerprint(&public).unwrap());
    }
}
