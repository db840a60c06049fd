//! Inter-node wire protocol (§6): length-prefixed UTF-8 lines over TLS.
//! Each line is one JSON-tagged [`Message`]; framing itself (the length
//! prefix) is handled by [`tokio_util::codec::LengthDelimitedCodec`] in
//! `transport.rs`.

use std::collections::BTreeMap;

use privcount_core::config::Periods;
use privcount_core::counter::CounterDef;
use privcount_core::traffic_model::TrafficModel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// §6: "All messages <= 64 KiB."
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Dc,
    Sk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    Handshake1 {
        nonce_s_hex: String,
    },
    Handshake2 {
        nonce_c_hex: String,
        hmac_hex: String,
    },
    Handshake3 {
        hmac_hex: String,
    },
    Register {
        version: String,
        role: Role,
        fingerprint: String,
        supported_counters: Vec<String>,
    },
    Config {
        round_id: String,
        counters: Vec<CounterDef>,
        noise_weights: BTreeMap<String, f64>,
        sk_pubkey_fingerprints: BTreeMap<String, String>,
        periods: Periods,
        #[serde(default)]
        traffic_model: Option<TrafficModel>,
    },
    ShareEnvelope {
        round_id: String,
        from_dc: String,
        to_sk: String,
        hybrid_ciphertext_hex: String,
    },
    /// SK -> TS: a received envelope failed to decrypt or deserialize. Lets
    /// the TS distinguish "this DC's share for this SK is simply missing"
    /// from "it arrived but the SK could not use it" without the SK silently
    /// dropping the failure (§4.2).
    ShareFailed {
        round_id: String,
        from_dc: String,
        reason: String,
    },
    StartRound {
        round_id: String,
        start_time: u64,
    },
    Heartbeat {
        round_id: Option<String>,
        state: String,
        last_error: Option<String>,
    },
    /// DC -> TS: masked totals, hex-encoded field elements per bin.
    Tally {
        round_id: String,
        snapshots: BTreeMap<String, Vec<String>>,
    },
    /// SK -> TS: accumulated share sums, hex-encoded field elements per bin.
    Shares {
        round_id: String,
        sums: BTreeMap<String, Vec<String>>,
    },
    StopRound {
        round_id: String,
    },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message exceeds {MAX_MESSAGE_BYTES} bytes")]
    TooLarge,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serializes `msg` to a single line of JSON, rejecting anything over the
/// 64 KiB message cap before it is handed to the transport layer.
pub fn encode(msg: &Message) -> Result<Vec<u8>, ProtocolError> {
    let bytes = serde_json::to_vec(msg)?;
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge);
    }
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(ProtocolError::TooLarge);
    }
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_message_roundtrips() {
        let msg = Message::Register {
            version: "1.0".into(),
            role: Role::Dc,
            fingerprint: "abc123".into(),
            supported_counters: vec!["StreamCount".into()],
        };
        let bytes = encode(&msg).unwrap();
        let decoded = decode(&bytes).unwrap();
        match decoded {
            Message::Register { fingerprint, .. } => assert_eq!(fingerprint, "abc123"),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn oversized_message_rejected() {
        let huge = Message::Heartbeat {
            round_id: None,
            state: "x".repeat(MAX_MESSAGE_BYTES + 1),
            last_error: None,
        };
        assert!(encode(&huge).is_err());
    }
}
