//! Share Keeper round driver (§4, §4.2, §4.5, §4.6). An SK receives one
//! blinding-share envelope per DC, accumulates them, and reports the sum at
//! round end. It never learns any DC's actual counts — only the sum of
//! per-SK shares, which by construction carries no information about the
//! masked totals.

use std::collections::BTreeMap;

use privcount_core::config::{DelayDecision, RoundConfig};
use privcount_core::envelope;
use privcount_core::field::Fe;
use privcount_core::share::ShareAccumulator;
use privcount_core::{PrivCountError, Result as CoreResult};
use rsa::pkcs8::DecodeRsaPrivateKey;
use rsa::RsaPrivateKey;
use tracing::{info, warn};

use crate::config::SkConfig;
use crate::liveness::now_secs;
use crate::protocol::{Message, Role};
use crate::round::ClientState;
use crate::state::DelayState;
use crate::transport;

pub struct SkRound {
    pub state: ClientState,
    round: Option<RoundConfig>,
    accumulator: ShareAccumulator,
    private_key: RsaPrivateKey,
}

impl SkRound {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self {
            state: ClientState::Idle,
            round: None,
            accumulator: ShareAccumulator::new(),
            private_key,
        }
    }

    pub fn register(&mut self) -> CoreResult<()> {
        self.state = self
            .state
            .on_register()
            .map_err(|e| PrivCountError::Fatal(format!("sk register: {e:?}")))?;
        Ok(())
    }

    /// Runs Initial + Round-Start Checks (§4.6). An SK accepts any counter
    /// name for forward compatibility (§4.6: "SKs accept any name"), so it
    /// does not validate counter identity beyond the shared `CounterDef`
    /// structural checks already covered by `initial_checks`.
    pub fn prepare(
        &mut self,
        round: RoundConfig,
        previous: Option<&RoundConfig>,
        delay_state: &mut DelayState,
        delay_period_secs: u64,
        epsilon: f64,
    ) -> CoreResult<()> {
        round.initial_checks(false)?;

        let decision = round.round_start_checks(previous, &delay_state.pinned_sigma, epsilon);
        if decision == DelayDecision::DelayRequired {
            let last_end = delay_state.last_round_end_time.unwrap_or(0);
            let ready_at = last_end.saturating_add(delay_period_secs);
            if now_secs() < ready_at {
                return Err(PrivCountError::DelayRequired {
                    counter: round.round_id.clone(),
                });
            }
            delay_state.pinned_sigma = round
                .counters
                .iter()
                .map(|c| (c.name.clone(), c.sigma))
                .collect();
        } else if delay_state.pinned_sigma.is_empty() {
            delay_state.pinned_sigma = round
                .counters
                .iter()
                .map(|c| (c.name.clone(), c.sigma))
                .collect();
        }

        let sigmas: BTreeMap<String, f64> =
            round.counters.iter().map(|c| (c.name.clone(), c.sigma)).collect();
        let new_hash = crate::state::hash_noise_allocation(&sigmas);
        if delay_state.last_noise_allocation_hash.as_deref() != Some(new_hash.as_str()) {
            info!(round_id = %round.round_id, "noise allocation changed since last round");
        }
        delay_state.last_noise_allocation_hash = Some(new_hash);

        self.accumulator = ShareAccumulator::new();
        self.round = Some(round);
        self.state = self
            .state
            .on_config_accept()
            .map_err(|e| PrivCountError::Fatal(format!("sk config_accept: {e:?}")))?;
        Ok(())
    }

    pub fn start_collecting(&mut self) -> CoreResult<()> {
        self.state = self
            .state
            .on_start_round()
            .map_err(|e| PrivCountError::Fatal(format!("sk start_round: {e:?}")))?;
        Ok(())
    }

    /// Opens one DC's sealed envelope and folds its shares into the running
    /// sum. A DC that never sends an envelope simply contributes nothing;
    /// the round continues (dishonest/crashed SKs and missing DCs are
    /// crash-only failures, not Byzantine ones). Returns the failure reason
    /// on decrypt/decode failure so the caller can report it to the TS
    /// (§4.2) instead of silently dropping it.
    pub fn receive_envelope(&mut self, from_dc: &str, envelope_bytes: &[u8]) -> Option<String> {
        match envelope::open(&self.private_key, envelope_bytes) {
            Ok(plaintext) => match serde_json::from_slice::<BTreeMap<String, Vec<Fe>>>(&plaintext)
            {
                Ok(shares) => {
                    self.accumulator.accumulate(&shares);
                    None
                }
                Err(e) => {
                    warn!(from_dc, error = %e, "malformed share payload, dropped");
                    Some(format!("malformed share payload: {e}"))
                }
            },
            Err(e) => {
                warn!(from_dc, error = %e, "envelope failed to open, dropped");
                Some(format!("envelope failed to open: {e}"))
            }
        }
    }

    pub fn abort(&mut self) -> CoreResult<()> {
        self.state = self
            .state
            .on_round_end()
            .map_err(|e| PrivCountError::Fatal(format!("sk abort: {e:?}")))?;
        self.round = None;
        Ok(())
    }

    /// Transitions to TALLYING and returns the accumulated share sum to send
    /// to the TS.
    pub fn tally(&mut self) -> CoreResult<BTreeMap<String, Vec<Fe>>> {
        self.state = self
            .state
            .on_tally()
            .map_err(|e| PrivCountError::Fatal(format!("sk tally: {e:?}")))?;
        Ok(self.accumulator.share_sum())
    }

    pub fn round_end(&mut self, delay_state: &mut DelayState) -> CoreResult<()> {
        self.state = self
            .state
            .on_round_end()
            .map_err(|e| PrivCountError::Fatal(format!("sk round_end: {e:?}")))?;
        delay_state.last_round_end_time = Some(now_secs());
        self.round = None;
        Ok(())
    }
}

/// Connects to the TS, completes the handshake and registration, then loops
/// forever: validate each published round, accumulate share envelopes as
/// they arrive, and report the share sum at round end (§4.5).
pub async fn run(config: SkConfig) -> CoreResult<()> {
    let modulus = config
        .common
        .parsed_modulus()
        .map_err(|e| PrivCountError::Fatal(e.to_string()))?;
    privcount_core::field::set_modulus(modulus);

    let pem = std::fs::read_to_string(&config.rsa_private_key_path)
        .map_err(|e| PrivCountError::Fatal(format!("reading SK private key: {e}")))?;
    let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
        .map_err(|e| PrivCountError::Fatal(format!("parsing SK private key: {e}")))?;

    let cert_pem = std::fs::read(&config.common.tally_server_cert_path)
        .map_err(|e| PrivCountError::Fatal(format!("reading TS cert: {e}")))?;
    let host = config
        .common
        .tally_server_addr
        .split(':')
        .next()
        .unwrap_or("localhost");
    let mut stream = transport::connect_to_ts(&config.common.tally_server_addr, host, &cert_pem)
        .await
        .map_err(|e| PrivCountError::Fatal(format!("connect to TS: {e}")))?;

    let key = hex::decode(&config.common.handshake_key_hex)
        .map_err(|e| PrivCountError::Fatal(format!("bad handshake key: {e}")))?;
    transport::client_handshake(&mut stream, &key)
        .await
        .map_err(|_| PrivCountError::AuthFailed {
            fingerprint: config.common.fingerprint.clone(),
            reason: "handshake failed".into(),
        })?;

    transport::send(
        &mut stream,
        &Message::Register {
            version: env!("CARGO_PKG_VERSION").to_string(),
            role: Role::Sk,
            fingerprint: config.common.fingerprint.clone(),
            supported_counters: vec![],
        },
    )
    .await
    .map_err(|e| PrivCountError::DeliveryFailed {
        peer: "ts".into(),
        reason: e.to_string(),
    })?;

    let mut sk = SkRound::new(private_key);
    sk.register()?;

    let state_path = crate::config::privcount_data_dir()
        .join(format!("sk_{}_delay.json", config.common.fingerprint));
    let mut delay_state = DelayState::load_or_default(state_path);
    let mut previous_round: Option<RoundConfig> = None;

    loop {
        let msg = transport::recv(&mut stream)
            .await
            .map_err(|e| PrivCountError::Fatal(format!("recv from TS: {e}")))?;
        let round = match msg {
            Message::Config {
                round_id,
                counters,
                noise_weights,
                sk_pubkey_fingerprints,
                periods,
                traffic_model,
            } => RoundConfig {
                round_id,
                counters,
                noise_weights,
                sk_fingerprints: sk_pubkey_fingerprints,
                periods,
                thresholds: privcount_core::config::Thresholds {
                    dc_threshold: 1,
                    sk_threshold: 1,
                },
                always_delay: false,
                traffic_model,
            },
            Message::StopRound { .. } => continue,
            _ => continue,
        };

        if let Err(e) = sk.prepare(
            round.clone(),
            previous_round.as_ref(),
            &mut delay_state,
            config.common.delay_period_secs,
            config.common.sigma_decrease_epsilon,
        ) {
            warn!(error = %e, "round preparation failed, skipping round");
            continue;
        }

        let start_msg = transport::recv(&mut stream)
            .await
            .map_err(|e| PrivCountError::Fatal(format!("recv start_round: {e}")))?;
        if !matches!(start_msg, Message::StartRound { .. }) {
            sk.abort()?;
            continue;
        }
        sk.start_collecting()?;

        let deadline = tokio::time::Instant::now()
            + tokio::time::Duration::from_secs(round.periods.collect_period_secs);
        loop {
            tokio::select! {
                msg = transport::recv(&mut stream) => {
                    match msg {
                        Ok(Message::ShareEnvelope { round_id, from_dc, hybrid_ciphertext_hex, .. }) => {
                            let reason = match hex::decode(&hybrid_ciphertext_hex) {
                                Ok(bytes) => sk.receive_envelope(&from_dc, &bytes),
                                Err(e) => {
                                    warn!(from_dc, error = %e, "malformed envelope hex");
                                    Some(format!("malformed envelope hex: {e}"))
                                }
                            };
                            if let Some(reason) = reason {
                                transport::send(
                                    &mut stream,
                                    &Message::ShareFailed { round_id, from_dc, reason },
                                )
                                .await
                                .map_err(|e| PrivCountError::DeliveryFailed {
                                    peer: "ts".into(),
                                    reason: e.to_string(),
                                })?;
                            }
                        }
                        Ok(Message::StopRound { .. }) => { sk.abort()?; break; }
                        Ok(_) => {}
                        Err(e) => return Err(PrivCountError::Fatal(format!("recv: {e}"))),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let sums = sk.tally()?;
        let snapshots = sums
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().map(|fe| fe.to_hex()).collect()))
            .collect();
        transport::send(
            &mut stream,
            &Message::Shares {
                round_id: round.round_id.clone(),
                sums: snapshots,
            },
        )
        .await
        .map_err(|e| PrivCountError::DeliveryFailed {
            peer: "ts".into(),
            reason: e.to_string(),
        })?;

        sk.round_end(&mut delay_state)?;
        let _ = delay_state.persist();
        previous_round = Some(round);
        info!("round complete, waiting for next config");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use num_traits::FromPrimitive;
    use privcount_core::config::{Periods, Thresholds};
    use privcount_core::counter::{Bin, CounterDef, CounterKind};
    use privcount_core::share::generate_shares;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;
    use rsa::RsaPublicKey;

    fn ensure_modulus() {
        let _ = privcount_core::field::set_modulus(BigUint::from_u64(1u64 << 61).unwrap());
    }

    fn scalar_round() -> RoundConfig {
        RoundConfig {
            round_id: "r1".into(),
            counters: vec![CounterDef {
                name: "StreamCount".into(),
                kind: CounterKind::Scalar,
                bins: vec![Bin::scalar()],
                sigma: 0.0,
                noise_required: false,
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
                sk_threshold: 1,
            },
            always_delay: false,
            traffic_model: None,
        }
    }

    #[test]
    fn accumulates_envelopes_from_multiple_dcs() {
        ensure_modulus();
        let mut rng = ChaCha20Rng::from_seed([9u8; 32]);
        let private_key = RsaPrivateKey::new(&mut rng, 512).unwrap();
        let public_key = RsaPublicKey::from(&private_key);

        let mut sk = SkRound::new(private_key);
        sk.register().unwrap();
        let mut delay_state = DelayState::default();
        sk.prepare(scalar_round(), None, &mut delay_state, 86400, 1e-6)
            .unwrap();
        sk.start_collecting().unwrap();

        let defs = scalar_round().counters;
        for dc_name in ["dc1", "dc2"] {
            let (per_sk, _dc_sum) = generate_shares(&mut rng, &["sk1".to_string()], &defs);
            let plaintext = serde_json::to_vec(&per_sk[0].shares).unwrap();
            let envelope_bytes = envelope::seal(&public_key, &plaintext).unwrap();
            sk.receive_envelope(dc_name, &envelope_bytes);
        }

        let sums = sk.tally().unwrap();
        assert!(sums.contains_key("StreamCount"));
    }
}
