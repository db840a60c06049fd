//! Data Collector round driver (§4, §4.2, §4.3, §4.5, §4.6). A `DcRound`
//! owns the local masked counter store and the DC-side half of the round
//! state machine; `run_dc` wires it to the wire protocol and event source.

use std::collections::BTreeMap;
use std::path::Path;

use privcount_core::config::{DelayDecision, RoundConfig};
use privcount_core::counter::CounterStore;
use privcount_core::envelope;
use privcount_core::field::Fe;
use privcount_core::noise::draw_noise_for_counter;
use privcount_core::share::generate_shares;
use privcount_core::traffic_model::{split_into_packets, ByteEvent, Packet};
use privcount_core::{PrivCountError, Result as CoreResult};
use rand_core::{CryptoRng, RngCore, SeedableRng};
use rsa::pkcs8::DecodePublicKey;
use rsa::RsaPublicKey;
use tracing::{info, warn};

use crate::config::DcConfig;
use crate::event_source::EventSource;
use crate::liveness::now_secs;
use crate::protocol::{Message, Role};
use crate::round::ClientState;
use crate::state::DelayState;
use crate::transport;

/// Maps one raw event-source line to `(counter_name, bin_lookup_value,
/// increment)`. Owned by the collaborator at the boundary of this system
/// (Out of scope, §1); `DcRound` only calls it.
pub trait EventMapper {
    fn map(&self, line: &str) -> Option<(String, f64, u64)>;

    /// Maps a raw line to a traffic-model byte event (§4.4), if this
    /// deployment has one configured. Default is no traffic model, so
    /// mappers that never deal in packets need no changes.
    fn map_traffic(&self, _line: &str) -> Option<ByteEvent> {
        None
    }
}

pub struct DcRound {
    pub state: ClientState,
    round: Option<RoundConfig>,
    store: Option<CounterStore>,
}

impl Default for DcRound {
    fn default() -> Self {
        Self {
            state: ClientState::Idle,
            round: None,
            store: None,
        }
    }
}

impl DcRound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self) -> CoreResult<()> {
        self.state = self
            .state
            .on_register()
            .map_err(|e| PrivCountError::Fatal(format!("dc register: {e:?}")))?;
        Ok(())
    }

    /// Runs Initial Checks and Round-Start Checks (§4.6), refusing the round
    /// on any failure or unexpired delay requirement; on success draws noise,
    /// generates per-SK blinding shares, seals one envelope per SK, and
    /// initializes the local masked store. Returns the sealed envelopes
    /// keyed by SK fingerprint.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare<R: RngCore + CryptoRng>(
        &mut self,
        round: RoundConfig,
        previous: Option<&RoundConfig>,
        delay_state: &mut DelayState,
        delay_period_secs: u64,
        epsilon: f64,
        my_weight: f64,
        sk_pubkeys: &BTreeMap<String, RsaPublicKey>,
        rng: &mut R,
    ) -> CoreResult<BTreeMap<String, Vec<u8>>> {
        round.initial_checks(true)?;
        verify_sk_fingerprints(&round.sk_fingerprints, sk_pubkeys)?;

        let decision = round.round_start_checks(previous, &delay_state.pinned_sigma, epsilon);
        if decision == DelayDecision::DelayRequired {
            let last_end = delay_state.last_round_end_time.unwrap_or(0);
            let ready_at = last_end.saturating_add(delay_period_secs);
            if now_secs() < ready_at {
                return Err(PrivCountError::DelayRequired {
                    counter: round.round_id.clone(),
                });
            }
            // Delay period has elapsed: this round starts a new undelayed
            // sequence, so the pinned sigma anchor resets to it.
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

        let sk_ids: Vec<String> = sk_pubkeys.keys().cloned().collect();
        let (per_sk, dc_sum) = generate_shares(rng, &sk_ids, &round.counters);

        let mut envelopes = BTreeMap::new();
        for payload in &per_sk {
            let pubkey = sk_pubkeys.get(&payload.to_sk).ok_or_else(|| {
                PrivCountError::ConfigInvalid {
                    round_id: round.round_id.clone(),
                    reason: format!("no public key for SK {}", payload.to_sk),
                }
            })?;
            let plaintext = serde_json::to_vec(&payload.shares).map_err(|e| {
                PrivCountError::Fatal(format!("share serialization failed: {e}"))
            })?;
            let sealed = envelope::seal(pubkey, &plaintext)
                .map_err(|e| PrivCountError::Fatal(format!("envelope seal failed: {e}")))?;
            envelopes.insert(payload.to_sk.clone(), sealed);
        }

        let mut noise_totals: BTreeMap<String, Vec<Fe>> = BTreeMap::new();
        for def in &round.counters {
            let bins = draw_noise_for_counter(
                rng,
                def.sigma,
                my_weight,
                def.bins.len(),
                def.noise_required,
            );
            noise_totals.insert(def.name.clone(), bins);
        }

        self.store = Some(CounterStore::initialize(&round.counters, &dc_sum, &noise_totals));

        let sigmas: BTreeMap<String, f64> =
            round.counters.iter().map(|c| (c.name.clone(), c.sigma)).collect();
        let new_hash = crate::state::hash_noise_allocation(&sigmas);
        if delay_state.last_noise_allocation_hash.as_deref() != Some(new_hash.as_str()) {
            info!(round_id = %round.round_id, "noise allocation changed since last round");
        }
        delay_state.last_noise_allocation_hash = Some(new_hash);

        self.state = self
            .state
            .on_config_accept()
            .map_err(|e| PrivCountError::Fatal(format!("dc config_accept: {e:?}")))?;
        self.round = Some(round);
        Ok(envelopes)
    }

    /// Decodes `packets` against the round's traffic model, if any, and
    /// applies the resulting counter increments to the local store. No-op if
    /// this round has no traffic model configured (§4.4).
    pub fn record_traffic_observation(&mut self, packets: &[Packet]) {
        let Some(model) = self.round.as_ref().and_then(|r| r.traffic_model.as_ref()) else {
            return;
        };
        let increments = model.decode_increments(packets);
        let Some(store) = self.store.as_mut() else { return };
        for (name, delta) in increments {
            if let Err(e) = store.increment_bin(&name, 0, delta) {
                warn!(error = %e, counter = name, "traffic-model increment dropped");
            }
        }
    }

    /// Maps one event-source line to a byte event via `mapper`, splits it
    /// into packets, and records the resulting traffic-model increments.
    pub fn apply_traffic_event(&mut self, mapper: &dyn EventMapper, line: &str) {
        let Some(event) = mapper.map_traffic(line) else {
            return;
        };
        let packets = split_into_packets(event);
        self.record_traffic_observation(&packets);
    }

    pub fn start_collecting(&mut self) -> CoreResult<()> {
        self.state = self
            .state
            .on_start_round()
            .map_err(|e| PrivCountError::Fatal(format!("dc start_round: {e:?}")))?;
        Ok(())
    }

    /// Applies one event-source line, incrementing the matching counter's
    /// bin. A line that maps to a value outside every bin is dropped and
    /// logged, not an error (§4.1).
    pub fn apply_event(&mut self, mapper: &dyn EventMapper, line: &str) {
        let Some((counter_name, value, delta)) = mapper.map(line) else {
            return;
        };
        let Some(round) = &self.round else { return };
        let Some(def) = round.counters.iter().find(|c| c.name == counter_name) else {
            warn!(counter = counter_name, "event for unknown counter dropped");
            return;
        };
        if let Some(store) = &mut self.store {
            if let Err(e) = store.increment(def, value, delta) {
                warn!(error = %e, "event dropped");
            }
        }
    }

    /// Aborts the round from COLLECTING without transmitting totals (e.g. on
    /// receipt of `STOP_ROUND`, §4.5 "Cancellation").
    pub fn abort(&mut self) -> CoreResult<()> {
        self.state = self
            .state
            .on_round_end()
            .map_err(|e| PrivCountError::Fatal(format!("dc abort: {e:?}")))?;
        self.round = None;
        self.store = None;
        Ok(())
    }

    /// Transitions to TALLYING and returns the masked totals to send to the
    /// TS.
    pub fn tally(&mut self) -> CoreResult<BTreeMap<String, Vec<Fe>>> {
        self.state = self
            .state
            .on_tally()
            .map_err(|e| PrivCountError::Fatal(format!("dc tally: {e:?}")))?;
        Ok(self.store.as_ref().map(CounterStore::snapshot).unwrap_or_default())
    }

    /// Completes the round, persisting `last_round_end_time` for the next
    /// delay-enforcement check.
    pub fn round_end(&mut self, delay_state: &mut DelayState) -> CoreResult<()> {
        self.state = self
            .state
            .on_round_end()
            .map_err(|e| PrivCountError::Fatal(format!("dc round_end: {e:?}")))?;
        delay_state.last_round_end_time = Some(now_secs());
        self.round = None;
        self.store = None;
        info!("round completed, returning to idle");
        Ok(())
    }
}

/// Checks every SK this DC holds a public key for against the TS-advertised
/// trust anchor (§4.2): the TS-provided `sk_fingerprints` map is the source
/// of truth, and a DC must refuse to share with any SK whose locally loaded
/// key doesn't hash to the fingerprint the TS claims for it.
fn verify_sk_fingerprints(
    expected: &BTreeMap<String, String>,
    sk_pubkeys: &BTreeMap<String, RsaPublicKey>,
) -> CoreResult<()> {
    for (sk_id, pubkey) in sk_pubkeys {
        let Some(want) = expected.get(sk_id) else {
            return Err(PrivCountError::AuthFailed {
                fingerprint: sk_id.clone(),
                reason: "TS did not advertise a fingerprint for this SK".into(),
            });
        };
        let got = hex::encode(envelope::fingerprint(pubkey).map_err(|e| {
            PrivCountError::Fatal(format!("fingerprinting SK {sk_id} pubkey: {e}"))
        })?);
        if &got != want {
            return Err(PrivCountError::AuthFailed {
                fingerprint: sk_id.clone(),
                reason: "local SK public key does not match TS-advertised fingerprint".into(),
            });
        }
    }
    Ok(())
}

fn load_sk_public_keys(
    paths: &BTreeMap<String, String>,
) -> CoreResult<BTreeMap<String, RsaPublicKey>> {
    let mut keys = BTreeMap::new();
    for (fingerprint, path) in paths {
        let pem = std::fs::read_to_string(path)
            .map_err(|e| PrivCountError::Fatal(format!("reading SK pubkey {path}: {e}")))?;
        let key = RsaPublicKey::from_public_key_pem(&pem)
            .map_err(|e| PrivCountError::Fatal(format!("parsing SK pubkey {path}: {e}")))?;
        keys.insert(fingerprint.clone(), key);
    }
    Ok(keys)
}

/// Connects to the TS, completes the handshake and registration, then loops
/// forever driving one round per `Config`/`StartRound`/`Tally` cycle (§4.5).
pub async fn run(config: DcConfig) -> CoreResult<()> {
    let modulus = config
        .common
        .parsed_modulus()
        .map_err(|e| PrivCountError::Fatal(e.to_string()))?;
    privcount_core::field::set_modulus(modulus);

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
            role: Role::Dc,
            fingerprint: config.common.fingerprint.clone(),
            supported_counters: vec![],
        },
    )
    .await
    .map_err(|e| PrivCountError::DeliveryFailed {
        peer: "ts".into(),
        reason: e.to_string(),
    })?;

    let sk_pubkeys = load_sk_public_keys(&config.sk_public_key_paths)?;
    let mut event_source = EventSource::connect(
        &config.event_source_addr,
        config.auth_mode,
        config.auth_cookie_path.as_deref().map(Path::new),
        config.auth_password.as_deref(),
    )
    .await
    .map_err(|e| PrivCountError::EventSourceDown {
        reason: e.to_string(),
    })?;

    let mut dc = DcRound::new();
    dc.register()?;

    let state_path = crate::config::privcount_data_dir()
        .join(format!("dc_{}_delay.json", config.common.fingerprint));
    let mut delay_state = DelayState::load_or_default(state_path);
    let mut previous_round: Option<RoundConfig> = None;
    let mut rng = rand_chacha::ChaCha20Rng::from_entropy();

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

        let my_weight = *round.noise_weights.get(&config.common.fingerprint).unwrap_or(&1.0);
        let envelopes = match dc.prepare(
            round.clone(),
            previous_round.as_ref(),
            &mut delay_state,
            config.common.delay_period_secs,
            config.common.sigma_decrease_epsilon,
            my_weight,
            &sk_pubkeys,
            &mut rng,
        ) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "round preparation failed, skipping round");
                continue;
            }
        };

        for (to_sk, envelope_bytes) in envelopes {
            transport::send(
                &mut stream,
                &Message::ShareEnvelope {
                    round_id: round.round_id.clone(),
                    from_dc: config.common.fingerprint.clone(),
                    to_sk,
                    hybrid_ciphertext_hex: hex::encode(envelope_bytes),
                },
            )
            .await
            .map_err(|e| PrivCountError::DeliveryFailed {
                peer: "ts".into(),
                reason: e.to_string(),
            })?;
        }

        let start_msg = transport::recv(&mut stream)
            .await
            .map_err(|e| PrivCountError::Fatal(format!("recv start_round: {e}")))?;
        if !matches!(start_msg, Message::StartRound { .. }) {
            dc.abort()?;
            continue;
        }
        dc.start_collecting()?;

        let deadline = tokio::time::Instant::now()
            + tokio::time::Duration::from_secs(round.periods.collect_period_secs);
        loop {
            tokio::select! {
                line = event_source.next_event_line() => {
                    match line {
                        Ok(raw) => {
                            dc.apply_event(&LineMapper, &raw);
                            dc.apply_traffic_event(&LineMapper, &raw);
                        }
                        Err(e) => {
                            warn!(error = %e, "event source closed");
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let masked = dc.tally()?;
        let snapshots = masked
            .into_iter()
            .map(|(k, v)| (k, v.into_iter().map(|fe| fe.to_hex()).collect()))
            .collect();
        transport::send(
            &mut stream,
            &Message::Tally {
                round_id: round.round_id.clone(),
                snapshots,
            },
        )
        .await
        .map_err(|e| PrivCountError::DeliveryFailed {
            peer: "ts".into(),
            reason: e.to_string(),
        })?;

        dc.round_end(&mut delay_state)?;
        let _ = delay_state.persist();
        previous_round = Some(round);
        info!("round complete, waiting for next config");
    }
}

/// Placeholder line mapper used when no richer event-to-counter dispatcher
/// is configured; always drops the line. The real mapping is a pure
/// function owned at this system's boundary (§1).
struct LineMapper;
impl EventMapper for LineMapper {
    fn map(&self, _line: &str) -> Option<(String, f64, u64)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use num_traits::FromPrimitive;
    use privcount_core::config::{Periods, Thresholds};
    use privcount_core::counter::{Bin, CounterKind};
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;
    use rsa::RsaPrivateKey;

    fn ensure_modulus() {
        let _ = privcount_core::field::set_modulus(BigUint::from_u64(1u64 << 61).unwrap());
    }

    fn scalar_round(round_id: &str, sigma: f64) -> RoundConfig {
        RoundConfig {
            round_id: round_id.into(),
            counters: vec![privcount_core::counter::CounterDef {
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
                sk_threshold: 1,
            },
            always_delay: false,
            traffic_model: None,
        }
    }

    fn with_sk_fingerprint(mut round: RoundConfig, sk_id: &str, pubkey: &RsaPublicKey) -> RoundConfig {
        round
            .sk_fingerprints
            .insert(sk_id.to_string(), hex::encode(envelope::fingerprint(pubkey).unwrap()));
        round
    }

    struct OneToOneMapper;
    impl EventMapper for OneToOneMapper {
        fn map(&self, line: &str) -> Option<(String, f64, u64)> {
            if line == "STREAM_BEGIN" {
                Some(("StreamCount".to_string(), 0.0, 1))
            } else {
                None
            }
        }
    }

    #[test]
    fn full_round_with_zero_sigma_sums_increments() {
        ensure_modulus();
        let mut rng = ChaCha20Rng::from_seed([1u8; 32]);
        let sk_private = RsaPrivateKey::new(&mut rng, 512).unwrap();
        let sk_public = rsa::RsaPublicKey::from(&sk_private);
        let sk_pubkeys = BTreeMap::from([("sk1".to_string(), sk_public.clone())]);

        let mut dc = DcRound::new();
        dc.register().unwrap();
        let mut delay_state = DelayState::default();
        let envelopes = dc
            .prepare(
                with_sk_fingerprint(scalar_round("r1", 0.0), "sk1", &sk_public),
                None,
                &mut delay_state,
                86400,
                1e-6,
                1.0,
                &sk_pubkeys,
                &mut rng,
            )
            .unwrap();
        assert_eq!(envelopes.len(), 1);

        dc.start_collecting().unwrap();
        let mapper = OneToOneMapper;
        for _ in 0..7 {
            dc.apply_event(&mapper, "STREAM_BEGIN");
        }
        let masked = dc.tally().unwrap();
        dc.round_end(&mut delay_state).unwrap();
        assert_eq!(dc.state, ClientState::Idle);
        assert!(masked.contains_key("StreamCount"));
    }

    #[test]
    fn delay_required_when_sigma_decreases_before_period_elapses() {
        ensure_modulus();
        let mut rng = ChaCha20Rng::from_seed([2u8; 32]);
        let sk_private = RsaPrivateKey::new(&mut rng, 512).unwrap();
        let sk_public = rsa::RsaPublicKey::from(&sk_private);
        let sk_pubkeys = BTreeMap::from([("sk1".to_string(), sk_public.clone())]);

        let mut dc = DcRound::new();
        dc.register().unwrap();
        let mut delay_state = DelayState::default();
        dc.prepare(
            with_sk_fingerprint(scalar_round("r1", 10.0), "sk1", &sk_public),
            None,
            &mut delay_state,
            86400,
            1e-6,
            1.0,
            &sk_pubkeys,
            &mut rng,
        )
        .unwrap();
        dc.start_collecting().unwrap();
        dc.tally().unwrap();
        dc.round_end(&mut delay_state).unwrap();

        dc.register().unwrap();
        let previous = with_sk_fingerprint(scalar_round("r1", 10.0), "sk1", &sk_public);
        let result = dc.prepare(
            with_sk_fingerprint(scalar_round("r2", 5.0), "sk1", &sk_public),
            Some(&previous),
            &mut delay_state,
            86400,
            1e-6,
            1.0,
            &sk_pubkeys,
            &mut rng,
        );
        assert!(matches!(result, Err(PrivCountError::DelayRequired { .. })));
    }
}
