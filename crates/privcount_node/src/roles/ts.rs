//! Tally Server round driver (§4.5, §4.6, §4.7). Owns the outer round state
//! machine, gates the threshold wait, aggregates DC totals and SK share
//! sums modulo q, and publishes the outcomes file.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use privcount_core::config::RoundConfig;
use privcount_core::counter::CounterDef;
use privcount_core::field::Fe;
use privcount_core::{PrivCountError, Result as CoreResult};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::config::TsConfig;
use crate::liveness::LivenessTracker;
use crate::outcomes::{self, Context};
use crate::protocol::{self, Message, Role};
use crate::round::TsState;
use crate::transport;

#[derive(Default)]
pub struct TsRound {
    pub state: TsState,
    round: Option<RoundConfig>,
    prepared_dcs: BTreeSet<String>,
    prepared_sks: BTreeSet<String>,
    dc_totals: BTreeMap<String, BTreeMap<String, Vec<Fe>>>,
    sk_sums: BTreeMap<String, BTreeMap<String, Vec<Fe>>>,
    start_time: u64,
}

impl TsRound {
    pub fn new() -> Self {
        Self {
            state: TsState::Idle,
            ..Self::default()
        }
    }

    /// Publishes a new round's configuration, entering WAITING_FOR_THRESHOLDS.
    pub fn publish_config(&mut self, round: RoundConfig) -> CoreResult<()> {
        round.initial_checks(true)?;
        self.state = self
            .state
            .on_config_published()
            .map_err(|e| PrivCountError::Fatal(format!("ts config_published: {e:?}")))?;
        self.prepared_dcs.clear();
        self.prepared_sks.clear();
        self.dc_totals.clear();
        self.sk_sums.clear();
        self.round = Some(round);
        Ok(())
    }

    pub fn mark_dc_prepared(&mut self, fingerprint: &str) {
        self.prepared_dcs.insert(fingerprint.to_string());
    }

    pub fn mark_sk_prepared(&mut self, fingerprint: &str) {
        self.prepared_sks.insert(fingerprint.to_string());
    }

    /// Attempts to leave WAITING_FOR_THRESHOLDS; refuses until both
    /// thresholds are met (§4.5).
    pub fn try_start(&mut self) -> CoreResult<()> {
        let round = self.round.as_ref().ok_or_else(|| {
            PrivCountError::Fatal("try_start called with no published round".into())
        })?;
        self.state = self
            .state
            .try_start(
                self.prepared_dcs.len(),
                self.prepared_sks.len(),
                round.thresholds.dc_threshold,
                round.thresholds.sk_threshold,
            )
            .map_err(|_| PrivCountError::ThresholdUnmet {
                role: "ts",
                have: self.prepared_dcs.len().min(self.prepared_sks.len()),
                need: round.thresholds.dc_threshold.max(round.thresholds.sk_threshold),
            })?;
        self.start_time = crate::liveness::now_secs();
        Ok(())
    }

    pub fn on_collect_deadline(&mut self) -> CoreResult<()> {
        self.state = self
            .state
            .on_collect_deadline()
            .map_err(|e| PrivCountError::Fatal(format!("ts collect_deadline: {e:?}")))?;
        Ok(())
    }

    pub fn receive_tally(&mut self, dc_fingerprint: &str, totals: BTreeMap<String, Vec<Fe>>) {
        self.dc_totals.insert(dc_fingerprint.to_string(), totals);
    }

    pub fn receive_shares(&mut self, sk_fingerprint: &str, sums: BTreeMap<String, Vec<Fe>>) {
        self.sk_sums.insert(sk_fingerprint.to_string(), sums);
    }

    /// Broadcasts `STOP_ROUND` and returns to IDLE unconditionally (§4.5
    /// "Cancellation").
    pub fn abort(&mut self) {
        self.state = self.state.on_stop_round();
        self.round = None;
    }

    /// Sums every DC's masked totals and every SK's share sum modulo q
    /// (§4.7), checks the ZeroCount validity invariant, and writes the
    /// outcomes file. Returns the published document on success.
    pub fn aggregate_and_publish(
        &mut self,
        round_id_check: &str,
        outcomes_path: &std::path::Path,
    ) -> CoreResult<Value> {
        // Delivery-time threshold gate (§4.5): `try_start` only checked that
        // enough DCs/SKs *registered*; a registered node can still fail to
        // deliver its Tally/Shares message before the deadline. Aggregating
        // whatever happened to arrive would silently under-count, so refuse
        // if too few actually delivered.
        {
            let round = self.round.as_ref().ok_or_else(|| {
                PrivCountError::Fatal("aggregate called with no active round".into())
            })?;
            if self.dc_totals.len() < round.thresholds.dc_threshold
                || self.sk_sums.len() < round.thresholds.sk_threshold
            {
                let have = self.dc_totals.len().min(self.sk_sums.len());
                let need = round.thresholds.dc_threshold.max(round.thresholds.sk_threshold);
                self.state = self.state.on_stop_round();
                self.round = None;
                return Err(PrivCountError::ThresholdUnmet {
                    role: "ts",
                    have,
                    need,
                });
            }
        }

        self.state = self
            .state
            .on_sums_complete()
            .map_err(|e| PrivCountError::Fatal(format!("ts sums_complete: {e:?}")))?;

        let round = self.round.take().ok_or_else(|| {
            PrivCountError::Fatal("aggregate called with no active round".into())
        })?;
        if round.round_id != round_id_check {
            return Err(PrivCountError::Fatal(format!(
                "round id mismatch: expected {}, got {round_id_check}",
                round.round_id
            )));
        }

        let totals = aggregate_totals(&round.counters, &self.dc_totals, &self.sk_sums);

        let context = Context {
            round_id: round.round_id.clone(),
            start_time: self.start_time,
            end_time: crate::liveness::now_secs(),
            dc_fingerprints: self.prepared_dcs.iter().cloned().collect(),
            sk_fingerprints: self.prepared_sks.iter().cloned().collect(),
        };

        let doc = outcomes::build_outcomes(context, &round.counters, &totals).map_err(|e| {
            PrivCountError::AggregationInvalid {
                round_id: round.round_id.clone(),
                reason: e.to_string(),
            }
        })?;

        outcomes::write_outcomes(outcomes_path, &doc).map_err(|e| {
            PrivCountError::AggregationInvalid {
                round_id: round.round_id.clone(),
                reason: e.to_string(),
            }
        })?;

        self.state = self
            .state
            .on_published()
            .map_err(|e| PrivCountError::Fatal(format!("ts published: {e:?}")))?;
        info!(round_id = round.round_id, "round published");
        Ok(doc)
    }
}

/// `noisy_total_{c,b} = (sum_d masked_{d,c,b} + sum_s share_sum_{s,c,b}) mod q`.
fn aggregate_totals(
    defs: &[CounterDef],
    dc_totals: &BTreeMap<String, BTreeMap<String, Vec<Fe>>>,
    sk_sums: &BTreeMap<String, BTreeMap<String, Vec<Fe>>>,
) -> BTreeMap<String, Vec<Fe>> {
    let mut out = BTreeMap::new();
    for def in defs {
        let n = def.bins.len().max(1);
        let mut bins = vec![Fe::zero(); n];
        for totals in dc_totals.values() {
            if let Some(values) = totals.get(&def.name) {
                for (i, v) in values.iter().enumerate().take(n) {
                    bins[i] = bins[i].add(v);
                }
            }
        }
        for sums in sk_sums.values() {
            if let Some(values) = sums.get(&def.name) {
                for (i, v) in values.iter().enumerate().take(n) {
                    bins[i] = bins[i].add(v);
                }
            }
        }
        out.insert(def.name.clone(), bins);
    }
    out
}

/// Registered connections, keyed by long-term fingerprint, so a
/// `ShareEnvelope` destined for one SK can be relayed from the DC connection
/// that produced it without every node dialing every other node.
#[derive(Clone, Default)]
struct Registry(Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>>);

impl Registry {
    fn new() -> Self {
        Self::default()
    }

    async fn insert(&self, fingerprint: String, tx: mpsc::UnboundedSender<Message>) {
        self.0.lock().await.insert(fingerprint, tx);
    }

    async fn remove(&self, fingerprint: &str) {
        self.0.lock().await.remove(fingerprint);
    }

    async fn forward(&self, fingerprint: &str, msg: Message) {
        if let Some(tx) = self.0.lock().await.get(fingerprint) {
            let _ = tx.send(msg);
        }
    }

    async fn broadcast(&self, msg: Message) {
        for tx in self.0.lock().await.values() {
            let _ = tx.send(msg.clone());
        }
    }
}

fn decode_snapshots(raw: BTreeMap<String, Vec<String>>) -> BTreeMap<String, Vec<Fe>> {
    raw.into_iter()
        .map(|(name, bins)| {
            let parsed = bins.iter().filter_map(|b| Fe::from_hex(b)).collect();
            (name, parsed)
        })
        .collect()
}

/// Services one accepted connection end to end: handshake, registration,
/// then `Heartbeat`/`ShareEnvelope`/`Tally`/`Shares` for as long as the
/// client keeps the socket open.
async fn handle_connection(
    mut stream: transport::MessageStream,
    registry: Registry,
    ts: Arc<Mutex<TsRound>>,
    liveness: Arc<Mutex<LivenessTracker>>,
    handshake_key: Vec<u8>,
) -> CoreResult<()> {
    transport::server_handshake(&mut stream, &handshake_key)
        .await
        .map_err(|e| PrivCountError::AuthFailed {
            fingerprint: "unknown".into(),
            reason: e.to_string(),
        })?;

    let first = transport::recv(&mut stream)
        .await
        .map_err(|e| PrivCountError::DeliveryFailed {
            peer: "unknown".into(),
            reason: e.to_string(),
        })?;
    let (role, fingerprint) = match first {
        Message::Register {
            role, fingerprint, ..
        } => (role, fingerprint),
        _ => {
            return Err(PrivCountError::AuthFailed {
                fingerprint: "unknown".into(),
                reason: "expected Register as first message after handshake".into(),
            })
        }
    };

    // The protocol has no separate "config accepted" acknowledgment: a node
    // that cannot prepare locally aborts without round-tripping, so
    // registration itself is the signal the threshold wait counts (§4.5).
    {
        let mut guard = ts.lock().await;
        match role {
            Role::Dc => guard.mark_dc_prepared(&fingerprint),
            Role::Sk => guard.mark_sk_prepared(&fingerprint),
        }
    }
    liveness.lock().await.record_checkin(&fingerprint);

    let (mut sink, mut source) = stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    registry.insert(fingerprint.clone(), tx).await;

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let bytes = protocol::encode(&msg).map_err(|e| {
                            PrivCountError::DeliveryFailed {
                                peer: fingerprint.clone(),
                                reason: e.to_string(),
                            }
                        })?;
                        if sink.send(bytes.into()).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = source.next() => {
                match inbound {
                    Some(Ok(frame)) => {
                        let msg = match protocol::decode(&frame) {
                            Ok(m) => m,
                            Err(e) => {
                                warn!(fingerprint, error = %e, "malformed frame, dropping connection");
                                break;
                            }
                        };
                        match msg {
                            Message::Heartbeat { .. } => {
                                liveness.lock().await.record_checkin(&fingerprint);
                            }
                            Message::ShareEnvelope { ref to_sk, .. } => {
                                registry.forward(to_sk, msg.clone()).await;
                            }
                            Message::Tally { snapshots, .. } => {
                                ts.lock().await.receive_tally(&fingerprint, decode_snapshots(snapshots));
                            }
                            Message::Shares { sums, .. } => {
                                ts.lock().await.receive_shares(&fingerprint, decode_snapshots(sums));
                            }
                            Message::ShareFailed { from_dc, reason, .. } => {
                                warn!(from_dc, reason, "SK reported a share it could not use");
                            }
                            Message::StopRound { .. } => {}
                            _ => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!(fingerprint, error = %e, "connection read error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    registry.remove(&fingerprint).await;
    Ok(())
}

/// Mints a fresh round id from the static template and drives one full
/// collect-then-tally cycle, looping forever. Failures within a single round
/// (threshold unmet, publication invalid) are logged and the scheduler moves
/// on to the next cycle rather than tearing down the process.
async fn run_round_scheduler(
    config: TsConfig,
    ts: Arc<Mutex<TsRound>>,
    registry: Registry,
) -> CoreResult<()> {
    let mut round_counter: u64 = 0;
    loop {
        let template: crate::config::RoundTemplate =
            crate::config::load_yaml(Path::new(&config.round_template_path)).map_err(|e| {
                PrivCountError::ConfigInvalid {
                    round_id: format!("round-{}", round_counter + 1),
                    reason: e.to_string(),
                }
            })?;
        round_counter += 1;
        let round_id = format!("round-{round_counter}");
        let round = template
            .clone()
            .into_round(round_id.clone(), config.dc_threshold, config.sk_threshold);

        {
            let mut guard = ts.lock().await;
            if let Err(e) = guard.publish_config(round.clone()) {
                warn!(round_id, error = %e, "failed to publish round config, retrying");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        }
        registry
            .broadcast(Message::Config {
                round_id: round_id.clone(),
                counters: round.counters.clone(),
                noise_weights: round.noise_weights.clone(),
                sk_pubkey_fingerprints: round.sk_fingerprints.clone(),
                periods: round.periods,
                traffic_model: round.traffic_model.clone(),
            })
            .await;

        // Grace window for prepared DCs/SKs to register before the
        // threshold check; nodes already connected from a prior round are
        // already in the registry and need no extra time.
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        {
            let mut guard = ts.lock().await;
            if let Err(e) = guard.try_start() {
                warn!(round_id, error = %e, "threshold unmet, aborting round");
                guard.abort();
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                continue;
            }
        }
        registry
            .broadcast(Message::StartRound {
                round_id: round_id.clone(),
                start_time: crate::liveness::now_secs(),
            })
            .await;

        tokio::time::sleep(std::time::Duration::from_secs(round.periods.collect_period_secs)).await;
        {
            let mut guard = ts.lock().await;
            if let Err(e) = guard.on_collect_deadline() {
                warn!(round_id, error = %e, "collect deadline transition failed");
            }
        }

        // Grace period for in-flight Tally/Shares messages to land.
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        let outcomes_path = Path::new(&config.outcomes_dir).join(format!("{round_id}.json"));
        let mut guard = ts.lock().await;
        match guard.aggregate_and_publish(&round_id, &outcomes_path) {
            Ok(_) => info!(round_id, "round published"),
            Err(e) => warn!(round_id, error = %e, "round publication failed"),
        }
    }
}

/// Runs the Tally Server: an accept loop handing each connection to
/// [`handle_connection`], and a round-scheduling loop driven off the static
/// round template, running concurrently on the same executor.
pub async fn run(config: TsConfig) -> CoreResult<()> {
    privcount_core::field::set_modulus(config.common.parsed_modulus().map_err(|e| {
        PrivCountError::ConfigInvalid {
            round_id: "startup".into(),
            reason: e.to_string(),
        }
    })?);

    let cert_pem = std::fs::read(&config.tls_cert_path).map_err(|e| {
        PrivCountError::ConfigInvalid {
            round_id: "startup".into(),
            reason: format!("tls_cert_path: {e}"),
        }
    })?;
    let key_pem = std::fs::read(&config.tls_key_path).map_err(|e| {
        PrivCountError::ConfigInvalid {
            round_id: "startup".into(),
            reason: format!("tls_key_path: {e}"),
        }
    })?;
    let tls_config = transport::load_server_config(&cert_pem, &key_pem).map_err(|e| {
        PrivCountError::ConfigInvalid {
            round_id: "startup".into(),
            reason: e.to_string(),
        }
    })?;
    let acceptor = transport::tls_acceptor(tls_config);
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| PrivCountError::Fatal(format!("bind {}: {e}", config.listen_addr)))?;

    let handshake_key = hex::decode(&config.common.handshake_key_hex).map_err(|e| {
        PrivCountError::ConfigInvalid {
            round_id: "startup".into(),
            reason: format!("handshake_key_hex: {e}"),
        }
    })?;

    let ts = Arc::new(Mutex::new(TsRound::new()));
    let liveness = Arc::new(Mutex::new(LivenessTracker::new()));
    let registry = Registry::new();

    let scheduler = tokio::spawn(run_round_scheduler(
        config.clone(),
        ts.clone(),
        registry.clone(),
    ));

    info!(addr = config.listen_addr, "tally server listening");
    loop {
        let (tcp, peer) = listener
            .accept()
            .await
            .map_err(|e| PrivCountError::Fatal(format!("accept: {e}")))?;
        let stream = match transport::accept_client(&acceptor, tcp).await {
            Ok(s) => s,
            Err(e) => {
                warn!(%peer, error = %e, "tls accept failed");
                continue;
            }
        };
        let ts = ts.clone();
        let liveness = liveness.clone();
        let registry = registry.clone();
        let key = handshake_key.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, registry, ts, liveness, key).await {
                warn!(%peer, error = %e, "connection closed");
            }
        });

        if scheduler.is_finished() {
            return Err(PrivCountError::Fatal("round scheduler task exited".into()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_bigint::BigUint;
    use num_traits::FromPrimitive;
    use privcount_core::config::{Periods, Thresholds};
    use privcount_core::counter::{Bin, CounterKind, ZERO_COUNT};
    use privcount_core::share::generate_shares;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn ensure_modulus() {
        let _ = privcount_core::field::set_modulus(BigUint::from_u64(1u64 << 61).unwrap());
    }

    fn round_with(counters: Vec<CounterDef>, dc_threshold: usize, sk_threshold: usize) -> RoundConfig {
        RoundConfig {
            round_id: "r1".into(),
            counters,
            noise_weights: BTreeMap::from([("dc1".to_string(), 1.0)]),
            sk_fingerprints: BTreeMap::new(),
            periods: Periods {
                collect_period_secs: 60,
                event_period_secs: 10,
                checkin_period_secs: 5,
            },
            thresholds: Thresholds {
                dc_threshold,
                sk_threshold,
            },
            always_delay: false,
            traffic_model: None,
        }
    }

    #[test]
    fn refuses_start_until_thresholds_met() {
        ensure_modulus();
        let mut ts = TsRound::new();
        ts.publish_config(round_with(vec![], 2, 1)).unwrap();
        ts.mark_dc_prepared("dc1");
        assert!(ts.try_start().is_err());
        ts.mark_dc_prepared("dc2");
        ts.mark_sk_prepared("sk1");
        assert!(ts.try_start().is_ok());
    }

    #[test]
    fn aggregation_combines_masked_totals_and_share_sums() {
        ensure_modulus();
        let defs = vec![CounterDef {
            name: "StreamCount".into(),
            kind: CounterKind::Scalar,
            bins: vec![Bin::scalar()],
            sigma: 0.0,
            noise_required: false,
        }];

        // DC's masked total is (noise - S) + increments; with noise=0 and
        // increments=7, masked = -S. SK's share_sum = S. Aggregating both
        // should cancel the mask and leave 7.
        let mut rng = ChaCha20Rng::from_seed([4u8; 32]);
        let (per_sk, dc_sum) = generate_shares(&mut rng, &["sk1".to_string()], &defs);
        let mut store = privcount_core::counter::CounterStore::initialize(
            &defs,
            &dc_sum,
            &BTreeMap::new(),
        );
        for _ in 0..7 {
            store.increment(&defs[0], 0.0, 1).unwrap();
        }

        let mut ts = TsRound::new();
        ts.publish_config(round_with(defs.clone(), 1, 1)).unwrap();
        ts.mark_dc_prepared("dc1");
        ts.mark_sk_prepared("sk1");
        ts.try_start().unwrap();
        ts.on_collect_deadline().unwrap();
        ts.receive_tally("dc1", store.snapshot());
        ts.receive_shares("sk1", per_sk[0].shares.clone());

        let dir = std::env::temp_dir().join(format!("privcount_ts_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("outcomes.json");
        let doc = ts.aggregate_and_publish("r1", &path).unwrap();
        let value = doc["Tally"]["StreamCount"]["bins"][0][2]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(value, "7");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn nonzero_zero_count_marks_round_invalid() {
        ensure_modulus();
        let defs = vec![CounterDef {
            name: ZERO_COUNT.into(),
            kind: CounterKind::Scalar,
            bins: vec![Bin::scalar()],
            sigma: 0.0,
            noise_required: false,
        }];
        let mut ts = TsRound::new();
        ts.publish_config(round_with(defs, 1, 1)).unwrap();
        ts.mark_dc_prepared("dc1");
        ts.mark_sk_prepared("sk1");
        ts.try_start().unwrap();
        ts.on_collect_deadline().unwrap();
        let mut bad = BTreeMap::new();
        bad.insert(ZERO_COUNT.to_string(), vec![Fe::from_u64(1)]);
        ts.receive_tally("dc1", bad);

        let dir = std::env::temp_dir().join(format!("privcount_ts_test2_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("outcomes.json");
        let result = ts.aggregate_and_publish("r1", &path);
        assert!(matches!(result, Err(PrivCountError::AggregationInvalid { .. })));
        assert!(!path.exists());
    }
}
