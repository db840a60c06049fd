//! Traffic-model counter expansion (§4.4): a declarative HMM over packet
//! sizes and inter-packet delays, decoded with Viterbi to drive per-state
//! counter increments.

use crate::counter::{Bin, CounterDef, CounterKind};
use serde::{Deserialize, Serialize};

/// A single byte-event observed from the event source: `B` bytes over
/// duration `T` seconds, travelling in `direction`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ByteEvent {
    pub bytes: u64,
    pub duration_secs: f64,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Bytes per packet used for the byte -> packet split (§4.4).
const MAX_PACKET_BYTES: u64 = 1500;

/// One observed packet after splitting: its direction, size, and the delay
/// (zero for every packet after the first in a split).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Packet {
    pub direction: Direction,
    pub delay_secs: f64,
    pub size_bytes: u64,
}

/// Splits a byte event into `ceil(B/1500)` packets; all of the event's delay
/// is assigned to the first packet, subsequent packets get zero delay. Sizes
/// are filled greedily from the front, so only the last packet is partial.
pub fn split_into_packets(event: ByteEvent) -> Vec<Packet> {
    let n = event.bytes.div_ceil(MAX_PACKET_BYTES).max(1);
    let mut remaining = event.bytes;
    (0..n)
        .map(|i| {
            let size = remaining.min(MAX_PACKET_BYTES);
            remaining -= size;
            Packet {
                direction: event.direction,
                delay_secs: if i == 0 { event.duration_secs } else { 0.0 },
                size_bytes: size,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficModel {
    pub states: Vec<String>,
    /// transitions[i][j] = P(state_j | state_i), rows need not sum to 1 for
    /// model specs coming from disk; the decoder works in log-space and
    /// treats non-positive entries as impossible transitions.
    pub transitions: Vec<Vec<f64>>,
    /// emissions[state] = (mean, stddev) of a Normal over log(packet size).
    pub emissions: Vec<(f64, f64)>,
    /// delays[state] = (mean, stddev) of a Normal over log(inter-packet delay).
    pub delays: Vec<(f64, f64)>,
    pub start_log_probs: Vec<f64>,
}

impl TrafficModel {
    /// Expands the model into the template counters of §4.4: one
    /// Transition counter per (src, dst) pair, one Emission and one
    /// LogDelayTime/SquaredLogDelayTime counter per (state, direction).
    pub fn expand_counters(&self) -> Vec<CounterDef> {
        let mut defs = Vec::new();
        let n = self.states.len();
        for i in 0..n {
            for j in 0..n {
                defs.push(CounterDef {
                    name: format!("Transition_{}_{}", self.states[i], self.states[j]),
                    kind: CounterKind::TrafficModel,
                    bins: vec![Bin::scalar()],
                    sigma: 0.0,
                    noise_required: false,
                });
            }
        }
        for state in &self.states {
            for direction in ["In", "Out"] {
                defs.push(CounterDef {
                    name: format!("Emission_{state}_{direction}"),
                    kind: CounterKind::TrafficModel,
                    bins: vec![Bin::scalar()],
                    sigma: 0.0,
                    noise_required: false,
                });
                defs.push(CounterDef {
                    name: format!("LogDelayTime_{state}_{direction}"),
                    kind: CounterKind::TrafficModel,
                    bins: vec![Bin::scalar()],
                    sigma: 0.0,
                    noise_required: false,
                });
                defs.push(CounterDef {
                    name: format!("SquaredLogDelayTime_{state}_{direction}"),
                    kind: CounterKind::TrafficModel,
                    bins: vec![Bin::scalar()],
                    sigma: 0.0,
                    noise_required: false,
                });
            }
        }
        defs
    }

    /// Viterbi decoding over an observation sequence of packets, returning
    /// the most-likely state index sequence. Uses log-probabilities (64-bit
    /// floats) to avoid underflow; ties are broken on the lexicographically
    /// smaller state index.
    pub fn viterbi(&self, observations: &[Packet]) -> Vec<usize> {
        let n = self.states.len();
        if observations.is_empty() || n == 0 {
            return Vec::new();
        }
        let log_trans: Vec<Vec<f64>> = self
            .transitions
            .iter()
            .map(|row| row.iter().map(|&p| ln_or_neg_inf(p)).collect())
            .collect();

        let mut delta = vec![vec![f64::NEG_INFINITY; n]; observations.len()];
        let mut backptr = vec![vec![0usize; n]; observations.len()];

        for s in 0..n {
            delta[0][s] = self.start_log_probs.get(s).copied().unwrap_or(f64::NEG_INFINITY)
                + self.emission_log_prob(s, &observations[0]);
        }

        for t in 1..observations.len() {
            for s in 0..n {
                let mut best_prev = 0usize;
                let mut best_score = f64::NEG_INFINITY;
                for prev in 0..n {
                    let score = delta[t - 1][prev] + log_trans[prev][s];
                    if score > best_score || (score == best_score && prev < best_prev) {
                        best_score = score;
                        best_prev = prev;
                    }
                }
                delta[t][s] = best_score + self.emission_log_prob(s, &observations[t]);
                backptr[t][s] = best_prev;
            }
        }

        let last = observations.len() - 1;
        let mut best_state = 0usize;
        let mut best_score = f64::NEG_INFINITY;
        for s in 0..n {
            if delta[last][s] > best_score || (delta[last][s] == best_score && s < best_state) {
                best_score = delta[last][s];
                best_state = s;
            }
        }

        let mut path = vec![0usize; observations.len()];
        path[last] = best_state;
        for t in (0..last).rev() {
            path[t] = backptr[t + 1][path[t + 1]];
        }
        path
    }

    /// Joint log-probability of a packet's size and delay under `state`'s
    /// emission and delay distributions (both fit over the log of the
    /// observed quantity). The two terms are independent given the state.
    fn emission_log_prob(&self, state: usize, packet: &Packet) -> f64 {
        let (size_mean, size_stddev) = self.emissions.get(state).copied().unwrap_or((0.0, 1.0));
        let (delay_mean, delay_stddev) = self.delays.get(state).copied().unwrap_or((0.0, 1.0));

        // Source truncates rather than rounds when casting these logs to
        // integer counter increments downstream; keep truncation semantics
        // here too so scoring and counting agree on what "zero" means.
        let log_size = if packet.size_bytes > 0 {
            (packet.size_bytes as f64).ln()
        } else {
            0.0
        };
        let log_delay = if packet.delay_secs > 0.0 {
            packet.delay_secs.ln()
        } else {
            0.0
        };

        normal_log_prob(log_size, size_mean, size_stddev)
            + normal_log_prob(log_delay, delay_mean, delay_stddev)
    }

    /// Decodes the most-likely state path for `observations` and returns the
    /// counter increments it implies (§4.4 step 3): one `Transition_{i}_{j}`
    /// per consecutive state pair, and one each of `Emission_{state}_{dir}`,
    /// `LogDelayTime_{state}_{dir}`, `SquaredLogDelayTime_{state}_{dir}` per
    /// observed packet. Names match [`TrafficModel::expand_counters`].
    pub fn decode_increments(&self, observations: &[Packet]) -> Vec<(String, u64)> {
        if observations.is_empty() || self.states.is_empty() {
            return Vec::new();
        }
        let path = self.viterbi(observations);
        let mut out = Vec::with_capacity(path.len() * 3 + path.len().saturating_sub(1));

        for pair in path.windows(2) {
            let (src, dst) = (pair[0], pair[1]);
            out.push((format!("Transition_{}_{}", self.states[src], self.states[dst]), 1));
        }

        for (state, packet) in path.iter().zip(observations.iter()) {
            let dir = match packet.direction {
                Direction::Inbound => "In",
                Direction::Outbound => "Out",
            };
            let name = &self.states[*state];
            out.push((format!("Emission_{name}_{dir}"), 1));

            let log_delay = if packet.delay_secs > 0.0 {
                packet.delay_secs.ln()
            } else {
                0.0
            };
            let truncated = log_delay.max(0.0) as u64;
            out.push((format!("LogDelayTime_{name}_{dir}"), truncated));
            out.push((
                format!("SquaredLogDelayTime_{name}_{dir}"),
                truncated.saturating_mul(truncated),
            ));
        }
        out
    }
}

fn normal_log_prob(x: f64, mean: f64, stddev: f64) -> f64 {
    if stddev <= 0.0 {
        return 0.0;
    }
    let z = (x - mean) / stddev;
    -0.5 * z * z - stddev.ln() - 0.5 * (2.0 * std::f64::consts::PI).ln()
}

fn ln_or_neg_inf(p: f64) -> f64 {
    if p > 0.0 {
        p.ln()
    } else {
        f64::NEG_INFINITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_event_splits_into_ceil_packets() {
        let event = ByteEvent {
            bytes: 3001,
            duration_secs: 0.5,
            direction: Direction::Outbound,
        };
        let packets = split_into_packets(event);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].delay_secs, 0.5);
        assert_eq!(packets[1].delay_secs, 0.0);
        assert_eq!(packets[2].delay_secs, 0.0);
    }

    #[test]
    fn exact_multiple_of_1500_splits_cleanly() {
        let event = ByteEvent {
            bytes: 3000,
            duration_secs: 0.1,
            direction: Direction::Inbound,
        };
        assert_eq!(split_into_packets(event).len(), 2);
    }

    #[test]
    fn viterbi_prefers_lower_index_on_exact_tie() {
        let model = TrafficModel {
            states: vec!["A".into(), "B".into()],
            transitions: vec![vec![0.5, 0.5], vec![0.5, 0.5]],
            emissions: vec![(0.0, 1.0), (0.0, 1.0)],
            delays: vec![(0.0, 1.0), (0.0, 1.0)],
            start_log_probs: vec![0.0, 0.0],
        };
        let obs = vec![Packet {
            direction: Direction::Outbound,
            delay_secs: 1.0,
            size_bytes: 500,
        }];
        let path = model.viterbi(&obs);
        assert_eq!(path, vec![0]);
    }

    #[test]
    fn decode_increments_names_match_expand_counters() {
        let model = TrafficModel {
            states: vec!["A".into(), "B".into()],
            transitions: vec![vec![0.1, 0.9], vec![0.9, 0.1]],
            emissions: vec![(5.0, 1.0), (9.0, 1.0)],
            delays: vec![(0.0, 1.0), (0.0, 1.0)],
            start_log_probs: vec![0.0, 0.0],
        };
        let defs = model.expand_counters();
        let known: std::collections::HashSet<_> = defs.iter().map(|d| d.name.clone()).collect();

        let obs = vec![
            Packet {
                direction: Direction::Outbound,
                delay_secs: 1.0,
                size_bytes: 150,
            },
            Packet {
                direction: Direction::Inbound,
                delay_secs: 2.0,
                size_bytes: 8000,
            },
        ];
        let increments = model.decode_increments(&obs);
        assert!(!increments.is_empty());
        for (name, _) in &increments {
            assert!(known.contains(name), "unexpected counter name {name}");
        }
    }

    #[test]
    fn empty_observations_yield_no_increments() {
        let model = TrafficModel {
            states: vec!["A".into()],
            transitions: vec![vec![1.0]],
            emissions: vec![(0.0, 1.0)],
            delays: vec![(0.0, 1.0)],
            start_log_probs: vec![0.0],
        };
        assert!(model.decode_increments(&[]).is_empty());
    }

    #[test]
    fn expand_counters_covers_transitions_and_emissions() {
        let model = TrafficModel {
            states: vec!["A".into(), "B".into()],
            transitions: vec![vec![0.5, 0.5], vec![0.5, 0.5]],
            emissions: vec![(0.0, 1.0), (0.0, 1.0)],
            delays: vec![(0.0, 1.0), (0.0, 1.0)],
            start_log_probs: vec![0.0, 0.0],
        };
        let defs = model.expand_counters();
        assert!(defs.iter().any(|d| d.name == "Transition_A_B"));
        assert!(defs.iter().any(|d| d.name == "Emission_A_In"));
        assert!(defs.iter().any(|d| d.name == "SquaredLogDelayTime_B_Out"));
    }
}
