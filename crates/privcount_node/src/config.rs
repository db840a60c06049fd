//! Per-role YAML configuration (§6, §9.3): parsing and validation are one
//! step, so a structurally valid but semantically bad config never reaches
//! COLLECTING.

use std::fs;
use std::path::{Path, PathBuf};

use num_bigint::BigUint;
use privcount_core::config::AuthMode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Returns `~/.privcount`, creating it if needed. Falls back to a local
/// `.privcount` directory if the home directory cannot be determined.
pub fn privcount_data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(mut path) => {
            path.push(".privcount");
            if let Err(e) = fs::create_dir_all(&path) {
                warn!(error = %e, "could not create ~/.privcount, falling back to local .privcount");
                let fallback = PathBuf::from(".privcount");
                let _ = fs::create_dir_all(&fallback);
                return fallback;
            }
            path
        }
        None => {
            warn!("could not determine home directory, falling back to local .privcount");
            let fallback = PathBuf::from(".privcount");
            let _ = fs::create_dir_all(&fallback);
            fallback
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("field modulus q is not a valid hex integer: {0}")]
    BadModulus(String),
}

/// Fields shared by all three node roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Long-term identity fingerprint of this node (hex-encoded digest).
    pub fingerprint: String,
    /// Hex-encoded prime modulus q for this deployment (Design Notes §9:
    /// "treat as per-deployment constant").
    pub field_modulus_hex: String,
    /// TS address to connect to (`host:port`).
    pub tally_server_addr: String,
    /// PEM-encoded TS certificate this node pins for TLS; authentication
    /// proper is the HMAC handshake (§4.5), TLS only provides
    /// confidentiality and integrity of the channel.
    pub tally_server_cert_path: String,
    /// Hex-encoded handshake secret K, shared out of band (§4.5).
    pub handshake_key_hex: String,
    #[serde(default = "default_delay_period_secs")]
    pub delay_period_secs: u64,
    #[serde(default = "default_epsilon")]
    pub sigma_decrease_epsilon: f64,
    /// Address for the local read-only status API (§9.3). Unset disables it.
    #[serde(default)]
    pub status_api_addr: Option<String>,
}

fn default_delay_period_secs() -> u64 {
    24 * 3600
}

fn default_epsilon() -> f64 {
    1e-6
}

impl CommonConfig {
    pub fn parsed_modulus(&self) -> Result<BigUint, ConfigLoadError> {
        num_bigint::BigUint::parse_bytes(self.field_modulus_hex.as_bytes(), 16)
            .ok_or_else(|| ConfigLoadError::BadModulus(self.field_modulus_hex.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub listen_addr: String,
    pub dc_threshold: usize,
    pub sk_threshold: usize,
    pub outcomes_dir: String,
    pub tls_cert_path: String,
    pub tls_key_path: String,
    /// Path to the static round template (counters, noise weights, periods)
    /// this TS republishes each cycle under a freshly minted round id.
    pub round_template_path: String,
}

/// Everything a [`privcount_core::config::RoundConfig`] needs except the
/// round id, which the TS mints fresh each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTemplate {
    pub counters: Vec<privcount_core::counter::CounterDef>,
    pub noise_weights: std::collections::BTreeMap<String, f64>,
    pub sk_fingerprints: std::collections::BTreeMap<String, String>,
    pub periods: privcount_core::config::Periods,
    pub always_delay: bool,
    /// Optional traffic model (§4.4); its template counters are appended to
    /// `counters` by [`into_round`](Self::into_round), and the model itself
    /// rides along in `RoundConfig` so DCs can decode against it.
    #[serde(default)]
    pub traffic_model: Option<privcount_core::traffic_model::TrafficModel>,
}

impl RoundTemplate {
    pub fn into_round(self, round_id: String, dc_threshold: usize, sk_threshold: usize) -> privcount_core::config::RoundConfig {
        let mut counters = self.counters;
        if let Some(model) = &self.traffic_model {
            counters.extend(model.expand_counters());
        }
        privcount_core::config::RoundConfig {
            round_id,
            counters,
            noise_weights: self.noise_weights,
            sk_fingerprints: self.sk_fingerprints,
            periods: self.periods,
            thresholds: privcount_core::config::Thresholds {
                dc_threshold,
                sk_threshold,
            },
            always_delay: self.always_delay,
            traffic_model: self.traffic_model,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    /// Path to this SK's RSA private key (PEM).
    pub rsa_private_key_path: String,
    /// fingerprint -> expected SHA-256 of that DC's claimed SK public key,
    /// the out-of-band trust anchor of §4.2.
    #[serde(default)]
    pub dc_fingerprints: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub event_source_addr: String,
    #[serde(default = "default_auth_mode")]
    pub auth_mode: AuthMode,
    pub auth_cookie_path: Option<String>,
    pub auth_password: Option<String>,
    /// SK fingerprint -> path to that SK's RSA public key (PEM), the
    /// out-of-band trust anchor checked against the TS-provided fingerprint
    /// (§4.2).
    #[serde(default)]
    pub sk_public_key_paths: std::collections::BTreeMap<String, String>,
}

fn default_auth_mode() -> AuthMode {
    AuthMode::SafeCookie
}

pub fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigLoadError> {
    let text = fs::read_to_string(path).map_err(|e| ConfigLoadError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    serde_yaml::from_str(&text).map_err(|e| ConfigLoadError::Parse {
        path: path.display().to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_config_parses_from_yaml() {
        let yaml = r#"
fingerprint: "abc123"
field_modulus_hex: "FFFFFFFFFFFFFFFFC90FDAA2"
tally_server_addr: "127.0.0.1:9001"
tally_server_cert_path: "/tmp/ts_cert.pem"
handshake_key_hex: "00112233"
listen_addr: "0.0.0.0:9001"
dc_threshold: 2
sk_threshold: 2
outcomes_dir: "/tmp/outcomes"
tls_cert_path: "/tmp/ts_cert.pem"
tls_key_path: "/tmp/ts_key.pem"
round_template_path: "/tmp/round_template.yaml"
"#;
        let cfg: TsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.dc_threshold, 2);
        assert!(cfg.common.parsed_modulus().is_ok());
    }
}
