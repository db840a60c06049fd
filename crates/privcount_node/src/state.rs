//! Persisted node state (§6 "Persisted state"), load-on-construct /
//! save-on-mutate JSON files under the per-role data directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// TS persists: last round outcome, per-node last-seen timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TsState {
    pub last_round_id: Option<String>,
    pub last_round_outcome_path: Option<String>,
    pub last_seen: BTreeMap<String, u64>,
    #[serde(skip)]
    path: PathBuf,
}

/// SK/DC both persist: last round's noise allocation hash, last round end
/// time (for delay enforcement), and the pinned sigma anchor per counter.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DelayState {
    pub last_noise_allocation_hash: Option<String>,
    pub last_round_end_time: Option<u64>,
    pub pinned_sigma: BTreeMap<String, f64>,
    #[serde(skip)]
    path: PathBuf,
}

macro_rules! persisted_json {
    ($ty:ty) => {
        impl $ty {
            pub fn load_or_default(path: PathBuf) -> Self {
                if let Ok(content) = fs::read_to_string(&path) {
                    if let Ok(mut loaded) = serde_json::from_str::<Self>(&content) {
                        loaded.path = path;
                        return loaded;
                    }
                }
                let mut s = Self::default();
                s.path = path;
                s
            }

            pub fn persist(&self) -> std::io::Result<()> {
                let json = serde_json::to_string_pretty(self)?;
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&self.path, json)
            }
        }
    };
}

persisted_json!(TsState);
persisted_json!(DelayState);

/// SHA-256 hex digest of a counter-name+sigma allocation, used to detect
/// whether the noise allocation changed between rounds without re-parsing
/// the full config.
pub fn hash_noise_allocation(sigmas: &BTreeMap<String, f64>) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    for (name, sigma) in sigmas {
        hasher.update(name.as_bytes());
        hasher.update(sigma.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_state_roundtrips_through_disk() {
        let dir = std::env::temp_dir().join(format!("privcount_test_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("delay_state.json");
        let _ = fs::remove_file(&path);

        let mut state = DelayState::load_or_default(path.clone());
        state.last_round_end_time = Some(1234);
        state.pinned_sigma.insert("C".into(), 10.0);
        state.persist().unwrap();

        let reloaded = DelayState::load_or_default(path.clone());
        assert_eq!(reloaded.last_round_end_time, Some(1234));
        assert_eq!(reloaded.pinned_sigma.get("C"), Some(&10.0));

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn hash_is_stable_for_same_allocation() {
        let mut a = BTreeMap::new();
        a.insert("C1".to_string(), 5.0);
        let mut b = BTreeMap::new();
        b.insert("C1".to_string(), 5.0);
        assert_eq!(hash_noise_allocation(&a), hash_noise_allocation(&b));
    }

    #[test]
    fn load_or_default_handles_missing_file() {
        let path = Path::new("/tmp/nonexistent_privcount_state_file.json").to_path_buf();
        let state = TsState::load_or_default(path);
        assert!(state.last_round_id.is_none());
    }
}
