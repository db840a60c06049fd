//! Round state machines (§4.5). DC and SK share one state machine; TS runs a
//! parallel outer machine. Transitions are modeled as plain methods rather
//! than an inheritance tree (Design Notes §9: "model as a capability set").

use serde::{Deserialize, Serialize};

/// DC/SK round state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientState {
    Idle,
    Registered,
    Prepared,
    Collecting,
    Tallying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ClientState,
    pub event: &'static str,
}

impl ClientState {
    pub fn on_register(self) -> Result<ClientState, InvalidTransition> {
        match self {
            ClientState::Idle => Ok(ClientState::Registered),
            _ => Err(InvalidTransition {
                from: self,
                event: "register",
            }),
        }
    }

    pub fn on_config_accept(self) -> Result<ClientState, InvalidTransition> {
        match self {
            ClientState::Registered => Ok(ClientState::Prepared),
            _ => Err(InvalidTransition {
                from: self,
                event: "config_accept",
            }),
        }
    }

    pub fn on_start_round(self) -> Result<ClientState, InvalidTransition> {
        match self {
            ClientState::Prepared => Ok(ClientState::Collecting),
            _ => Err(InvalidTransition {
                from: self,
                event: "start_round",
            }),
        }
    }

    pub fn on_tally(self) -> Result<ClientState, InvalidTransition> {
        match self {
            ClientState::Collecting => Ok(ClientState::Tallying),
            _ => Err(InvalidTransition {
                from: self,
                event: "tally",
            }),
        }
    }

    /// Terminal on success, or on an abort from COLLECTING (§4.5 diagram:
    /// `round_end/aborted` returns to IDLE from either state).
    pub fn on_round_end(self) -> Result<ClientState, InvalidTransition> {
        match self {
            ClientState::Tallying | ClientState::Collecting => Ok(ClientState::Idle),
            _ => Err(InvalidTransition {
                from: self,
                event: "round_end",
            }),
        }
    }
}

/// TS outer round state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TsState {
    Configuring,
    WaitingForThresholds,
    Started,
    Summing,
    Publishing,
    #[default]
    Idle,
}

impl TsState {
    pub fn on_config_published(self) -> Result<TsState, InvalidTransition> {
        match self {
            TsState::Idle | TsState::Configuring => Ok(TsState::WaitingForThresholds),
            _ => Err(InvalidTransition {
                from: self,
                event: "config_published",
            }),
        }
    }

    /// Refuses to leave WAITING_FOR_THRESHOLDS unless both thresholds hold
    /// (§4.5).
    pub fn try_start(
        self,
        prepared_dcs: usize,
        prepared_sks: usize,
        dc_threshold: usize,
        sk_threshold: usize,
    ) -> Result<TsState, InvalidTransition> {
        match self {
            TsState::WaitingForThresholds
                if prepared_dcs >= dc_threshold && prepared_sks >= sk_threshold =>
            {
                Ok(TsState::Started)
            }
            TsState::WaitingForThresholds => Err(InvalidTransition {
                from: self,
                event: "try_start:thresholds_unmet",
            }),
            _ => Err(InvalidTransition {
                from: self,
                event: "try_start",
            }),
        }
    }

    pub fn on_collect_deadline(self) -> Result<TsState, InvalidTransition> {
        match self {
            TsState::Started => Ok(TsState::Summing),
            _ => Err(InvalidTransition {
                from: self,
                event: "collect_deadline",
            }),
        }
    }

    pub fn on_sums_complete(self) -> Result<TsState, InvalidTransition> {
        match self {
            TsState::Summing => Ok(TsState::Publishing),
            _ => Err(InvalidTransition {
                from: self,
                event: "sums_complete",
            }),
        }
    }

    pub fn on_published(self) -> Result<TsState, InvalidTransition> {
        match self {
            TsState::Publishing => Ok(TsState::Idle),
            _ => Err(InvalidTransition {
                from: self,
                event: "published",
            }),
        }
    }

    /// A TS may broadcast `STOP_ROUND` from any non-idle state (§4.5
    /// "Cancellation"); this always succeeds since it is unconditional.
    pub fn on_stop_round(self) -> TsState {
        TsState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_happy_path() {
        let s = ClientState::Idle;
        let s = s.on_register().unwrap();
        assert_eq!(s, ClientState::Registered);
        let s = s.on_config_accept().unwrap();
        assert_eq!(s, ClientState::Prepared);
        let s = s.on_start_round().unwrap();
        assert_eq!(s, ClientState::Collecting);
        let s = s.on_tally().unwrap();
        assert_eq!(s, ClientState::Tallying);
        let s = s.on_round_end().unwrap();
        assert_eq!(s, ClientState::Idle);
    }

    #[test]
    fn abort_from_collecting_returns_to_idle() {
        assert_eq!(
            ClientState::Collecting.on_round_end().unwrap(),
            ClientState::Idle
        );
    }

    #[test]
    fn ts_refuses_start_below_threshold() {
        let s = TsState::WaitingForThresholds;
        assert!(s.try_start(1, 2, 2, 2).is_err());
        assert!(s.try_start(2, 2, 2, 2).is_ok());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        assert!(ClientState::Idle.on_start_round().is_err());
    }

    #[test]
    fn stop_round_always_returns_to_idle() {
        assert_eq!(TsState::Summing.on_stop_round(), TsState::Idle);
        assert_eq!(TsState::Started.on_stop_round(), TsState::Idle);
    }
}
