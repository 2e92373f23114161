//! Configuration types for the call engine

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration for a call session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Grace period after an ICE disconnect before a restart is attempted,
    /// in milliseconds (default: 5000)
    pub disconnect_grace_ms: u64,

    /// Maximum ICE restart attempts per peer link before the link is
    /// declared failed (default: 3)
    pub max_ice_restarts: u32,

    /// Consecutive offer/answer failures on one link before it is treated
    /// as an ICE failure (default: 3)
    pub negotiation_failure_limit: u32,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            disconnect_grace_ms: 5000,
            max_ice_restarts: 3,
            negotiation_failure_limit: 3,
        }
    }
}

impl CallConfig {
    /// Grace period after an ICE disconnect as a [`Duration`]
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - `disconnect_grace_ms` is not in range 500-60000
    /// - `max_ice_restarts` is not in range 1-10
    /// - `negotiation_failure_limit` is not in range 1-10
    /// - a TURN server URL does not start with `turn:` or `turns:`
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.disconnect_grace_ms < 500 || self.disconnect_grace_ms > 60_000 {
            return Err(Error::InvalidConfig(format!(
                "disconnect_grace_ms must be in range 500-60000, got {}",
                self.disconnect_grace_ms
            )));
        }

        if self.max_ice_restarts == 0 || self.max_ice_restarts > 10 {
            return Err(Error::InvalidConfig(format!(
                "max_ice_restarts must be in range 1-10, got {}",
                self.max_ice_restarts
            )));
        }

        if self.negotiation_failure_limit == 0 || self.negotiation_failure_limit > 10 {
            return Err(Error::InvalidConfig(format!(
                "negotiation_failure_limit must be in range 1-10, got {}",
                self.negotiation_failure_limit
            )));
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server URL must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
        }

        Ok(())
    }
}
