//! Engine connection settings

use ax_protocol::DEFAULT_FRAME_LENGTH;
use serde::{Deserialize, Serialize};

/// Settings for connecting to an AGWPE-compatible packet engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgwConfig {
    /// Host the engine's TCP service listens on
    pub host: String,
    /// TCP port of the engine's service
    pub port: u16,
    /// Maximum payload bytes per outbound data frame
    pub frame_length: usize,
    /// Call signs to register when `listen` is called without an
    /// explicit list
    pub my_calls: Vec<String>,
}

impl Default for AgwConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            frame_length: DEFAULT_FRAME_LENGTH,
            my_calls: Vec::new(),
        }
    }
}

/// Settings for connecting to a VARA modem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaraConfig {
    /// Host the modem's sockets listen on
    pub host: String,
    /// TCP port of the control socket
    pub control_port: u16,
    /// TCP port of the data socket
    pub data_port: u16,
    /// Call signs sent in the `MYCALL` handshake command
    pub my_calls: Vec<String>,
}

impl Default for VaraConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            control_port: 8300,
            data_port: 8301,
            my_calls: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agw_config_defaults() {
        let config: AgwConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8000);
        assert_eq!(config.frame_length, DEFAULT_FRAME_LENGTH);
    }

    #[test]
    fn test_vara_config_partial_override() {
        let config: VaraConfig =
            serde_json::from_str(r#"{"my_calls": ["N0CALL"], "control_port": 8400}"#).unwrap();
        assert_eq!(config.control_port, 8400);
        assert_eq!(config.data_port, 8301);
        assert_eq!(config.my_calls, vec!["N0CALL".to_string()]);
    }
}
