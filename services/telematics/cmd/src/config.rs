//! Configuration handling for the telematics service.
//!
//! Values come from the `services.telematics` section of the shared YAML
//! config file, then from `TELEMATICS_*` environment variables, then from the
//! command line.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use telematics_protocol::Transport;
use telematics_session::SessionConfig;
use tracing::{info, warn};

/// Telematics service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Realm for devices that do not announce one
    pub default_realm: String,
    /// Silence before a session is removed (seconds)
    pub session_timeout_secs: u64,
    /// Silence before a connected session turns idle (seconds)
    pub idle_after_secs: u64,
    /// Sweeper period (seconds)
    pub sweep_interval_secs: u64,
    /// Consecutive decode errors that close a connection
    pub max_consecutive_decode_errors: u32,
    /// How long records of devices without a session are kept (seconds)
    pub connection_retention_secs: u64,
    /// Protocol ids probed first, in order
    pub protocol_priority: Vec<String>,
    /// Transports the JSON report codec accepts
    pub json_transports: Vec<Transport>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_realm: "master".to_string(),
            session_timeout_secs: 300,
            idle_after_secs: 60,
            sweep_interval_secs: 30,
            max_consecutive_decode_errors: 5,
            connection_retention_secs: 86_400,
            protocol_priority: Vec::new(),
            json_transports: vec![Transport::Stream, Transport::Datagram, Transport::PubSub],
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    telematics: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    config: Option<HashMap<String, String>>,
}

impl GatewayConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root) => {
                    config.apply_root_config(root);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?} ({}), using defaults",
                    config_path.as_ref(),
                    e
                ),
            },
            Err(_) => warn!(
                "Config file {:?} not found, using defaults",
                config_path.as_ref()
            ),
        }

        config.apply_environment_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            bail!("sweep interval must be positive");
        }
        if self.idle_after_secs >= self.session_timeout_secs {
            bail!(
                "idle window ({}s) must be shorter than the session timeout ({}s)",
                self.idle_after_secs,
                self.session_timeout_secs
            );
        }
        if self.connection_retention_secs < self.session_timeout_secs {
            bail!(
                "connection retention ({}s) must not be shorter than the session timeout ({}s)",
                self.connection_retention_secs,
                self.session_timeout_secs
            );
        }
        if self.json_transports.is_empty() {
            bail!("json codec needs at least one transport");
        }
        Ok(())
    }

    /// Settings for the session layer
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            default_realm: self.default_realm.clone(),
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            idle_after: Duration::from_secs(self.idle_after_secs),
            max_consecutive_decode_errors: self.max_consecutive_decode_errors,
            connection_retention: Duration::from_secs(self.connection_retention_secs),
        }
    }

    /// Sweeper period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    fn apply_root_config(&mut self, root: RootConfig) {
        let values = root
            .services
            .and_then(|services| services.telematics)
            .and_then(|service| service.config);
        if let Some(values) = values {
            for (key, value) in values {
                self.apply_value(&key, &value);
            }
        }
    }

    fn apply_value(&mut self, key: &str, value: &str) {
        let field = key.strip_prefix("services.telematics.").unwrap_or(key);
        let applied = match field {
            "default_realm" => {
                self.default_realm = value.to_string();
                true
            }
            "session_timeout_secs" => parse_into(value, &mut self.session_timeout_secs),
            "idle_after_secs" => parse_into(value, &mut self.idle_after_secs),
            "sweep_interval_secs" => parse_into(value, &mut self.sweep_interval_secs),
            "max_consecutive_decode_errors" => {
                parse_into(value, &mut self.max_consecutive_decode_errors)
            }
            "connection_retention_secs" => {
                parse_into(value, &mut self.connection_retention_secs)
            }
            "protocol_priority" => {
                self.protocol_priority = split_list(value);
                true
            }
            "json_transports" => {
                match split_list(value)
                    .iter()
                    .map(|t| t.parse::<Transport>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                {
                    Ok(transports) => {
                        self.json_transports = transports;
                        true
                    }
                    Err(_) => false,
                }
            }
            // Unknown keys belong to other consumers of the shared file
            _ => true,
        };

        if !applied {
            warn!("Ignoring invalid value {:?} for {}", value, key);
        }
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        const OVERRIDES: [(&str, &str); 6] = [
            ("TELEMATICS_DEFAULT_REALM", "default_realm"),
            ("TELEMATICS_SESSION_TIMEOUT", "session_timeout_secs"),
            ("TELEMATICS_IDLE_AFTER", "idle_after_secs"),
            ("TELEMATICS_SWEEP_INTERVAL", "sweep_interval_secs"),
            ("TELEMATICS_MAX_DECODE_ERRORS", "max_consecutive_decode_errors"),
            ("TELEMATICS_CONNECTION_RETENTION", "connection_retention_secs"),
        ];

        for (variable, field) in OVERRIDES {
            if let Some(value) = lookup(variable) {
                self.apply_value(field, &value);
                info!("{} overridden by environment: {}", field, value);
            }
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) -> bool {
    match value.trim().parse() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
