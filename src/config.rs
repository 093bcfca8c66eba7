use std::num::ParseIntError;
use std::time::Duration;

use crate::cli::Args;
use crate::service::orchestrator::{DEFAULT_RESTART_SLACK, RestartTimings};

pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 6968;
pub const DEFAULT_HEALTH_CONTAINER: &str = "gluetun";
pub const DEFAULT_PROBE_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound for every `*_SECS` setting (7 days).
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var} ({value:?}): {source}")]
    InvalidNumber {
        var: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
    #[error("{var} must be at most {max} seconds")]
    TooLarge { var: &'static str, max: u64 },
}

/// Settings resolved once at startup and handed to every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_host: String,
    pub port: u16,
    /// Host the gluetun control servers are reachable on. Restart requests
    /// only carry the port.
    pub probe_host: Option<String>,
    pub health_container: String,
    pub probe_request_timeout: Duration,
    pub timings: RestartTimings,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from a variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let server_ip = get("SERVER_IP");
        let port = match get("SERVER_PORT") {
            Some(value) => parse_number("SERVER_PORT", value)?,
            None => DEFAULT_PORT,
        };

        let secs = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match get(var) {
                Some(value) => {
                    let secs: u64 = parse_number(var, value)?;
                    if secs == 0 {
                        return Err(ConfigError::Zero { var });
                    }
                    if secs > MAX_DURATION_SECS {
                        return Err(ConfigError::TooLarge {
                            var,
                            max: MAX_DURATION_SECS,
                        });
                    }
                    Ok(Duration::from_secs(secs))
                }
                None => Ok(default),
            }
        };

        let defaults = RestartTimings::default();
        let stop_timeout = secs("RESTART_STOP_TIMEOUT_SECS", defaults.stop_timeout)?;
        let timings = RestartTimings {
            stop_timeout,
            restart_ceiling: stop_timeout.saturating_add(DEFAULT_RESTART_SLACK),
            settle: secs("RESTART_SETTLE_SECS", defaults.settle)?,
            poll_interval: secs("PROBE_INTERVAL_SECS", defaults.poll_interval)?,
            max_wait: secs("PROBE_MAX_WAIT_SECS", defaults.max_wait)?,
        };

        Ok(Self {
            bind_host: server_ip
                .clone()
                .unwrap_or_else(|| DEFAULT_BIND_HOST.to_string()),
            port,
            probe_host: get("PROBE_HOST").or(server_ip),
            health_container: get("HEALTH_CONTAINER")
                .unwrap_or_else(|| DEFAULT_HEALTH_CONTAINER.to_string()),
            probe_request_timeout: secs(
                "PROBE_REQUEST_TIMEOUT_SECS",
                DEFAULT_PROBE_REQUEST_TIMEOUT,
            )?,
            timings,
        })
    }

    /// Command line flags take precedence over the environment.
    pub fn with_args(mut self, args: &Args) -> Self {
        if let Some(host) = &args.host {
            self.bind_host = host.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        self
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

fn parse_number<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = ParseIntError>,
{
    value
        .trim()
        .parse()
        .map_err(|source| ConfigError::InvalidNumber { var, value, source })
}
