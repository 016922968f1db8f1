//! Application-level configuration loading, including round pacing and guard limits.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "BINGO_BACK_CONFIG_PATH";

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
///
/// Read once at startup; no field is re-validated per call.
pub struct AppConfig {
    /// Seconds the countdown phase lasts before a round goes active.
    pub countdown_secs: u32,
    /// Milliseconds between two number calls during the active phase.
    pub call_interval_ms: u64,
    /// Number of calls after which a round ends without a winner.
    ///
    /// The reference pacing is deliberately short; rounds must never be able
    /// to stall past this budget.
    pub call_budget: usize,
    /// Seconds between a round ending and the next countdown starting.
    pub grace_secs: u32,
    /// Maximum number of simultaneously joined players.
    pub max_players: usize,
    /// Number of cards generated into the pool each round.
    pub pool_size: usize,
    /// Maximum pool slots a single identity may reserve.
    pub max_slots_per_player: usize,
    /// Seconds a recorded command response is replayable for.
    pub guard_ttl_secs: u32,
    /// Width of the command rate-limit window.
    pub rate_window_ms: u64,
    /// Commands allowed per action inside one rate window.
    pub rate_max: u32,
    /// Seconds a presence lease stays valid without a refresh.
    pub lease_ttl_secs: u32,
    /// How many past round winners are retained.
    pub recent_winners_cap: usize,
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(path = %path.display(), "loaded round configuration from config file");
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Interval between two number calls.
    pub fn call_interval(&self) -> Duration {
        Duration::from_millis(self.call_interval_ms)
    }

    /// Delay between the end of a round and the next countdown.
    pub fn grace_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.grace_secs))
    }

    /// Time-to-live applied to recorded command responses.
    pub fn guard_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.guard_ttl_secs))
    }

    /// Width of the rate-limit window.
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    /// Time-to-live applied to presence leases.
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_ttl_secs))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            countdown_secs: 10,
            call_interval_ms: 2_000,
            call_budget: 5,
            grace_secs: 5,
            max_players: 12,
            pool_size: 30,
            max_slots_per_player: 2,
            guard_ttl_secs: 30,
            rate_window_ms: 1_000,
            rate_max: 10,
            lease_ttl_secs: 30,
            recent_winners_cap: 10,
        }
    }
}

#[derive(Debug, Deserialize)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
///
/// Every field is optional so partial files only override what they name.
struct RawConfig {
    countdown_secs: Option<u32>,
    call_interval_ms: Option<u64>,
    call_budget: Option<usize>,
    grace_secs: Option<u32>,
    max_players: Option<usize>,
    pool_size: Option<usize>,
    max_slots_per_player: Option<usize>,
    guard_ttl_secs: Option<u32>,
    rate_window_ms: Option<u64>,
    rate_max: Option<u32>,
    lease_ttl_secs: Option<u32>,
    recent_winners_cap: Option<usize>,
}

impl From<RawConfig> for AppConfig {
    fn from(raw: RawConfig) -> Self {
        let defaults = AppConfig::default();
        Self {
            countdown_secs: raw.countdown_secs.unwrap_or(defaults.countdown_secs),
            call_interval_ms: raw.call_interval_ms.unwrap_or(defaults.call_interval_ms),
            call_budget: raw.call_budget.unwrap_or(defaults.call_budget),
            grace_secs: raw.grace_secs.unwrap_or(defaults.grace_secs),
            max_players: raw.max_players.unwrap_or(defaults.max_players),
            pool_size: raw.pool_size.unwrap_or(defaults.pool_size),
            max_slots_per_player: raw
                .max_slots_per_player
                .unwrap_or(defaults.max_slots_per_player),
            guard_ttl_secs: raw.guard_ttl_secs.unwrap_or(defaults.guard_ttl_secs),
            rate_window_ms: raw.rate_window_ms.unwrap_or(defaults.rate_window_ms),
            rate_max: raw.rate_max.unwrap_or(defaults.rate_max),
            lease_ttl_secs: raw.lease_ttl_secs.unwrap_or(defaults.lease_ttl_secs),
            recent_winners_cap: raw
                .recent_winners_cap
                .unwrap_or(defaults.recent_winners_cap),
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_raw_config_keeps_defaults_elsewhere() {
        let raw: RawConfig = serde_json::from_str(r#"{ "call_budget": 75, "pool_size": 12 }"#)
            .expect("raw config parses");
        let config: AppConfig = raw.into();

        assert_eq!(config.call_budget, 75);
        assert_eq!(config.pool_size, 12);
        assert_eq!(config.countdown_secs, AppConfig::default().countdown_secs);
        assert_eq!(config.max_players, AppConfig::default().max_players);
    }

    #[test]
    fn durations_derive_from_millis_and_secs() {
        let config = AppConfig::default();
        assert_eq!(config.call_interval(), Duration::from_millis(2_000));
        assert_eq!(config.grace_delay(), Duration::from_secs(5));
        assert_eq!(config.rate_window(), Duration::from_millis(1_000));
    }
}
