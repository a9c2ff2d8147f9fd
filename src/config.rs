//! Environment-driven settings.
//!
//! Everything the server binary reads from the environment lives here, with
//! one parse step at startup. A bad value is a startup error (process exit
//! code 2), never a silently-applied default.

use crate::error::{Error, Result};
use std::time::Duration;

/// Default number of bots a campaign runs unless it specifies `max_bots`.
pub const DEFAULT_MAX_BOTS: i32 = 3;
/// Default cadence for `BotSnapshotCaptured` events during extraction.
pub const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_host: String,
    pub server_port: u16,
    pub geonames_base_url: String,
    pub max_bots_default: i32,
    pub snapshot_interval: Duration,
    pub driver_headless: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server_host: "0.0.0.0".into(),
            server_port: 8000,
            geonames_base_url: "http://localhost:9400".into(),
            max_bots_default: DEFAULT_MAX_BOTS,
            snapshot_interval: Duration::from_millis(DEFAULT_SNAPSHOT_INTERVAL_MS),
            driver_headless: true,
        }
    }
}

impl Settings {
    /// Read settings from the process environment, falling back to defaults
    /// for unset variables and rejecting unparseable ones.
    pub fn from_env() -> Result<Self> {
        let mut settings = Settings::default();
        if let Some(host) = non_empty("SERVER_HOST") {
            settings.server_host = host;
        }
        if let Some(port) = non_empty("SERVER_PORT") {
            settings.server_port = port
                .parse()
                .map_err(|_| Error::Validation(format!("SERVER_PORT is not a port: {port:?}")))?;
        }
        if let Some(base) = non_empty("GEONAMES_BASE_URL") {
            url::Url::parse(&base)
                .map_err(|_| Error::Validation(format!("GEONAMES_BASE_URL is not a URL: {base:?}")))?;
            settings.geonames_base_url = base;
        }
        if let Some(bots) = non_empty("MAX_BOTS_DEFAULT") {
            let parsed: i32 = bots.parse().map_err(|_| {
                Error::Validation(format!("MAX_BOTS_DEFAULT is not an integer: {bots:?}"))
            })?;
            if parsed < 1 {
                return Err(Error::Validation(
                    "MAX_BOTS_DEFAULT must be at least 1".into(),
                ));
            }
            settings.max_bots_default = parsed;
        }
        if let Some(interval) = non_empty("SNAPSHOT_INTERVAL_MS") {
            let millis: u64 = interval.parse().map_err(|_| {
                Error::Validation(format!(
                    "SNAPSHOT_INTERVAL_MS is not an integer: {interval:?}"
                ))
            })?;
            if millis == 0 {
                return Err(Error::Validation("SNAPSHOT_INTERVAL_MS must be positive".into()));
            }
            settings.snapshot_interval = Duration::from_millis(millis);
        }
        if let Some(headless) = non_empty("DRIVER_HEADLESS") {
            settings.driver_headless = match headless.as_str() {
                "true" => true,
                "false" => false,
                other => {
                    return Err(Error::Validation(format!(
                        "DRIVER_HEADLESS must be true or false, got {other:?}"
                    )))
                }
            };
        }
        Ok(settings)
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env mutation is process-global; every test that touches it holds this
    // lock so the parallel runner cannot interleave reads and writes.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.server_port, 8000);
        assert_eq!(s.max_bots_default, 3);
        assert_eq!(s.snapshot_interval, Duration::from_millis(1_000));
        assert!(s.driver_headless);
    }

    #[test]
    fn rejects_zero_bots() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        std::env::set_var("MAX_BOTS_DEFAULT", "0");
        let err = Settings::from_env().unwrap_err();
        std::env::remove_var("MAX_BOTS_DEFAULT");
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn rejects_bad_headless_flag() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        std::env::set_var("DRIVER_HEADLESS", "maybe");
        let err = Settings::from_env().unwrap_err();
        std::env::remove_var("DRIVER_HEADLESS");
        assert!(err.to_string().contains("DRIVER_HEADLESS"));
    }

    #[test]
    fn parses_snapshot_interval() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        std::env::set_var("SNAPSHOT_INTERVAL_MS", "250");
        let s = Settings::from_env().unwrap();
        std::env::remove_var("SNAPSHOT_INTERVAL_MS");
        assert_eq!(s.snapshot_interval, Duration::from_millis(250));
    }
}
