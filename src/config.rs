//! Daemon configuration.

use std::collections::HashSet;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use pushd_core::App;
use pushd_delivery::{ApnsConfig, ClientConfig, FeederConfig, RetryPolicy, RunnerConfig};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "pushd.toml";
const ENV_PREFIX: &str = "PUSHD_";

/// Complete daemon configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed with `PUSHD_` (highest priority), using
///    `__` between nested keys, e.g. `PUSHD_FEEDER__BATCH_SIZE=500`
/// 2. Configuration file (`pushd.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Durations are written as seconds and may be fractional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Storage polling.
    pub feeder: FeederConfig,

    /// Per-app runner behaviour.
    pub runner: RunnerConfig,

    /// Retry scheduling.
    pub retry: RetryPolicy,

    /// Binary gateway settings.
    pub apns: ApnsConfig,

    /// HTTP gateway client settings.
    pub http: ClientConfig,

    /// Run a single feeder pass, drain, and exit.
    pub once: bool,

    /// Apps loaded into the in-memory store at startup.
    pub apps: Vec<App>,
}

impl DaemonConfig {
    /// Loads configuration from defaults, `pushd.toml`, and `PUSHD_`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Fails when a source cannot be parsed or the result is invalid.
    pub fn load() -> Result<Self> {
        let config: Self = Self::figment().extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// The layered configuration sources.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.feeder.batch_size == 0 {
            anyhow::bail!("feeder.batch_size must be greater than 0");
        }

        if self.retry.base == 0 {
            anyhow::bail!("retry.base must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            anyhow::bail!("retry.jitter_factor must be between 0.0 and 1.0");
        }

        let mut ids = HashSet::new();
        for app in &self.apps {
            if app.connections == 0 {
                anyhow::bail!("app {} must have at least one connection", app.name);
            }
            if !ids.insert(app.id) {
                anyhow::bail!("app id {} is configured more than once", app.id);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use figment::Jail;
    use pushd_core::{AppId, Protocol};

    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DaemonConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.feeder.poll_interval, Duration::from_secs(2));
        assert_eq!(config.feeder.batch_size, 5000);
        assert_eq!(config.runner.drain_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.retry.max_retries, None);
        assert!(!config.once);
        assert!(config.apps.is_empty());
    }

    #[test]
    fn file_and_environment_are_layered() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                [feeder]
                poll_interval = 0.5
                batch_size = 100

                [retry]
                max_retries = 5

                [[apps]]
                id = 1
                name = "ios"
                protocol = "apns"
                connections = 3

                [[apps]]
                id = 2
                name = "android"
                protocol = "gcm"
                auth_key = "server-key"
                "#,
            )?;
            jail.set_env("PUSHD_FEEDER__BATCH_SIZE", "250");
            jail.set_env("PUSHD_APNS__SELECT_WINDOW", "1.5");

            let config: DaemonConfig = DaemonConfig::figment().extract()?;

            assert_eq!(config.feeder.poll_interval, Duration::from_millis(500));
            assert_eq!(config.feeder.batch_size, 250);
            assert_eq!(config.apns.select_window, Duration::from_millis(1500));
            assert_eq!(config.retry.max_retries, Some(5));
            assert_eq!(config.retry.base, 2);

            assert_eq!(config.apps.len(), 2);
            assert_eq!(config.apps[0].id, AppId(1));
            assert_eq!(config.apps[0].protocol, Protocol::Apns);
            assert_eq!(config.apps[0].connections, 3);
            assert_eq!(config.apps[1].protocol, Protocol::Gcm);
            assert_eq!(config.apps[1].connections, 1);
            assert_eq!(config.apps[1].auth_key.as_deref(), Some("server-key"));

            assert!(config.validate().is_ok());
            Ok(())
        });
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        Jail::expect_with(|_jail| {
            let config: DaemonConfig = DaemonConfig::figment().extract()?;
            assert_eq!(config, DaemonConfig::default());
            Ok(())
        });
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = DaemonConfig::default();
        config.feeder.batch_size = 0;
        assert!(config.validate().is_err());

        config = DaemonConfig::default();
        config.retry.jitter_factor = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_or_idle_apps_are_rejected() {
        let app = App::new(AppId(1), "ios", Protocol::Apns);

        let mut config = DaemonConfig { apps: vec![app.clone(), app.clone()], ..Default::default() };
        assert!(config.validate().is_err());

        let mut idle = app;
        idle.connections = 0;
        config.apps = vec![idle];
        assert!(config.validate().is_err());
    }
}
