//! Daemon configuration loaded from environment variables.

use crate::reconcile::DEFAULT_RESYNC_CONCURRENCY;
use crate::stats::PostgresConfig;
use anyhow::Context;
use statsync_core::DEFAULT_CHANGE_CHANNEL;
use std::str::FromStr;
use std::time::Duration;

/// Reconciler daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis URL of the live registry and its change channel.
    pub redis_url: String,

    /// Postgres URL of the statistics store.
    pub database_url: String,

    /// Pub/sub channel carrying change messages.
    pub channel: String,

    /// Maximum pooled Postgres connections.
    pub db_max_connections: u32,

    /// Interval between periodic full resyncs. `None` disables them.
    pub resync_interval: Option<Duration>,

    /// Sensors reconciled at once during a full resync.
    pub resync_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`: Postgres statistics database
    ///
    /// Optional:
    /// - `REDIS_URL`: registry Redis (default: "redis://127.0.0.1:6379")
    /// - `STATSYNC_CHANNEL`: change channel (default: "main:all")
    /// - `STATSYNC_DB_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `STATSYNC_RESYNC_INTERVAL_SECS`: periodic resync, 0 disables (default: 0)
    /// - `STATSYNC_RESYNC_CONCURRENCY`: resync fan-out (default: 32)
    pub fn from_env() -> anyhow::Result<Self> {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .context("DATABASE_URL must be set")?;

        let channel = std::env::var("STATSYNC_CHANNEL")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_CHANGE_CHANNEL.to_string());

        let db_max_connections: u32 = parse_var("STATSYNC_DB_MAX_CONNECTIONS", 10)?;
        anyhow::ensure!(
            db_max_connections > 0,
            "STATSYNC_DB_MAX_CONNECTIONS must be at least 1"
        );

        let resync_secs: u64 = parse_var("STATSYNC_RESYNC_INTERVAL_SECS", 0)?;
        let resync_interval = (resync_secs > 0).then(|| Duration::from_secs(resync_secs));

        let resync_concurrency: usize =
            parse_var("STATSYNC_RESYNC_CONCURRENCY", DEFAULT_RESYNC_CONCURRENCY)?;
        anyhow::ensure!(
            resync_concurrency > 0,
            "STATSYNC_RESYNC_CONCURRENCY must be at least 1"
        );

        tracing::info!(
            channel = %channel,
            db_max_connections,
            resync_interval_secs = resync_secs,
            resync_concurrency,
            "reconciler configuration loaded"
        );

        Ok(Self {
            redis_url,
            database_url,
            channel,
            db_max_connections,
            resync_interval,
            resync_concurrency,
        })
    }

    pub fn postgres(&self) -> PostgresConfig {
        PostgresConfig {
            url: self.database_url.clone(),
            max_connections: self.db_max_connections,
            ..PostgresConfig::default()
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has invalid value {raw:?}")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize config tests that manipulate env vars.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "REDIS_URL",
        "DATABASE_URL",
        "STATSYNC_CHANNEL",
        "STATSYNC_DB_MAX_CONNECTIONS",
        "STATSYNC_RESYNC_INTERVAL_SECS",
        "STATSYNC_RESYNC_CONCURRENCY",
    ];

    /// Helper to run config tests with isolated env vars.
    fn with_env_vars<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

        let saved: Vec<_> = ENV_KEYS
            .iter()
            .map(|k| (*k, std::env::var(k).ok()))
            .collect();

        // SAFETY: Serialized by mutex; only test code touches these vars.
        unsafe {
            for k in ENV_KEYS {
                std::env::remove_var(k);
            }
            for (k, v) in vars {
                std::env::set_var(k, v);
            }
        }

        f();

        // SAFETY: Restoring original env state.
        unsafe {
            for (k, v) in &saved {
                match v {
                    Some(val) => std::env::set_var(k, val),
                    None => std::env::remove_var(k),
                }
            }
        }
    }

    #[test]
    fn config_defaults() {
        with_env_vars(&[("DATABASE_URL", "postgres://localhost/stats")], || {
            let config = Config::from_env().unwrap();
            assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
            assert_eq!(config.database_url, "postgres://localhost/stats");
            assert_eq!(config.channel, "main:all");
            assert_eq!(config.db_max_connections, 10);
            assert_eq!(config.resync_interval, None);
            assert_eq!(config.resync_concurrency, 32);
        });
    }

    #[test]
    fn config_requires_database_url() {
        with_env_vars(&[], || {
            let err = Config::from_env().unwrap_err();
            assert!(err.to_string().contains("DATABASE_URL"));
        });
    }

    #[test]
    fn config_overrides() {
        with_env_vars(
            &[
                ("DATABASE_URL", "postgres://db/stats"),
                ("REDIS_URL", "redis://cache:6380"),
                ("STATSYNC_CHANNEL", "registry:changes"),
                ("STATSYNC_DB_MAX_CONNECTIONS", "4"),
                ("STATSYNC_RESYNC_INTERVAL_SECS", "3600"),
                ("STATSYNC_RESYNC_CONCURRENCY", " 8 "),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.redis_url, "redis://cache:6380");
                assert_eq!(config.channel, "registry:changes");
                assert_eq!(config.db_max_connections, 4);
                assert_eq!(config.resync_interval, Some(Duration::from_secs(3600)));
                assert_eq!(config.resync_concurrency, 8);

                let pg = config.postgres();
                assert_eq!(pg.url, "postgres://db/stats");
                assert_eq!(pg.max_connections, 4);
            },
        );
    }

    #[test]
    fn config_rejects_invalid_numbers() {
        with_env_vars(
            &[
                ("DATABASE_URL", "postgres://db/stats"),
                ("STATSYNC_RESYNC_CONCURRENCY", "many"),
            ],
            || {
                let err = Config::from_env().unwrap_err();
                assert!(err.to_string().contains("STATSYNC_RESYNC_CONCURRENCY"));
            },
        );

        with_env_vars(
            &[
                ("DATABASE_URL", "postgres://db/stats"),
                ("STATSYNC_DB_MAX_CONNECTIONS", "0"),
            ],
            || {
                assert!(Config::from_env().is_err());
            },
        );
    }
}
