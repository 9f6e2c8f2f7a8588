// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for bulletin.

use std::time::Duration;

use uuid::Uuid;

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string. The in-memory store is used when unset.
    pub database_url: Option<String>,
    /// Period of both convergence loops.
    pub converge_interval: Duration,
    /// Age after which a pending task is re-auctioned or a completed task re-dispatched.
    pub kick_task_duration: Duration,
    /// Age after which a pending task is failed.
    pub expire_pending_task_duration: Duration,
    /// Age after which a completed or resolving task is deleted.
    pub expire_completed_task_duration: Duration,
    /// Timeout applied to every outbound RPC.
    pub rpc_timeout: Duration,
    /// TTL of the leader lock.
    pub lock_ttl: Duration,
    /// Identity written into the leader lock.
    pub bbs_id: String,
    /// URL advertised in the leader lock.
    pub advertise_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            converge_interval: Duration::from_secs(30),
            kick_task_duration: Duration::from_secs(30),
            expire_pending_task_duration: Duration::from_secs(30 * 60),
            expire_completed_task_duration: Duration::from_secs(120),
            rpc_timeout: Duration::from_millis(1000),
            lock_ttl: Duration::from_secs(10),
            bbs_id: Uuid::new_v4().to_string(),
            advertise_url: "http://127.0.0.1:8889".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = std::env::var("BULLETIN_DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty());

        Ok(Self {
            database_url,
            converge_interval: secs_var(
                "BULLETIN_CONVERGE_INTERVAL_SECS",
                defaults.converge_interval,
            )?,
            kick_task_duration: secs_var("BULLETIN_KICK_TASK_SECS", defaults.kick_task_duration)?,
            expire_pending_task_duration: secs_var(
                "BULLETIN_EXPIRE_PENDING_TASK_SECS",
                defaults.expire_pending_task_duration,
            )?,
            expire_completed_task_duration: secs_var(
                "BULLETIN_EXPIRE_COMPLETED_TASK_SECS",
                defaults.expire_completed_task_duration,
            )?,
            rpc_timeout: match std::env::var("BULLETIN_RPC_TIMEOUT_MS") {
                Ok(raw) => Duration::from_millis(
                    raw.parse()
                        .map_err(|_| ConfigError::Invalid("BULLETIN_RPC_TIMEOUT_MS", raw))?,
                ),
                Err(_) => defaults.rpc_timeout,
            },
            lock_ttl: secs_var("BULLETIN_LOCK_TTL_SECS", defaults.lock_ttl)?,
            bbs_id: std::env::var("BULLETIN_ID").unwrap_or(defaults.bbs_id),
            advertise_url: std::env::var("BULLETIN_ADVERTISE_URL")
                .unwrap_or(defaults.advertise_url),
        })
    }
}

fn secs_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::Invalid(name, raw))?;
            if secs == 0 {
                return Err(ConfigError::Invalid(name, "0".to_string()));
            }
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set to a value that cannot be used.
    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Environment variables are process-global.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn new(names: &[&'static str]) -> Self {
            let vars = names.iter().map(|name| (*name, env::var(name).ok())).collect();
            for name in names {
                // SAFETY: serialised by ENV_MUTEX.
                unsafe { env::remove_var(name) };
            }
            Self { vars }
        }

        fn set(&self, name: &str, value: &str) {
            // SAFETY: serialised by ENV_MUTEX.
            unsafe { env::set_var(name, value) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                // SAFETY: serialised by ENV_MUTEX.
                unsafe {
                    match value {
                        Some(v) => env::set_var(name, v),
                        None => env::remove_var(name),
                    }
                }
            }
        }
    }

    const VARS: &[&str] = &[
        "BULLETIN_DATABASE_URL",
        "BULLETIN_CONVERGE_INTERVAL_SECS",
        "BULLETIN_KICK_TASK_SECS",
        "BULLETIN_EXPIRE_PENDING_TASK_SECS",
        "BULLETIN_EXPIRE_COMPLETED_TASK_SECS",
        "BULLETIN_RPC_TIMEOUT_MS",
        "BULLETIN_LOCK_TTL_SECS",
        "BULLETIN_ID",
        "BULLETIN_ADVERTISE_URL",
    ];

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
        let _guard = EnvGuard::new(VARS);

        let config = Config::from_env().unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.converge_interval, Duration::from_secs(30));
        assert_eq!(config.kick_task_duration, Duration::from_secs(30));
        assert_eq!(config.expire_pending_task_duration, Duration::from_secs(1800));
        assert_eq!(config.expire_completed_task_duration, Duration::from_secs(120));
        assert_eq!(config.rpc_timeout, Duration::from_secs(1));
        assert_eq!(config.lock_ttl, Duration::from_secs(10));
        assert_eq!(config.advertise_url, "http://127.0.0.1:8889");
        assert!(!config.bbs_id.is_empty());
    }

    #[test]
    fn test_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
        let guard = EnvGuard::new(VARS);
        guard.set("BULLETIN_DATABASE_URL", "postgres://localhost/bulletin");
        guard.set("BULLETIN_CONVERGE_INTERVAL_SECS", "5");
        guard.set("BULLETIN_RPC_TIMEOUT_MS", "250");
        guard.set("BULLETIN_ID", "bbs-z1");

        let config = Config::from_env().unwrap();
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/bulletin")
        );
        assert_eq!(config.converge_interval, Duration::from_secs(5));
        assert_eq!(config.rpc_timeout, Duration::from_millis(250));
        assert_eq!(config.bbs_id, "bbs-z1");
    }

    #[test]
    fn test_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|p| p.into_inner());
        let guard = EnvGuard::new(VARS);
        guard.set("BULLETIN_KICK_TASK_SECS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("BULLETIN_KICK_TASK_SECS"));

        guard.set("BULLETIN_KICK_TASK_SECS", "0");
        assert!(Config::from_env().is_err());
    }
}
