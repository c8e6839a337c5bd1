// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

/// The provider's fixed IMAP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub connect_timeout_seconds: u64,
    pub operation_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingSettings {
    /// How often the scheduler wakes to re-read the stored polling settings.
    pub tick_seconds: u64,
    /// Maximum concurrent mailbox fetches per cycle.
    pub worker_limit: usize,
    /// Used when `polling_interval` is missing or unparseable in storage.
    pub default_interval_seconds: u64,
    /// Leave accounts whose last fetch failed out of the next cycle.
    pub skip_errored_accounts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub log: LogConfig,
    pub database_url: String,
    pub imap: ImapSettings,
    pub polling: PollingSettings,
}

impl Settings {
    /// Layer defaults, the optional file and the environment.
    ///
    /// Unusable direct overrides are skipped and described in the returned
    /// warnings so the caller can log them once logging is set up.
    pub fn load(config_path: Option<&str>) -> Result<(Self, Vec<String>), ConfigError> {
        let mut warnings = Vec::new();
        let mut config_builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("database_url", "sqlite:data/accounts.db")?
            // IMAP defaults
            .set_default("imap.host", "imap.qq.com")?
            .set_default("imap.port", 993)?
            .set_default("imap.connect_timeout_seconds", 30)?
            .set_default("imap.operation_timeout_seconds", 60)?
            // Polling defaults
            .set_default("polling.tick_seconds", 5)?
            .set_default("polling.worker_limit", 10)?
            .set_default("polling.default_interval_seconds", 300)?
            .set_default("polling.skip_errored_accounts", false)?;

        if let Some(path) = config_path {
            config_builder = config_builder.add_source(File::with_name(path));
        }

        // e.g. `MAILWATCH_POLLING__WORKER_LIMIT=4` overrides `polling.worker_limit`
        config_builder = config_builder.add_source(
            Environment::with_prefix("MAILWATCH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .ignore_empty(true),
        );

        // Direct environment variables for the common settings
        let env_vars = [
            ("DATABASE_URL", "database_url"),
            ("IMAP_HOST", "imap.host"),
            ("IMAP_PORT", "imap.port"),
            ("POLL_WORKERS", "polling.worker_limit"),
            ("LOG_LEVEL", "log.level"),
        ];

        for (env_var, config_path) in &env_vars {
            if let Ok(value) = env::var(env_var) {
                if *env_var == "IMAP_PORT" {
                    if let Ok(port) = value.parse::<u16>() {
                        config_builder = config_builder.set_override(config_path, port)?;
                    } else {
                        warnings.push(format!("Invalid port value in {}: {}", env_var, value));
                    }
                } else if *env_var == "POLL_WORKERS" {
                    if let Ok(workers) = value.parse::<i64>() {
                        config_builder = config_builder.set_override(config_path, workers)?;
                    } else {
                        warnings.push(format!("Invalid worker count in {}: {}", env_var, value));
                    }
                } else {
                    config_builder = config_builder.set_override(config_path, value)?;
                }
            }
        }

        let settings: Settings = config_builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok((settings, warnings))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.polling.worker_limit == 0 {
            return Err(ConfigError::Message("polling.worker_limit must be at least 1".into()));
        }
        if self.polling.tick_seconds == 0 {
            return Err(ConfigError::Message("polling.tick_seconds must be at least 1".into()));
        }
        Ok(())
    }
}
