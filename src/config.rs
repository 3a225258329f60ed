//! Configuration of the client.
//!
//! Values are layered with `figment`: built-in defaults, then an optional YAML
//! file, then environment variables prefixed with `MNOTIFY_`. Command-line flags
//! take precedence over all of them.
//!
//! # Configuration File Format
//!
//! ```yaml
//! sync:
//!   # Long-poll budget of each sync request, in milliseconds
//!   timeout: 30000
//!   # Presence declared while syncing: online or offline
//!   presence: offline
//!
//! encryption:
//!   # What to do when the encryption state of a room cannot be fetched:
//!   # fail_closed aborts the send, fail_open sends in plaintext
//!   lookup_policy: fail_closed
//!   # Seconds before a room seen unencrypted is checked again
//!   cache_ttl: 300
//! ```
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```bash
//! export MNOTIFY_SYNC__TIMEOUT=10000
//! export MNOTIFY_ENCRYPTION__LOOKUP_POLICY=fail_open
//! ```

use std::{path::Path, time::Duration};

use anyhow::bail;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::matrix::{requester::Presence, state_cache::LookupPolicy, sync::DEFAULT_TIMEOUT_MS};

/// Prefix of the environment variables read by [`Config::load`].
const ENV_PREFIX: &str = "MNOTIFY_";

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub encryption: EncryptionConfig,
}

/// Sync loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Long-poll budget in milliseconds.
    pub timeout: u64,
    /// Presence declared to the homeserver while syncing.
    pub presence: Presence,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            timeout: DEFAULT_TIMEOUT_MS,
            presence: Presence::Offline,
        }
    }
}

/// Room state cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Behaviour when the encryption state of a room cannot be fetched.
    pub lookup_policy: LookupPolicy,
    /// Lifetime in seconds of a cached "not encrypted" answer.
    ///
    /// An encrypted room is never checked again.
    pub cache_ttl: u64,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            lookup_policy: LookupPolicy::FailClosed,
            cache_ttl: 300,
        }
    }
}

impl EncryptionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }
}

impl Config {
    /// Loads the configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Optional YAML file. When given, it must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, or if a value from the file or
    /// the environment has the wrong type.
    pub fn load(path: Option<&str>) -> anyhow::Result<Config> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        if let Some(path) = path {
            if !Path::new(path).exists() {
                bail!("config file {} does not exist", path);
            }
            debug!("read config file {}", path);
            figment = figment.merge(Yaml::file(path));
        }

        let config: Config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        debug!("config {:?}", config);

        Ok(config)
    }
}
