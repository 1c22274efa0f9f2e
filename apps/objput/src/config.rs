//! Settings resolution.
//!
//! Values come from, in order of precedence: command-line flags (or their
//! environment variables), the optional TOML file, and built-in defaults.
//! Credentials only come from the environment.
//!
//! ```toml
//! endpoint = "oss-cn-hangzhou.aliyuncs.com"
//! bucket = "media"
//! part_size = 268435456
//! concurrency = 4
//! ```

use std::path::{Path, PathBuf};

use objput_storage::Credentials;
use objput_upload::{AbandonPolicy, RetryPolicy, UploadConfig};
use serde::Deserialize;

use crate::cli::Cli;

/// Environment variables holding the access key id, in lookup order.
pub const ACCESS_KEY_ID_VARS: &[&str] = &["OBJPUT_ACCESS_KEY_ID", "ACCESS_KEY"];

/// Environment variables holding the access key secret, in lookup order.
pub const ACCESS_KEY_SECRET_VARS: &[&str] = &["OBJPUT_ACCESS_KEY_SECRET", "ACCESS_SECRET"];

/// Errors raised while building [`Settings`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing parameter: {0}")]
    Missing(&'static str),

    #[error("invalid parameter: {0}")]
    Invalid(String),

    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Contents of the optional TOML configuration file.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub path_style: bool,
    /// Part size in bytes.
    pub part_size: Option<u64>,
    /// Simple-upload threshold in bytes.
    pub threshold: Option<u64>,
    pub concurrency: Option<usize>,
    pub retries: Option<u32>,
    pub keep_abandoned: bool,
}

impl FileConfig {
    /// Reads and parses `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fully resolved, immutable run settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub endpoint: String,
    pub bucket: String,
    pub object: String,
    pub file: PathBuf,
    pub region: Option<String>,
    pub path_style: bool,
    pub credentials: Credentials,
    pub upload: UploadConfig,
}

impl Settings {
    /// Resolves settings from `cli`, the config file it names, and `env`.
    pub fn load(
        cli: Cli,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file, env)
    }

    /// Merges flags over file values over defaults.
    pub fn resolve(
        cli: Cli,
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let access_key_id = first_env(&env, ACCESS_KEY_ID_VARS).ok_or(ConfigError::Missing(
            "access key id (OBJPUT_ACCESS_KEY_ID or ACCESS_KEY)",
        ))?;
        let access_key_secret = first_env(&env, ACCESS_KEY_SECRET_VARS).ok_or(
            ConfigError::Missing("access key secret (OBJPUT_ACCESS_KEY_SECRET or ACCESS_SECRET)"),
        )?;

        let endpoint =
            non_empty(cli.endpoint.or(file.endpoint)).ok_or(ConfigError::Missing("--endpoint"))?;
        let bucket =
            non_empty(cli.bucket.or(file.bucket)).ok_or(ConfigError::Missing("--bucket"))?;
        let object = non_empty(cli.object).ok_or(ConfigError::Missing("--object"))?;
        let path = cli
            .file
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::Missing("--file"))?;

        let defaults = UploadConfig::default();
        let abandon = if cli.keep_abandoned || file.keep_abandoned {
            AbandonPolicy::Keep
        } else {
            AbandonPolicy::Abort
        };
        let upload = UploadConfig {
            threshold: cli.threshold.or(file.threshold).unwrap_or(defaults.threshold),
            part_size: cli.part_size.or(file.part_size).unwrap_or(defaults.part_size),
            concurrency: cli
                .concurrency
                .or(file.concurrency)
                .unwrap_or(defaults.concurrency),
            retry: RetryPolicy {
                max_retries: cli
                    .retries
                    .or(file.retries)
                    .unwrap_or(defaults.retry.max_retries),
                ..defaults.retry
            },
            abandon,
        };
        upload
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Self {
            endpoint,
            bucket,
            object,
            file: path,
            region: non_empty(cli.region.or(file.region)),
            path_style: cli.path_style || file.path_style,
            credentials: Credentials::new(access_key_id, access_key_secret),
            upload,
        })
    }
}

fn first_env(env: &impl Fn(&str) -> Option<String>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| non_empty(env(name)))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
