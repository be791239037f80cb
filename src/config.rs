//! Layered configuration: defaults, TOML file, `SFTP_MOVER_*` environment
//! variables, then command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::core::models::{DEFAULT_PARTIAL_SUFFIX, Direction, TransferRequest};
use crate::fs::sftp::{Credential, SftpSettings};

pub const DEFAULT_CONFIG_PATH: &str = "sftp-mover.toml";
pub const ENV_PREFIX: &str = "SFTP_MOVER_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Path groups run at once per task unless the task overrides it.
    pub max_concurrency: usize,
    pub verbose: bool,
    pub json_logs: bool,
    pub defaults: TransferDefaults,
    pub tasks: Vec<TaskConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            verbose: false,
            json_logs: false,
            defaults: TransferDefaults::default(),
            tasks: Vec::new(),
        }
    }
}

/// Policy applied to every path unless the path overrides it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferDefaults {
    pub partial_suffix: String,
    pub retry_count: u32,
    pub retry_wait_secs: u64,
    pub overwrite_destination: bool,
    pub remove_stale_partials: bool,
    pub error_when_source_missing: bool,
}

impl Default for TransferDefaults {
    fn default() -> Self {
        Self {
            partial_suffix: DEFAULT_PARTIAL_SUFFIX.to_string(),
            retry_count: 5,
            retry_wait_secs: 2,
            overwrite_destination: false,
            remove_stale_partials: false,
            error_when_source_missing: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    pub server: ServerConfig,
    #[serde(default)]
    pub paths: Vec<PathConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Environment variable holding the password.
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default, skip_serializing)]
    pub private_key_passphrase: Option<String>,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_port() -> u16 {
    22
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub direction: Direction,
    #[serde(default)]
    pub extensions: Vec<String>,
    pub partial_suffix: Option<String>,
    pub retry_count: Option<u32>,
    pub retry_wait_secs: Option<u64>,
    pub overwrite_destination: Option<bool>,
    pub remove_stale_partials: Option<bool>,
    pub error_when_source_missing: Option<bool>,
}

impl AppConfig {
    /// Load from `path` and the environment, with `overrides` (usually the
    /// parsed command line) taking precedence over both.
    pub fn new<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::globals(overrides));
        }

        Self::from_figment(figment)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_concurrency > 0, "max_concurrency must be at least 1");
        validate_policy("defaults", &self.defaults)?;

        for task in &self.tasks {
            ensure!(!task.paths.is_empty(), "task '{}' has no paths", task.name);
            if task.max_concurrency == Some(0) {
                bail!("task '{}': max_concurrency must be at least 1", task.name);
            }
            for (index, path) in task.paths.iter().enumerate() {
                let policy = path.policy(&self.defaults);
                validate_policy(&format!("task '{}' path {}", task.name, index + 1), &policy)?;
            }
        }
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|task| task.name == name)
    }

    pub fn concurrency_for(&self, task: &TaskConfig) -> usize {
        task.max_concurrency.unwrap_or(self.max_concurrency)
    }
}

fn validate_policy(scope: &str, policy: &TransferDefaults) -> Result<()> {
    ensure!(
        !policy.partial_suffix.is_empty(),
        "{scope}: partial_suffix must not be empty"
    );
    ensure!(policy.retry_count > 0, "{scope}: retry_count must be at least 1");
    Ok(())
}

impl PathConfig {
    /// This path's effective policy.
    pub fn policy(&self, defaults: &TransferDefaults) -> TransferDefaults {
        TransferDefaults {
            partial_suffix: self
                .partial_suffix
                .clone()
                .unwrap_or_else(|| defaults.partial_suffix.clone()),
            retry_count: self.retry_count.unwrap_or(defaults.retry_count),
            retry_wait_secs: self.retry_wait_secs.unwrap_or(defaults.retry_wait_secs),
            overwrite_destination: self
                .overwrite_destination
                .unwrap_or(defaults.overwrite_destination),
            remove_stale_partials: self
                .remove_stale_partials
                .unwrap_or(defaults.remove_stale_partials),
            error_when_source_missing: self
                .error_when_source_missing
                .unwrap_or(defaults.error_when_source_missing),
        }
    }

    pub fn request(&self, defaults: &TransferDefaults) -> TransferRequest {
        let policy = self.policy(defaults);
        TransferRequest::new(&self.source, &self.destination, self.direction)
            .with_extensions(&self.extensions)
            .with_partial_suffix(policy.partial_suffix)
            .overwrite_destination(policy.overwrite_destination)
            .remove_stale_partials(policy.remove_stale_partials)
            .error_when_source_missing(policy.error_when_source_missing)
            .with_retry(
                policy.retry_count,
                Duration::from_secs(policy.retry_wait_secs),
            )
    }
}

impl TaskConfig {
    pub fn requests(&self, defaults: &TransferDefaults) -> Vec<TransferRequest> {
        self.paths.iter().map(|path| path.request(defaults)).collect()
    }

    pub fn sftp_settings(&self) -> Result<SftpSettings> {
        let server = &self.server;
        Ok(SftpSettings {
            host: server.host.clone(),
            port: server.port,
            username: server.username.clone(),
            credential: server
                .credential()
                .with_context(|| format!("task '{}'", self.name))?,
            root: server.root.clone().unwrap_or_else(|| PathBuf::from("/")),
            host_key_fingerprint: server.host_key_fingerprint.clone(),
            timeout: Duration::from_secs(server.timeout_secs),
        })
    }
}

impl ServerConfig {
    /// `user@host:port`, the same label the SFTP connector reports.
    pub fn server(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }

    /// Resolve the configured credential. A password named by `password_env`
    /// is read from the environment here.
    pub fn credential(&self) -> Result<Credential> {
        if let Some(password) = &self.password {
            return Ok(Credential::Password(password.clone()));
        }
        if let Some(var) = &self.password_env {
            let password = std::env::var(var)
                .with_context(|| format!("Password variable {var} is not set"))?;
            return Ok(Credential::Password(password));
        }
        if let Some(path) = &self.private_key_path {
            return Ok(Credential::PrivateKey {
                path: path.clone(),
                passphrase: self.private_key_passphrase.clone(),
            });
        }
        bail!(
            "no credential for {}@{}: set password, password_env or private_key_path",
            self.username,
            self.host
        )
    }
}
