//! Runtime configuration, read once at startup from a TOML file

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::de::{DeserializeOwned, IntoDeserializer};
use thiserror::Error;

use crate::relay::{AddressError, Destinations, RelayTrigger, TlsMode};
use crate::smtp::{ServerLimits, SmtpLimits};

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "SMTP_DUP_CONFIG";

/// Searched in order when neither the command line nor the environment names
/// a file
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["./config.toml", "/etc/smtp-dup/config.toml"];

/// Prefix of per-setting overrides: `SMTP_DUP_<SECTION>_<KEY>`, upper case,
/// e.g. `SMTP_DUP_RELAY_DESTINATION_PRIMARY`
pub const ENV_PREFIX: &str = "SMTP_DUP_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("SMTP_DUP_CONFIG points to non-existent file: {}", .0.display())]
    MissingEnvFile(PathBuf),

    #[error("no configuration file found; tried {tried}")]
    NotFound { tried: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid value for {key}: {reason}")]
    Env { key: String, reason: String },

    #[error("invalid destination: {0}")]
    Destination(#[from] AddressError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub smtp: SmtpConfig,
    pub relay: RelayConfig,
}

/// Inbound side
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SmtpConfig {
    /// Address to accept connections on
    pub listen: String,
    /// Name used in the greeting and in EHLO towards upstreams
    pub domain: String,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:2525".to_string(),
            domain: "localhost".to_string(),
            max_message_bytes: SmtpLimits::DEFAULT_MAX_MESSAGE_BYTES,
            max_recipients: SmtpLimits::DEFAULT_MAX_RECIPIENTS,
        }
    }
}

/// Outbound side
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub destination_primary: String,
    pub destination_backups: Vec<String>,
    pub trigger: RelayTrigger,
    pub tls: TlsMode,
    /// Per-connection timeout towards upstreams; lettre's default when unset
    pub timeout_secs: Option<u64>,
    pub backup_workers: usize,
    pub backup_queue: usize,
    pub shutdown_grace_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            destination_primary: String::new(),
            destination_backups: Vec::new(),
            trigger: RelayTrigger::default(),
            tls: TlsMode::default(),
            timeout_secs: None,
            backup_workers: 4,
            backup_queue: 256,
            shutdown_grace_secs: 30,
        }
    }
}

impl Config {
    /// Read and parse `path`. Does not validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Apply `SMTP_DUP_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    ///
    /// Overrides win over the file. `SMTP_DUP_RELAY_DESTINATION_BACKUPS` is a
    /// comma-separated list; an empty value clears the backups.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvOverrides { lookup };

        if let Some(listen) = env.string("SMTP_LISTEN") {
            self.smtp.listen = listen;
        }
        if let Some(domain) = env.string("SMTP_DOMAIN") {
            self.smtp.domain = domain;
        }
        if let Some(max) = env.parse("SMTP_MAX_MESSAGE_BYTES")? {
            self.smtp.max_message_bytes = max;
        }
        if let Some(max) = env.parse("SMTP_MAX_RECIPIENTS")? {
            self.smtp.max_recipients = max;
        }

        if let Some(primary) = env.string("RELAY_DESTINATION_PRIMARY") {
            self.relay.destination_primary = primary;
        }
        if let Some(backups) = env.list("RELAY_DESTINATION_BACKUPS") {
            self.relay.destination_backups = backups;
        }
        if let Some(trigger) = env.choice("RELAY_TRIGGER")? {
            self.relay.trigger = trigger;
        }
        if let Some(tls) = env.choice("RELAY_TLS")? {
            self.relay.tls = tls;
        }
        if let Some(secs) = env.parse("RELAY_TIMEOUT_SECS")? {
            self.relay.timeout_secs = Some(secs);
        }
        if let Some(workers) = env.parse("RELAY_BACKUP_WORKERS")? {
            self.relay.backup_workers = workers;
        }
        if let Some(queue) = env.parse("RELAY_BACKUP_QUEUE")? {
            self.relay.backup_queue = queue;
        }
        if let Some(secs) = env.parse("RELAY_SHUTDOWN_GRACE_SECS")? {
            self.relay.shutdown_grace_secs = secs;
        }

        Ok(())
    }

    /// Check every setting and parse the destinations
    pub fn validate(&self) -> Result<Destinations, ConfigError> {
        if self.relay.destination_primary.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "relay.destination_primary is required".to_string(),
            ));
        }
        if self.smtp.domain.trim().is_empty() {
            return Err(ConfigError::Invalid("smtp.domain must not be empty".to_string()));
        }

        for (name, value) in [
            ("smtp.max_message_bytes", self.smtp.max_message_bytes),
            ("smtp.max_recipients", self.smtp.max_recipients),
            ("relay.backup_workers", self.relay.backup_workers),
            ("relay.backup_queue", self.relay.backup_queue),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
        }

        Ok(Destinations::parse(
            &self.relay.destination_primary,
            self.relay.destination_backups.as_slice(),
        )?)
    }

    pub fn server_limits(&self) -> ServerLimits {
        ServerLimits {
            max_message_bytes: self.smtp.max_message_bytes,
            max_recipients: self.smtp.max_recipients,
        }
    }

    pub fn relay_timeout(&self) -> Option<Duration> {
        self.relay.timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.relay.shutdown_grace_secs)
    }
}

struct EnvOverrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvOverrides<F> {
    fn key(name: &str) -> String {
        format!("{ENV_PREFIX}{name}")
    }

    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&Self::key(name))
    }

    fn list(&self, name: &str) -> Option<Vec<String>> {
        self.string(name).map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(String::from)
                .collect()
        })
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(name)
            .map(|value| {
                value.trim().parse().map_err(|e: T::Err| ConfigError::Env {
                    key: Self::key(name),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// Same names as in the file, e.g. `transaction`
    fn choice<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ConfigError> {
        self.string(name)
            .map(|value| {
                let value = value.trim().to_ascii_lowercase();
                T::deserialize(value.as_str().into_deserializer()).map_err(
                    |e: serde::de::value::Error| ConfigError::Env {
                        key: Self::key(name),
                        reason: e.to_string(),
                    },
                )
            })
            .transpose()
    }
}

/// Pick the configuration file: `cli` first, then [`CONFIG_ENV`], then
/// [`DEFAULT_CONFIG_PATHS`].
pub fn find_config_file(cli: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    let defaults: Vec<PathBuf> = DEFAULT_CONFIG_PATHS.iter().map(PathBuf::from).collect();
    locate(cli, std::env::var_os(CONFIG_ENV).map(PathBuf::from), &defaults)
}

fn locate(
    cli: Option<PathBuf>,
    env: Option<PathBuf>,
    defaults: &[PathBuf],
) -> Result<PathBuf, ConfigError> {
    // An explicit path is used as given; a missing file is reported on read
    if let Some(path) = cli {
        return Ok(path);
    }

    if let Some(path) = env {
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::MissingEnvFile(path));
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let tried = defaults
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(ConfigError::NotFound {
        tried: format!("--config, {CONFIG_ENV}, {tried}"),
    })
}
