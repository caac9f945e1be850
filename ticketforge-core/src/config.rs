//! Configuration loaded from TOML.
//!
//! The default file lives in the platform config directory
//! (`~/.config/ticketforge/config.toml` on Linux). A missing default file
//! yields the built-in defaults; an explicitly named file must exist.
//!
//! ```toml
//! debug = false
//! token_ttl_secs = 600
//! acquire_timeout_secs = 30
//!
//! spns = [
//!     "HTTP/intranet.example.com",
//!     { name = "Build server", spn = "HTTP/ci.example.com@EXAMPLE.COM" },
//! ]
//! ```

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::broker::BrokerSettings;
use crate::spn::{ServicePrincipal, SpnError};
use crate::transport::TransportSettings;

/// Errors from loading or querying configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("failed to serialize config: {message}")]
    Serialize { message: String },

    #[error("configured identity '{name}' is invalid: {source}")]
    InvalidSpn {
        name: String,
        #[source]
        source: SpnError,
    },

    #[error("no configured identity matches '{query}'")]
    UnknownSpn { query: String },

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Upper bound for `token_ttl_secs`: one day.
pub const MAX_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Upper bound for `sweep_interval_secs`: one day.
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// A configured identity with its display name.
///
/// In TOML an entry is either a bare string (used as both name and identity)
/// or a table `{ name, spn }`. An empty name falls back to the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawSpnEntry")]
pub struct SpnEntry {
    pub name: String,
    pub spn: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSpnEntry {
    Bare(String),
    Named {
        #[serde(default)]
        name: String,
        spn: String,
    },
}

impl From<RawSpnEntry> for SpnEntry {
    fn from(raw: RawSpnEntry) -> Self {
        match raw {
            RawSpnEntry::Bare(spn) => Self {
                name: spn.clone(),
                spn,
            },
            RawSpnEntry::Named { name, spn } if name.trim().is_empty() => Self {
                name: spn.clone(),
                spn,
            },
            RawSpnEntry::Named { name, spn } => Self { name, spn },
        }
    }
}

/// An identity resolved from a name or given directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedSpn {
    pub name: String,
    pub spn: ServicePrincipal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketforgeConfig {
    /// Emit step-by-step transport diagnostics.
    pub debug: bool,

    /// Credential cache override (managed backend).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ccache_path: Option<PathBuf>,

    /// krb5.conf override (managed backend).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub krb5_config: Option<PathBuf>,

    /// How long an acquired ticket stays in the token cache.
    pub token_ttl_secs: u64,

    /// Interval between cache sweeps.
    pub sweep_interval_secs: u64,

    /// Upper bound on one acquisition. 0 waits forever.
    pub acquire_timeout_secs: u64,

    /// Socket timeout for KDC traffic.
    pub kdc_timeout_secs: u64,

    pub spns: Vec<SpnEntry>,

    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for TicketforgeConfig {
    fn default() -> Self {
        Self {
            debug: false,
            ccache_path: None,
            krb5_config: None,
            token_ttl_secs: 600,
            sweep_interval_secs: 60,
            acquire_timeout_secs: 30,
            kdc_timeout_secs: 10,
            spns: Vec::new(),
            config_path: None,
        }
    }
}

impl TicketforgeConfig {
    /// Load from `path`, or from [`default_path`] when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_file(path),
            None => match default_path() {
                Some(path) if path.exists() => Self::load_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&contents).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        config.config_path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize {
            message: e.to_string(),
        })
    }

    /// Write to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        std::fs::write(path, self.to_toml()?).map_err(io)
    }

    /// Lifetimes must be in range and every configured identity must parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("token_ttl_secs", self.token_ttl_secs, MAX_TOKEN_TTL_SECS)?;
        check_range(
            "sweep_interval_secs",
            self.sweep_interval_secs,
            MAX_SWEEP_INTERVAL_SECS,
        )?;
        for entry in &self.spns {
            ServicePrincipal::parse(&entry.spn).map_err(|source| ConfigError::InvalidSpn {
                name: entry.name.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Resolve `query` to an identity.
    ///
    /// Case-insensitive exact name match first; then `query` itself if it
    /// parses as an identity; then the first name containing `query`.
    pub fn find_spn(&self, query: &str) -> Result<NamedSpn, ConfigError> {
        let query = query.trim();
        let needle = query.to_lowercase();

        let exact = self.spns.iter().find(|e| e.name.to_lowercase() == needle);
        if let Some(entry) = exact {
            return entry.resolve();
        }

        if let Ok(spn) = ServicePrincipal::parse(query) {
            return Ok(NamedSpn {
                name: spn.to_string(),
                spn,
            });
        }

        self.spns
            .iter()
            .find(|e| !needle.is_empty() && e.name.to_lowercase().contains(&needle))
            .ok_or_else(|| ConfigError::UnknownSpn {
                query: query.to_string(),
            })?
            .resolve()
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        (self.acquire_timeout_secs > 0).then(|| Duration::from_secs(self.acquire_timeout_secs))
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            debug: self.debug,
            ccache_path: self.ccache_path.clone(),
            krb5_config: self.krb5_config.clone(),
            kdc_timeout: (self.kdc_timeout_secs > 0)
                .then(|| Duration::from_secs(self.kdc_timeout_secs)),
        }
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            transport: self.transport_settings(),
            token_ttl: self.token_ttl(),
            acquire_timeout: self.acquire_timeout(),
        }
    }
}

impl SpnEntry {
    fn resolve(&self) -> Result<NamedSpn, ConfigError> {
        let spn = ServicePrincipal::parse(&self.spn).map_err(|source| ConfigError::InvalidSpn {
            name: self.name.clone(),
            source,
        })?;
        Ok(NamedSpn {
            name: self.name.clone(),
            spn,
        })
    }
}

fn check_range(field: &'static str, value: u64, max: u64) -> Result<(), ConfigError> {
    if (1..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min: 1,
            max,
        })
    }
}

/// `<config dir>/ticketforge/config.toml`, when a home directory exists.
pub fn default_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "raibid-labs", "ticketforge")
}
