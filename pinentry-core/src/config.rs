//! Read-only view of the remote-juggler configuration file.
//!
//! Only `identities.<name>.gpg.{keygrips, keyId, securityMode}` is consumed;
//! everything else in the file is ignored.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-identity policy for PIN handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    MaximumSecurity,
    #[default]
    DeveloperWorkflow,
    /// PINs may be unsealed from hardware without prompting.
    TrustedWorkstation,
}

impl SecurityMode {
    /// Parse the config spelling. Unrecognised values fall back to the default.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "maximum_security" => Self::MaximumSecurity,
            "trusted_workstation" => Self::TrustedWorkstation,
            _ => Self::DeveloperWorkflow,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaximumSecurity => "maximum_security",
            Self::DeveloperWorkflow => "developer_workflow",
            Self::TrustedWorkstation => "trusted_workstation",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    identities: IndexMap<String, IdentityEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct IdentityEntry {
    #[serde(default)]
    gpg: Option<GpgEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GpgEntry {
    #[serde(default)]
    keygrips: Option<Vec<String>>,
    #[serde(default, rename = "keyId")]
    key_id: Option<String>,
    #[serde(default, rename = "securityMode")]
    security_mode: Option<String>,
}

/// One configured identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity<'a> {
    pub name: &'a str,
    pub keygrips: &'a [String],
    /// Primary GPG key ID; `None` when unset or empty.
    pub key_id: Option<&'a str>,
    pub security_mode: SecurityMode,
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Read and parse `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Like [`Config::load`], but a missing or malformed file yields an empty
    /// configuration: every lookup then misses and GETPIN always falls back
    /// to the interactive prompt.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!("config not found at {}", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => {
                tracing::debug!(
                    identities = config.identities.len(),
                    "loaded config from {}",
                    path.display()
                );
                config
            }
            Err(e) => {
                tracing::debug!("ignoring unusable config: {e}");
                Self::default()
            }
        }
    }

    /// Identities in file order.
    pub fn identities(&self) -> impl Iterator<Item = Identity<'_>> {
        self.identities
            .iter()
            .map(|(name, entry)| entry.view(name))
    }

    pub fn identity(&self, name: &str) -> Option<Identity<'_>> {
        self.identities
            .get_key_value(name)
            .map(|(name, entry)| entry.view(name))
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

impl IdentityEntry {
    fn view<'a>(&'a self, name: &'a str) -> Identity<'a> {
        let gpg = self.gpg.as_ref();
        Identity {
            name,
            keygrips: gpg
                .and_then(|g| g.keygrips.as_deref())
                .unwrap_or_default(),
            key_id: gpg
                .and_then(|g| g.key_id.as_deref())
                .filter(|id| !id.is_empty()),
            security_mode: gpg
                .and_then(|g| g.security_mode.as_deref())
                .map(SecurityMode::parse)
                .unwrap_or_default(),
        }
    }
}

/// `$XDG_CONFIG_HOME/remote-juggler/config.json`, defaulting to
/// `~/.config/remote-juggler/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    let base = if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME")
        && !xdg.is_empty()
    {
        PathBuf::from(xdg)
    } else {
        PathBuf::from(std::env::var_os("HOME")?).join(".config")
    };
    Some(base.join("remote-juggler").join("config.json"))
}
