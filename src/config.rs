//! Configuration manager for dirgate.
//!
//! The whole process configuration is read once at startup and passed
//! explicitly into each component constructor. There is no hot reload and
//! no ad-hoc global lookup.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Listen port. `PORT` environment variable takes precedence.
    pub port: Option<u16>,
    #[serde(default)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Provisioned administrator identities, immutable at runtime.
    #[serde(default, skip_serializing)]
    pub admins: Vec<Admin>,
    /// Related to session token configuration.
    #[serde(skip_serializing)]
    pub token: Option<Token>,
    /// Related to LDAP3 configuration.
    #[serde(skip_serializing)]
    pub ldap: Option<Ldap>,
    /// Related to the audit log store.
    #[serde(skip_serializing)]
    pub audit: Option<Audit>,
}

/// A provisioned administrator. Password hashes are PHC strings (argon2id).
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admin {
    pub username: String,
    pub password_hash: String,
    pub display_name: String,
    pub role: String,
}

/// Session token configuration.
///
/// The signing secret itself is never stored in the file; it comes from the
/// `TOKEN_SECRET` environment variable.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Token lifetime in seconds. Default is 8 hours.
    pub ttl_secs: Option<u64>,
}

/// LDAP configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ldap {
    /// `ldap(s)://hostname:(?port)` for LDAP instance.
    pub address: String,
    /// Admin DN credential to connect.
    pub bind_dn: String,
    /// Password credential to connect.
    /// `LDAP_PASSWORD` environment variable takes precedence.
    pub bind_password: Option<String>,
    /// DN for domain.
    pub base_dn: String,
    /// Maximum pooled connections.
    pub pool_size: Option<usize>,
    /// Seconds to wait for a pooled connection before giving up.
    pub acquire_timeout_secs: Option<u64>,
    /// Seconds allowed to establish and bind a connection.
    pub connect_timeout_secs: Option<u64>,
    /// Seconds allowed for a single directory operation.
    pub operation_timeout_secs: Option<u64>,
    /// Seconds after which a connection is recycled instead of reused.
    pub max_lifetime_secs: Option<u64>,
    /// Connect attempts before surfacing `BackendUnavailable`.
    pub connect_attempts: Option<u32>,
}

/// Audit log configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    /// File holding the append-ordered records, one JSON object per line.
    pub path: PathBuf,
    /// Retention bound: oldest records are dropped past this count.
    pub max_records: Option<usize>,
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Reads the `config.yaml` file from the specified path, or the default
    /// location when no path was given. An explicit path that cannot be
    /// opened is an error, never a silent fallback to another file.
    pub fn read(self) -> Arc<Self> {
        let file_path = if self.path.as_os_str().is_empty() {
            Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        } else {
            self.path.clone()
        };

        match File::open(&file_path) {
            Ok(file) => {
                let mut config: Configuration =
                    match serde_yaml::from_reader(file) {
                        Ok(config) => config,
                        Err(err) => {
                            return Arc::new(self.error(err));
                        },
                    };

                // set app version.
                config.version = VERSION.to_owned();

                Arc::new(config)
            },
            Err(err) => Arc::new(self.error(err)),
        }
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, "`config.yaml` file not readable");
        Self {
            version: VERSION.to_owned(),
            ..Default::default()
        }
    }
}
