//! Configuration types shared across crates.

use crate::replica::DEFAULT_REPLICA_TYPE;
use crate::stage_request::PinExpiryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// PostgreSQL SSL mode configuration.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PgSslMode {
    /// Disable SSL/TLS entirely.
    Disable,
    /// Prefer SSL/TLS but allow unencrypted connections (default).
    #[default]
    Prefer,
    /// Require SSL/TLS for all connections.
    Require,
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (single host deployments and tests).
    Sqlite {
        /// Database file path, or `:memory:`.
        path: PathBuf,
        /// Query timeout in seconds (advisory only - SQLite cannot force-cancel queries).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL. Takes precedence over individual fields if both are provided.
        url: Option<String>,
        /// Database host.
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password.
        /// Prefer STAGER_METADATA__PASSWORD over storing it in the config file.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// SSL mode for connections.
        ssl_mode: Option<PgSslMode>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds. PostgreSQL cancels queries
        /// that exceed it.
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(60_000)
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/stager.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> crate::Result<()> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                max_connections,
                ..
            } => {
                if *max_connections == 0 {
                    return Err(crate::Error::InvalidConfig(
                        "postgres max_connections must be at least 1".to_string(),
                    ));
                }
                match (url.as_ref(), host.as_ref(), database.as_ref()) {
                    (Some(_), _, _) => Ok(()),
                    (None, Some(_), Some(_)) => Ok(()),
                    (None, None, _) => Err(crate::Error::InvalidConfig(
                        "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                    )),
                    (None, Some(_), None) => Err(crate::Error::InvalidConfig(
                        "postgres config requires 'database' when using individual fields"
                            .to_string(),
                    )),
                }
            }
        }
    }
}

/// Staging pipeline behaviour.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StagingConfig {
    /// How pin expiry is computed when a stage request completes.
    #[serde(default)]
    pub pin_expiry: PinExpiryPolicy,
    /// Pin lifetime requested from backends when the caller does not supply one.
    #[serde(default = "default_pin_lifetime_secs")]
    pub default_pin_lifetime_secs: u64,
    /// Type tag written on newly created cache replicas.
    #[serde(default = "default_replica_type")]
    pub replica_type: String,
}

fn default_pin_lifetime_secs() -> u64 {
    86_400
}

fn default_replica_type() -> String {
    DEFAULT_REPLICA_TYPE.to_string()
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            pin_expiry: PinExpiryPolicy::default(),
            default_pin_lifetime_secs: default_pin_lifetime_secs(),
            replica_type: default_replica_type(),
        }
    }
}

impl StagingConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.replica_type.trim().is_empty() {
            return Err(crate::Error::InvalidConfig(
                "staging.replica_type cannot be empty".to_string(),
            ));
        }
        if self.default_pin_lifetime_secs > i64::MAX as u64 {
            return Err(crate::Error::InvalidConfig(format!(
                "staging.default_pin_lifetime_secs={} is out of range",
                self.default_pin_lifetime_secs
            )));
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Staging pipeline configuration.
    #[serde(default)]
    pub staging: StagingConfig,
}

impl AppConfig {
    /// Create a test configuration backed by an in-memory SQLite store.
    pub fn for_testing() -> Self {
        Self {
            metadata: MetadataConfig::Sqlite {
                path: PathBuf::from(":memory:"),
                query_timeout_secs: None,
            },
            staging: StagingConfig::default(),
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.metadata.validate()?;
        self.staging.validate()
    }
}
