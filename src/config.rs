use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::limits::DEFAULT_PAYMENT_GATEWAY;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both FIELDBOOK_TLS_CERT and FIELDBOOK_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor runs.
    pub compact_threshold: u64,
    pub tls: Option<TlsPaths>,
    pub metrics_port: Option<u16>,
    pub payment_gateway: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |var: &'static str, default: &str| -> Result<String, ConfigError> {
            let value = lookup(var).unwrap_or_else(|| default.to_string());
            if value.trim().is_empty() {
                return Err(ConfigError::Empty(var));
            }
            Ok(value)
        };

        let tls = match (lookup("FIELDBOOK_TLS_CERT"), lookup("FIELDBOOK_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::PartialTls),
        };

        Ok(Self {
            port: parse(&lookup, "FIELDBOOK_PORT")?.unwrap_or(5433),
            bind: text("FIELDBOOK_BIND", "0.0.0.0")?,
            data_dir: text("FIELDBOOK_DATA_DIR", "./data")?.into(),
            password: text("FIELDBOOK_PASSWORD", "fieldbook")?,
            max_connections: parse(&lookup, "FIELDBOOK_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parse(&lookup, "FIELDBOOK_COMPACT_THRESHOLD")?.unwrap_or(1000),
            tls,
            metrics_port: parse(&lookup, "FIELDBOOK_METRICS_PORT")?,
            payment_gateway: text("FIELDBOOK_PAYMENT_GATEWAY", DEFAULT_PAYMENT_GATEWAY)?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("fieldbook.wal")
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { var, value })
        })
        .transpose()
}
