//! Server settings from `SLOTWISE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    pub lookup_timeout: Duration,
    pub schedule_file: Option<PathBuf>,
    pub holidays_file: Option<PathBuf>,
    pub addresses_file: Option<PathBuf>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotwise".into(),
            max_connections: 256,
            compact_threshold: 1000,
            lookup_timeout: Duration::from_millis(2000),
            schedule_file: None,
            holidays_file: None,
            addresses_file: None,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparsable numbers fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            port: parsed(&get, "SLOTWISE_PORT").unwrap_or(d.port),
            bind: get("SLOTWISE_BIND").unwrap_or(d.bind),
            data_dir: get("SLOTWISE_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: get("SLOTWISE_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&get, "SLOTWISE_MAX_CONNECTIONS").unwrap_or(d.max_connections),
            compact_threshold: parsed(&get, "SLOTWISE_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            lookup_timeout: parsed(&get, "SLOTWISE_LOOKUP_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.lookup_timeout),
            schedule_file: get("SLOTWISE_SCHEDULE_FILE").map(PathBuf::from),
            holidays_file: get("SLOTWISE_HOLIDAYS_FILE").map(PathBuf::from),
            addresses_file: get("SLOTWISE_ADDRESSES_FILE").map(PathBuf::from),
            tls_cert: get("SLOTWISE_TLS_CERT"),
            tls_key: get("SLOTWISE_TLS_KEY"),
            metrics_port: parsed(&get, "SLOTWISE_METRICS_PORT"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotwise.wal")
    }
}
