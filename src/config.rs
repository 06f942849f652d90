use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::EngineOptions;
use crate::model::ParticipantMatch;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is required")]
    Missing { name: &'static str },
    #[error("{name}={value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error("both RESERVD_TLS_CERT and RESERVD_TLS_KEY must be set, or neither")]
    TlsPair,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Server settings, read from `RESERVD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub hash_salt: String,
    pub create_match: ParticipantMatch,
    pub update_match: ParticipantMatch,
    pub token_sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Unset and empty variables take their defaults; anything set must parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let tls = match (var("RESERVD_TLS_CERT"), var("RESERVD_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsPair),
        };

        Ok(Self {
            bind: var("RESERVD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&var, "RESERVD_PORT")?.unwrap_or(5433),
            data_dir: var("RESERVD_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: var("RESERVD_PASSWORD").unwrap_or_else(|| "reservd".into()),
            max_connections: parsed(&var, "RESERVD_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&var, "RESERVD_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parsed(&var, "RESERVD_METRICS_PORT")?,
            tls,
            jwt_secret: var("RESERVD_JWT_SECRET").ok_or(ConfigError::Missing {
                name: "RESERVD_JWT_SECRET",
            })?,
            jwt_issuer: var("RESERVD_JWT_ISSUER").unwrap_or_else(|| "reservd".into()),
            hash_salt: var("RESERVD_HASH_SALT").unwrap_or_default(),
            create_match: parsed(&var, "RESERVD_CREATE_MATCH")?.unwrap_or_default(),
            update_match: parsed(&var, "RESERVD_UPDATE_MATCH")?.unwrap_or_default(),
            token_sweep_interval: match var("RESERVD_TOKEN_SWEEP_INTERVAL") {
                Some(raw) => humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::Invalid {
                    name: "RESERVD_TOKEN_SWEEP_INTERVAL",
                    value: raw.clone(),
                    reason: e.to_string(),
                })?,
                None => Duration::from_secs(60),
            },
        })
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            create_match: self.create_match,
            update_match: self.update_match,
            hash_salt: self.hash_salt.clone(),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("reservd.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[("RESERVD_JWT_SECRET", "k")]).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.tls, None);
        assert_eq!(config.jwt_issuer, "reservd");
        assert_eq!(config.create_match, ParticipantMatch::SameRole);
        assert_eq!(config.update_match, ParticipantMatch::SameRole);
        assert_eq!(config.token_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.wal_path(), PathBuf::from("./data/reservd.wal"));
    }

    #[test]
    fn overrides() {
        let config = load(&[
            ("RESERVD_JWT_SECRET", "k"),
            ("RESERVD_BIND", "127.0.0.1"),
            ("RESERVD_PORT", "6000"),
            ("RESERVD_METRICS_PORT", "9100"),
            ("RESERVD_TLS_CERT", "/etc/reservd/cert.pem"),
            ("RESERVD_TLS_KEY", "/etc/reservd/key.pem"),
            ("RESERVD_CREATE_MATCH", "any_role"),
            ("RESERVD_TOKEN_SWEEP_INTERVAL", "5m"),
            ("RESERVD_HASH_SALT", "pepper"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.metrics_port, Some(9100));
        assert!(config.tls.is_some());
        let options = config.engine_options();
        assert_eq!(options.create_match, ParticipantMatch::AnyRole);
        assert_eq!(options.update_match, ParticipantMatch::SameRole);
        assert_eq!(options.hash_salt, "pepper");
        assert_eq!(config.token_sweep_interval, Duration::from_secs(300));
    }

    #[test]
    fn jwt_secret_is_required() {
        assert!(matches!(
            load(&[]),
            Err(ConfigError::Missing {
                name: "RESERVD_JWT_SECRET"
            })
        ));
    }

    #[test]
    fn bad_values_are_errors() {
        for (name, value) in [
            ("RESERVD_PORT", "not-a-port"),
            ("RESERVD_MAX_CONNECTIONS", "-1"),
            ("RESERVD_UPDATE_MATCH", "sometimes"),
            ("RESERVD_TOKEN_SWEEP_INTERVAL", "soon"),
        ] {
            let err = load(&[("RESERVD_JWT_SECRET", "k"), (name, value)]).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { name: n, .. } if n == name),
                "{name}: {err}"
            );
        }
    }

    #[test]
    fn tls_needs_both_halves() {
        let err = load(&[("RESERVD_JWT_SECRET", "k"), ("RESERVD_TLS_CERT", "c.pem")]).unwrap_err();
        assert!(matches!(err, ConfigError::TlsPair));
    }
}
