//! KeyDB / Redis client pool creation and the [`SharedStore`] backed by it.
//!
//! Builds a [`fred::clients::Pool`] configured for the KeyDB instance
//! described in [`crate::config::KeyDbConfig`], optionally enabling TLS
//! via `rustls` and reading the auth token from an environment variable.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fred::clients::Pool;
use fred::error::{Error as FredError, ErrorKind};
use fred::interfaces::{ClientLike, KeysInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, SetOptions};

use super::store::{SharedStore, StoreError};

/// Create a KeyDB connection pool from the application configuration.
///
/// The pool is initialised (connected + PING verified) before being returned.
pub async fn create_keydb_pool(config: &crate::config::KeyDbConfig) -> Result<Pool> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    // The endpoint may carry a `rediss://` or `redis://` scheme prefix.
    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");

    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        ..fred::types::config::Config::default()
    };

    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    if let Some(ref token) = auth_token {
        fred_config.password = Some(token.clone());
    }

    let mut builder = Builder::from_config(fred_config);

    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    // The failover guard sits above this and quarantines callers meanwhile.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(config.pool_size)
        .context("failed to build KeyDB connection pool")?;

    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    tracing::info!(
        host = host,
        port = port,
        tls = config.tls,
        pool_size = config.pool_size,
        "KeyDB pool created and verified"
    );

    Ok(pool)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

// ---------------------------------------------------------------------------
// SharedStore
// ---------------------------------------------------------------------------

/// [`SharedStore`] over a KeyDB pool.  `set_if_absent` is `SET ... NX`.
#[derive(Clone)]
pub struct KeyDbStore {
    pool: Pool,
}

impl KeyDbStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

/// Split fred errors into the connectivity class and everything else.
pub(crate) fn classify(err: FredError) -> StoreError {
    match err.kind() {
        ErrorKind::IO | ErrorKind::Timeout | ErrorKind::Canceled | ErrorKind::Backpressure => {
            StoreError::Unavailable(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

#[async_trait]
impl SharedStore for KeyDbStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.pool.get(key).await.map_err(classify)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _: Option<String> = self
            .pool
            .set(key, value, None, None, false)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        // SET … NX returns "OK" when the key was set, nil otherwise.
        let result: Option<String> = self
            .pool
            .set(key, value, None, Some(SetOptions::NX), false)
            .await
            .map_err(classify)?;
        Ok(result.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _: i64 = self.pool.del(key).await.map_err(classify)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port_with_port() {
        let (host, port) = parse_host_port("keydb.local:6380").unwrap();
        assert_eq!(host, "keydb.local");
        assert_eq!(port, 6380);
    }

    #[test]
    fn test_parse_host_port_default() {
        let (host, port) = parse_host_port("keydb.local").unwrap();
        assert_eq!(host, "keydb.local");
        assert_eq!(port, 6379);
    }

    #[test]
    fn test_parse_host_port_bad_port() {
        assert!(parse_host_port("keydb.local:notaport").is_err());
    }

    #[test]
    fn io_errors_are_connectivity_class() {
        let err = classify(FredError::new(ErrorKind::IO, "connection reset"));
        assert!(err.is_unavailable());
        let err = classify(FredError::new(ErrorKind::Timeout, "timed out"));
        assert!(err.is_unavailable());
    }

    #[test]
    fn command_errors_are_backend_class() {
        let err = classify(FredError::new(ErrorKind::InvalidArgument, "bad arg"));
        assert!(!err.is_unavailable());
    }
}
