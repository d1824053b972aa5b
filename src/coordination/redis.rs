//! KeyDB / Redis backed [`CoordinationStore`].
//!
//! Builds a [`fred::clients::Pool`] configured from
//! [`crate::config::KeyDbConfig`], optionally enabling TLS via `rustls` and
//! reading the auth token from an environment variable.

use std::time::Duration;

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::{ClientLike, KeysInterface, ListInterface, LuaInterface};
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::{Builder, CustomCommand, Expiration, SetOptions};
use tracing::{debug, trace, warn};

use super::store::CoordinationStore;
use crate::config::KeyDbConfig;

/// Appends ARGV[1] to KEYS[1] unless present and returns its 0-based index.
const PUSH_IF_ABSENT_SCRIPT: &str = r#"
    local items = redis.call('LRANGE', KEYS[1], 0, -1)
    for i, v in ipairs(items) do
        if v == ARGV[1] then
            return i - 1
        end
    end
    return redis.call('RPUSH', KEYS[1], ARGV[1]) - 1
"#;

/// Deletes KEYS[1] only when its value starts with "ARGV[1]:".
const RELEASE_LOCK_SCRIPT: &str = r#"
    local val = redis.call('GET', KEYS[1])
    if val and string.find(val, ARGV[1] .. ":", 1, true) == 1 then
        redis.call('DEL', KEYS[1])
        return 1
    end
    return 0
"#;

/// Where and how to reach the store, resolved from [`KeyDbConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint<'a> {
    pub host: &'a str,
    pub port: u16,
    /// Set by `tls: true` or by a `rediss://` scheme.
    pub tls: bool,
}

/// Resolve the configured endpoint, honouring an optional `redis://` or
/// `rediss://` scheme prefix.
pub fn resolve_endpoint(config: &KeyDbConfig) -> Result<Endpoint<'_>> {
    let (rest, scheme_tls) = match config.endpoint.strip_prefix("rediss://") {
        Some(rest) => (rest, true),
        None => (
            config
                .endpoint
                .strip_prefix("redis://")
                .unwrap_or(&config.endpoint),
            false,
        ),
    };
    let (host, port) = parse_host_port(rest)?;
    anyhow::ensure!(!host.is_empty(), "KeyDB endpoint has no host: {}", config.endpoint);
    Ok(Endpoint {
        host,
        port,
        tls: config.tls || scheme_tls,
    })
}

/// Create a KeyDB connection pool from the application configuration.
///
/// The auth token is read from the environment variable named by
/// `auth_token_env`.  The pool is connected and PING-verified before being
/// returned.
pub async fn create_keydb_pool(config: &KeyDbConfig) -> Result<Pool> {
    let endpoint = resolve_endpoint(config)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(endpoint.host, endpoint.port),
        password: std::env::var(&config.auth_token_env).ok(),
        ..fred::types::config::Config::default()
    };
    if endpoint.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    let mut builder = Builder::from_config(fred_config);
    // Exponential reconnect: initial 0ms, base 100ms, max 30s, factor 2.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(config.pool_size.max(1))
        .context("failed to build KeyDB connection pool")?;
    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    tracing::info!(
        host = endpoint.host,
        port = endpoint.port,
        tls = endpoint.tls,
        pool_size = config.pool_size,
        "KeyDB pool created and verified"
    );

    Ok(pool)
}

/// Parse a `host:port` string.  If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    // Strip any trailing path segments (e.g. a database index).
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

fn millis(ttl: Duration) -> i64 {
    ttl.as_millis().clamp(1, i64::MAX as u128) as i64
}

/// [`CoordinationStore`] over a fred pool.
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl CoordinationStore for RedisStore {
    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<()> {
        let _: Option<String> = self
            .pool
            .set(key, "1", Some(Expiration::PX(millis(ttl))), None, false)
            .await
            .with_context(|| format!("SET {key}"))?;
        trace!(%key, ttl_ms = millis(ttl), "marker set");
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let _: bool = self
            .pool
            .pexpire(key, millis(ttl), None)
            .await
            .with_context(|| format!("PEXPIRE {key}"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let removed: i64 = self
            .pool
            .del(key)
            .await
            .with_context(|| format!("DEL {key}"))?;
        debug!(%key, removed, "key deleted");
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        // KEYS is acceptable here: the health keyspace holds one key per
        // fleet member.
        let keys: Vec<String> = self
            .pool
            .custom(
                CustomCommand::new_static("KEYS", None::<u16>, false),
                vec![pattern.to_string()],
            )
            .await
            .with_context(|| format!("KEYS {pattern}"))?;
        Ok(keys)
    }

    async fn list_push_if_absent(&self, list: &str, value: &str) -> Result<usize> {
        let index: i64 = self
            .pool
            .eval(
                PUSH_IF_ABSENT_SCRIPT,
                vec![list.to_string()],
                vec![value.to_string()],
            )
            .await
            .with_context(|| format!("push-if-absent on {list}"))?;
        usize::try_from(index).with_context(|| format!("negative list index {index} for {list}"))
    }

    async fn list_index_of(&self, list: &str, value: &str) -> Result<Option<usize>> {
        let items: Vec<String> = self
            .pool
            .lrange(list, 0, -1)
            .await
            .with_context(|| format!("LRANGE {list}"))?;
        Ok(items.iter().position(|item| item == value))
    }

    async fn try_lock(&self, name: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let value = format!("{owner}:{}", chrono::Utc::now().timestamp());
        let result: Option<String> = self
            .pool
            .set(
                name,
                value.as_str(),
                Some(Expiration::PX(millis(ttl))),
                Some(SetOptions::NX),
                false,
            )
            .await
            .with_context(|| format!("SET NX {name}"))?;
        // SET … NX returns "OK" when the key was set, nil otherwise.
        Ok(result.is_some())
    }

    async fn unlock(&self, name: &str, owner: &str) -> Result<()> {
        let released: i64 = self
            .pool
            .eval(
                RELEASE_LOCK_SCRIPT,
                vec![name.to_string()],
                vec![owner.to_string()],
            )
            .await
            .context("lock release script failed")?;
        if released == 0 {
            warn!(lock = %name, %owner, "lock release: key missing or owned by another node");
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let _: String = self.pool.ping(None).await.context("KeyDB PING failed")?;
        Ok(())
    }
}
