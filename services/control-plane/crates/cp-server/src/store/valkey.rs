//! Valkey backend over a Fred client, with optional mTLS via rustls.
//!
//! Point operations map to plain commands. Transactions, session leases and
//! locks run as Lua scripts, which Valkey executes atomically.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fred::prelude::{
    Builder, Client, ClientLike, Config, KeysInterface, LuaInterface, ReconnectPolicy, Value,
};
use fred::types::config::{TlsConfig, TlsConnector, TlsHostMapping};
use fred::types::scan::Scanner;
use fleet_common::ControlPlaneConfig;
use uuid::Uuid;

use super::{Compare, DistributedStore, LockAttempt, Op, SessionId, Txn};
use crate::error::Result;

const SESSION_PREFIX: &str = "/sessions/";

/// ARGV: ncompares, (kind, key, value)*, nsuccess, (kind, key, value)*,
/// nfailure, (kind, key, value)*. Returns 1 when the compares held.
const TXN_SCRIPT: &str = r"
local i = 1
local function next_triple()
  local kind, key, val = ARGV[i], ARGV[i + 1], ARGV[i + 2]
  i = i + 3
  return kind, key, val
end
local function apply(n)
  for _ = 1, n do
    local kind, key, val = next_triple()
    if kind == 'put' then
      redis.call('SET', key, val)
    elseif kind == 'del' then
      redis.call('DEL', key)
    elseif kind == 'delprefix' then
      local cursor = '0'
      repeat
        local res = redis.call('SCAN', cursor, 'MATCH', key, 'COUNT', 100)
        cursor = res[1]
        for _, k in ipairs(res[2]) do
          redis.call('DEL', k)
        end
      until cursor == '0'
    end
  end
end
local ok = true
local ncmp = tonumber(ARGV[i])
i = i + 1
for _ = 1, ncmp do
  local kind, key, val = next_triple()
  local cur = redis.call('GET', key)
  if kind == 'missing' then
    if cur then ok = false end
  elseif kind == 'equals' then
    if cur ~= val then ok = false end
  end
end
local nsucc = tonumber(ARGV[i])
i = i + 1
if ok then
  apply(nsucc)
else
  i = i + 3 * nsucc
end
local nfail = tonumber(ARGV[i])
i = i + 1
if not ok then
  apply(nfail)
end
if ok then return 1 end
return 0
";

/// KEYS[1] session. ARGV[1] ttl ms.
const SESSION_GRANT_SCRIPT: &str = r"
redis.call('SET', KEYS[1], '1', 'PX', ARGV[1])
return 1
";

/// KEYS[1] session. ARGV[1] ttl ms. Returns 0 if the session is gone.
const SESSION_KEEPALIVE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return 1
";

/// KEYS[1] session, KEYS[2] lock. ARGV[1] holder (`<session key>|<token>`),
/// ARGV[2] ttl ms. A lock whose holding session is gone counts as free.
/// Returns 1 acquired, 0 held elsewhere, -1 session lost.
const LOCK_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
local holder = redis.call('GET', KEYS[2])
if holder and holder ~= ARGV[1] then
  local sep = string.find(holder, '|', 1, true)
  local owner = sep and string.sub(holder, 1, sep - 1) or ''
  if owner ~= '' and redis.call('EXISTS', owner) == 1 then return 0 end
end
redis.call('SET', KEYS[2], ARGV[1], 'PX', ARGV[2])
return 1
";

/// KEYS[1] lock. ARGV[1] token.
const UNLOCK_SCRIPT: &str = r"
local holder = redis.call('GET', KEYS[1])
if not holder then return 1 end
local sep = string.find(holder, '|', 1, true)
if sep and string.sub(holder, sep + 1) == ARGV[1] then
  redis.call('DEL', KEYS[1])
end
return 1
";

#[derive(Clone)]
pub struct ValkeyStore {
    client: Client,
}

impl ValkeyStore {
    /// Connect and verify the server answers a PING.
    pub async fn connect(config: &ControlPlaneConfig, password: Option<String>) -> anyhow::Result<Self> {
        let mut fred_config = Config::from_url(&config.valkey_url)
            .with_context(|| format!("invalid Valkey URL: {}", config.valkey_url))?;

        if let Some((ca_path, cert_path, key_path)) = config.valkey_tls_paths() {
            let tls_config = load_mtls_config(ca_path, cert_path, key_path)?;
            fred_config.tls = Some(TlsConfig {
                connector: TlsConnector::Rustls(Arc::new(tls_config).into()),
                hostnames: TlsHostMapping::None,
            });
            tracing::info!(ca = %ca_path, cert = %cert_path, key = %key_path, "Valkey mTLS enabled");
        }
        if let Some(user) = &config.valkey_user {
            fred_config.username = Some(user.clone());
        }
        if password.is_some() {
            fred_config.password = password;
        }

        let client = Builder::from_config(fred_config)
            .with_connection_config(|conn_config| {
                conn_config.connection_timeout = Duration::from_secs(5);
                conn_config.internal_command_timeout = Duration::from_secs(10);
            })
            .set_policy(ReconnectPolicy::new_exponential(0, 100, 5000, 5))
            .build()?;

        client.init().await.context("failed to connect to Valkey")?;

        client
            .ping::<String>(None)
            .await
            .context("Valkey startup PING failed")?;

        tracing::info!(url = %config.valkey_url, "Valkey connection ready");
        Ok(Self { client })
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        use futures::stream::TryStreamExt;

        let mut keys = Vec::new();
        let mut stream = self.client.scan(pattern, Some(100), None);

        while let Some(mut page) = stream.try_next().await? {
            if let Some(results) = page.take_results() {
                for key in results {
                    keys.push(key.as_str_lossy().to_string());
                }
            }
        }

        Ok(keys)
    }
}

fn load_mtls_config(ca_path: &str, cert_path: &str, key_path: &str) -> anyhow::Result<rustls::ClientConfig> {
    let ca_file =
        File::open(ca_path).with_context(|| format!("failed to open CA cert: {ca_path}"))?;
    let mut ca_reader = BufReader::new(ca_file);
    let ca_certs = rustls_pemfile::certs(&mut ca_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse CA cert")?;

    let mut root_store = rustls::RootCertStore::empty();
    for cert in ca_certs {
        root_store
            .add(cert)
            .context("failed to add CA cert to root store")?;
    }

    let cert_file = File::open(cert_path)
        .with_context(|| format!("failed to open client cert: {cert_path}"))?;
    let mut cert_reader = BufReader::new(cert_file);
    let client_certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to parse client cert")?;

    let key_file = File::open(key_path)
        .with_context(|| format!("failed to open client key: {key_path}"))?;
    let mut key_reader = BufReader::new(key_file);
    let client_key = rustls_pemfile::private_key(&mut key_reader)
        .context("failed to parse client key")?
        .context("no private key found in file")?;

    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(client_certs, client_key)
        .context("failed to build TLS config with client auth")
}

fn session_key(session: &SessionId) -> String {
    format!("{SESSION_PREFIX}{session}")
}

/// Lock value naming the holding session and the acquisition token.
fn lock_value(session: &SessionId, token: &str) -> String {
    format!("{}|{token}", session_key(session))
}

fn ttl_millis(ttl: Duration) -> String {
    ttl.as_millis().max(1).to_string()
}

/// SCAN MATCH pattern matching exactly the keys that start with `prefix`.
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

fn push_op(args: &mut Vec<String>, op: &Op) {
    let (kind, key, value) = match op {
        Op::Put(key, value) => ("put", key.clone(), value.clone()),
        Op::Delete(key) => ("del", key.clone(), String::new()),
        Op::DeletePrefix(prefix) => ("delprefix", prefix_pattern(prefix), String::new()),
    };
    args.extend([kind.to_string(), key, value]);
}

fn txn_args(txn: &Txn) -> Vec<String> {
    let mut args = Vec::with_capacity(3 + 3 * (txn.compares.len() + txn.success.len() + txn.failure.len()));

    args.push(txn.compares.len().to_string());
    for compare in &txn.compares {
        match compare {
            Compare::KeyMissing(key) => {
                args.extend(["missing".to_string(), key.clone(), String::new()]);
            }
            Compare::ValueEquals(key, value) => {
                args.extend(["equals".to_string(), key.clone(), value.clone()]);
            }
        }
    }

    args.push(txn.success.len().to_string());
    for op in &txn.success {
        push_op(&mut args, op);
    }

    args.push(txn.failure.len().to_string());
    for op in &txn.failure {
        push_op(&mut args, op);
    }

    args
}

#[async_trait]
impl DistributedStore for ValkeyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.client.get::<Option<String>, _>(key).await?)
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut matched_keys = self.scan_keys(&prefix_pattern(prefix)).await?;
        if matched_keys.is_empty() {
            return Ok(Vec::new());
        }
        matched_keys.sort();

        let values: Vec<Value> = self.client.mget(matched_keys.clone()).await?;

        // Keys deleted between SCAN and MGET come back as nil and are skipped.
        Ok(matched_keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.as_str().map(|v| (key, v.to_string())))
            .collect())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.client
            .set::<(), _, _>(key, value, None, None, false)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client.del::<(), _>(key).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.commit(Txn::new().then([Op::DeletePrefix(prefix.to_string())]))
            .await?;
        Ok(())
    }

    async fn commit(&self, txn: Txn) -> Result<bool> {
        let committed: i64 = self
            .client
            .eval(TXN_SCRIPT, Vec::<String>::new(), txn_args(&txn))
            .await?;
        Ok(committed == 1)
    }

    async fn grant_session(&self, ttl: Duration) -> Result<SessionId> {
        let session = SessionId::new(Uuid::new_v4().to_string());
        let _: i64 = self
            .client
            .eval(
                SESSION_GRANT_SCRIPT,
                vec![session_key(&session)],
                vec![ttl_millis(ttl)],
            )
            .await?;
        Ok(session)
    }

    async fn keep_alive(&self, session: &SessionId, ttl: Duration) -> Result<bool> {
        let alive: i64 = self
            .client
            .eval(
                SESSION_KEEPALIVE_SCRIPT,
                vec![session_key(session)],
                vec![ttl_millis(ttl)],
            )
            .await?;
        Ok(alive == 1)
    }

    async fn revoke_session(&self, session: &SessionId) -> Result<()> {
        self.client.del::<(), _>(session_key(session)).await?;
        Ok(())
    }

    async fn try_lock(
        &self,
        session: &SessionId,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<LockAttempt> {
        let outcome: i64 = self
            .client
            .eval(
                LOCK_SCRIPT,
                vec![session_key(session), name.to_string()],
                vec![lock_value(session, token), ttl_millis(ttl)],
            )
            .await?;
        Ok(match outcome {
            1 => LockAttempt::Acquired,
            -1 => LockAttempt::SessionLost,
            _ => LockAttempt::Held,
        })
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<()> {
        let _: i64 = self
            .client
            .eval(UNLOCK_SCRIPT, vec![name.to_string()], vec![token.to_string()])
            .await?;
        Ok(())
    }
}
