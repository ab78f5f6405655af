//! Client contract for the replicated key-value store.
//!
//! The control plane needs linearizable point reads and writes, prefix scans
//! and deletes, compare-and-commit transactions, and lease-backed sessions
//! that scope named mutexes. Backends:
//!
//! - [`ValkeyStore`]: Valkey/Redis via `fred`; multi-key operations are Lua
//!   scripts so each runs atomically on the server.
//! - [`MemoryStore`]: in-process, used by tests and single-node development.
//! - [`DeadlineStore`]: wraps another backend and bounds every round trip.

mod memory;
mod valkey;

pub use memory::MemoryStore;
pub use valkey::ValkeyStore;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Identifier of a lease-backed session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transaction precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    KeyMissing(String),
    ValueEquals(String, String),
}

/// Transaction write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put(String, String),
    Delete(String),
    DeletePrefix(String),
}

/// Compare-and-commit transaction: if every compare holds, apply `success`,
/// otherwise apply `failure`. Both branches are atomic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<Op>,
    pub failure: Vec<Op>,
}

impl Txn {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    #[must_use]
    pub fn then(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.success.extend(ops);
        self
    }

    #[must_use]
    pub fn or_else(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.failure.extend(ops);
        self
    }
}

/// Outcome of a single mutex acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// Another holder owns the lock; try again later.
    Held,
    /// The session no longer exists; it must be re-granted first.
    SessionLost,
}

#[async_trait]
pub trait DistributedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// All key/value pairs whose key starts with `prefix`, in key order.
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Returns `true` if the compares held and the success branch was applied.
    async fn commit(&self, txn: Txn) -> Result<bool>;

    async fn grant_session(&self, ttl: Duration) -> Result<SessionId>;

    /// Extend the session lease. `Ok(false)` means the session is gone.
    async fn keep_alive(&self, session: &SessionId, ttl: Duration) -> Result<bool>;

    async fn revoke_session(&self, session: &SessionId) -> Result<()>;

    /// Try once to take the named lock for `token`, bound to `session`.
    /// The lock lapses after `ttl` if never released.
    async fn try_lock(
        &self,
        session: &SessionId,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<LockAttempt>;

    /// Release the named lock if it is still held by `token`.
    async fn unlock(&self, name: &str, token: &str) -> Result<()>;
}

/// Applies a deadline to every call of the wrapped store.
pub struct DeadlineStore {
    inner: Arc<dyn DistributedStore>,
    timeout: Duration,
}

impl DeadlineStore {
    #[must_use]
    pub fn new(inner: Arc<dyn DistributedStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| Error::Timeout {
                operation,
                after: self.timeout,
            })?
    }
}

#[async_trait]
impl DistributedStore for DeadlineStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.bounded("get", self.inner.get(key)).await
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.bounded("get_prefix", self.inner.get_prefix(prefix))
            .await
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.bounded("put", self.inner.put(key, value)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.bounded("delete", self.inner.delete(key)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.bounded("delete_prefix", self.inner.delete_prefix(prefix))
            .await
    }

    async fn commit(&self, txn: Txn) -> Result<bool> {
        self.bounded("commit", self.inner.commit(txn)).await
    }

    async fn grant_session(&self, ttl: Duration) -> Result<SessionId> {
        self.bounded("grant_session", self.inner.grant_session(ttl))
            .await
    }

    async fn keep_alive(&self, session: &SessionId, ttl: Duration) -> Result<bool> {
        self.bounded("keep_alive", self.inner.keep_alive(session, ttl))
            .await
    }

    async fn revoke_session(&self, session: &SessionId) -> Result<()> {
        self.bounded("revoke_session", self.inner.revoke_session(session))
            .await
    }

    async fn try_lock(
        &self,
        session: &SessionId,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<LockAttempt> {
        self.bounded("try_lock", self.inner.try_lock(session, name, token, ttl))
            .await
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<()> {
        self.bounded("unlock", self.inner.unlock(name, token))
            .await
    }
}
