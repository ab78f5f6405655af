//! Shared harness and mock ports for unit tests.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_common::{AgentRecord, ContainerInfo, ResourceUpdate, SchemaInfo};
use fleet_cp_server::clock::ManualClock;
use fleet_cp_server::coordinator::CoordinatorSettings;
use fleet_cp_server::leadership::LeaderSignal;
use fleet_cp_server::metadata::{KvMetadataStore, MetadataStore};
use fleet_cp_server::processor::RetryPolicy;
use fleet_cp_server::store::{DistributedStore, LockAttempt, MemoryStore, SessionId, Txn};
use fleet_cp_server::{AgentManager, Error, ManagerSettings, Result};
use uuid::Uuid;

/// 2023-11-14T22:13:20Z
pub const T0: i64 = 1_700_000_000_000_000_000;

// ── Harness ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub manager: Arc<AgentManager>,
}

pub fn fast_settings() -> ManagerSettings {
    ManagerSettings {
        coordinator: CoordinatorSettings {
            session_ttl: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(1),
            lock_retry_interval: Duration::from_millis(1),
        },
        retry: RetryPolicy::unbounded()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(1)),
    }
}

/// Manager over a fresh [`MemoryStore`] with the clock parked at [`T0`].
pub async fn harness(leader: bool) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let mds = Arc::new(KvMetadataStore::new(store.clone()));
    harness_with(leader, store.clone(), store, mds).await
}

/// Manager talking to `store`; `memory` is the backing store tests inspect.
pub async fn harness_with(
    leader: bool,
    memory: Arc<MemoryStore>,
    store: Arc<dyn DistributedStore>,
    mds: Arc<dyn MetadataStore>,
) -> Harness {
    let clock = Arc::new(ManualClock::new(T0));
    let manager = AgentManager::with_clock(
        store,
        mds,
        LeaderSignal::fixed(leader),
        fast_settings(),
        clock.clone(),
    )
    .await
    .expect("manager starts");

    Harness {
        store: memory,
        clock,
        manager: Arc::new(manager),
    }
}

/// Poll `cond` until it holds, failing the test after about two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

// ── Mock: metadata store recording schema updates ────────────────────────────

/// Records every `update_schemas` attempt. Fails the first `failures` calls,
/// and every call for a poisoned agent.
#[derive(Default)]
pub struct RecordingMetadataStore {
    failures_left: Mutex<usize>,
    poisoned: Option<Uuid>,
    attempts: Mutex<HashMap<Uuid, usize>>,
    applied: Mutex<Vec<Uuid>>,
}

impl RecordingMetadataStore {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures_left: Mutex::new(failures),
            ..Self::default()
        }
    }

    pub fn poisoned(agent_id: Uuid) -> Self {
        Self {
            poisoned: Some(agent_id),
            ..Self::default()
        }
    }

    pub fn attempts_for(&self, agent_id: Uuid) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(&agent_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn applied(&self) -> Vec<Uuid> {
        self.applied.lock().unwrap().clone()
    }
}

fn unexpected<T>() -> Result<T> {
    Err(Error::InvalidArgument("not expected in this test".to_string()))
}

#[async_trait]
impl MetadataStore for RecordingMetadataStore {
    async fn update_containers(&self, _: &[ContainerInfo]) -> Result<()> {
        Ok(())
    }

    async fn update_schemas(&self, agent_id: Uuid, _: &[SchemaInfo]) -> Result<()> {
        *self.attempts.lock().unwrap().entry(agent_id).or_default() += 1;

        if self.poisoned == Some(agent_id) {
            return Err(Error::StoreUnavailable("poisoned".to_string()));
        }
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(Error::StoreUnavailable("transient".to_string()));
            }
        }
        self.applied.lock().unwrap().push(agent_id);
        Ok(())
    }

    async fn get_agents(&self) -> Result<Vec<AgentRecord>> {
        unexpected()
    }

    async fn add_to_front_of_agent_queue(&self, _: &str, _: ResourceUpdate) -> Result<()> {
        unexpected()
    }

    async fn get_from_agent_queue(&self, _: &str) -> Result<Vec<ResourceUpdate>> {
        unexpected()
    }
}

// ── Store decorators ─────────────────────────────────────────────────────────

/// Delegates to a [`MemoryStore`]. Before each commit another writer claims
/// `key` with `value`, as if it won the race for it.
pub struct RacingStore {
    pub inner: Arc<MemoryStore>,
    pub key: String,
    pub value: String,
}

/// Delegates to a [`MemoryStore`], but every session it grants is already
/// expired.
pub struct ExpiringSessions {
    pub inner: Arc<MemoryStore>,
}

#[async_trait]
impl DistributedStore for RacingStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.inner.get_prefix(prefix).await
    }
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.inner.put(key, value).await
    }
    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.inner.delete_prefix(prefix).await
    }
    async fn commit(&self, txn: Txn) -> Result<bool> {
        self.inner.put(&self.key, &self.value).await?;
        self.inner.commit(txn).await
    }
    async fn grant_session(&self, ttl: Duration) -> Result<SessionId> {
        self.inner.grant_session(ttl).await
    }
    async fn keep_alive(&self, session: &SessionId, ttl: Duration) -> Result<bool> {
        self.inner.keep_alive(session, ttl).await
    }
    async fn revoke_session(&self, session: &SessionId) -> Result<()> {
        self.inner.revoke_session(session).await
    }
    async fn try_lock(
        &self,
        session: &SessionId,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<LockAttempt> {
        self.inner.try_lock(session, name, token, ttl).await
    }
    async fn unlock(&self, name: &str, token: &str) -> Result<()> {
        self.inner.unlock(name, token).await
    }
}

#[async_trait]
impl DistributedStore for ExpiringSessions {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        self.inner.get_prefix(prefix).await
    }
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.inner.put(key, value).await
    }
    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }
    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.inner.delete_prefix(prefix).await
    }
    async fn commit(&self, txn: Txn) -> Result<bool> {
        self.inner.commit(txn).await
    }
    async fn grant_session(&self, ttl: Duration) -> Result<SessionId> {
        let session = self.inner.grant_session(ttl).await?;
        self.inner.expire_session(&session);
        Ok(session)
    }
    async fn keep_alive(&self, session: &SessionId, ttl: Duration) -> Result<bool> {
        self.inner.keep_alive(session, ttl).await
    }
    async fn revoke_session(&self, session: &SessionId) -> Result<()> {
        self.inner.revoke_session(session).await
    }
    async fn try_lock(
        &self,
        session: &SessionId,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<LockAttempt> {
        self.inner.try_lock(session, name, token, ttl).await
    }
    async fn unlock(&self, name: &str, token: &str) -> Result<()> {
        self.inner.unlock(name, token).await
    }
}
