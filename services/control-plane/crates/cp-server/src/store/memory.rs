//! In-process store with the same semantics as the Valkey backend.
//!
//! Every operation takes one mutex, which makes the store trivially
//! linearizable. Outage and lease expiry can be forced for failure tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Compare, DistributedStore, LockAttempt, Op, SessionId, Txn};
use crate::error::{Error, Result};

#[derive(Debug)]
struct LockHolder {
    session: SessionId,
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    kv: BTreeMap<String, String>,
    sessions: HashMap<SessionId, Instant>,
    locks: HashMap<String, LockHolder>,
}

impl State {
    fn session_alive(&mut self, session: &SessionId, now: Instant) -> bool {
        match self.sessions.get(session) {
            Some(expires_at) if *expires_at > now => true,
            Some(_) => {
                self.sessions.remove(session);
                false
            }
            None => false,
        }
    }

    fn holds(&self, compare: &Compare) -> bool {
        match compare {
            Compare::KeyMissing(key) => !self.kv.contains_key(key),
            Compare::ValueEquals(key, value) => self.kv.get(key) == Some(value),
        }
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Put(key, value) => {
                self.kv.insert(key, value);
            }
            Op::Delete(key) => {
                self.kv.remove(&key);
            }
            Op::DeletePrefix(prefix) => self.kv.retain(|k, _| !k.starts_with(&prefix)),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `StoreUnavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop a session as if its lease had lapsed.
    pub fn expire_session(&self, session: &SessionId) {
        self.lock_state().sessions.remove(session);
    }

    /// Copy of every key/value pair currently stored.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.lock_state().kv.clone()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock_state().sessions.len()
    }

    /// Current holder token of a named lock, ignoring expiry.
    #[must_use]
    pub fn lock_holder(&self, name: &str) -> Option<String> {
        self.lock_state().locks.get(name).map(|h| h.token.clone())
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("memory store offline".to_string()));
        }
        Ok(self.lock_state())
    }
}

#[async_trait]
impl DistributedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.state()?.kv.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let state = self.state()?;
        Ok(state
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.state()?.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.state()?.kv.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.state()?.apply(Op::DeletePrefix(prefix.to_string()));
        Ok(())
    }

    async fn commit(&self, txn: Txn) -> Result<bool> {
        let mut state = self.state()?;
        let ok = txn.compares.iter().all(|c| state.holds(c));
        let ops = if ok { txn.success } else { txn.failure };
        for op in ops {
            state.apply(op);
        }
        Ok(ok)
    }

    async fn grant_session(&self, ttl: Duration) -> Result<SessionId> {
        let session = SessionId::new(Uuid::new_v4().to_string());
        self.state()?
            .sessions
            .insert(session.clone(), Instant::now() + ttl);
        Ok(session)
    }

    async fn keep_alive(&self, session: &SessionId, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut state = self.state()?;
        if !state.session_alive(session, now) {
            return Ok(false);
        }
        state.sessions.insert(session.clone(), now + ttl);
        Ok(true)
    }

    async fn revoke_session(&self, session: &SessionId) -> Result<()> {
        self.state()?.sessions.remove(session);
        Ok(())
    }

    async fn try_lock(
        &self,
        session: &SessionId,
        name: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<LockAttempt> {
        let now = Instant::now();
        let mut state = self.state()?;
        if !state.session_alive(session, now) {
            return Ok(LockAttempt::SessionLost);
        }
        // A lock outlives neither its ttl nor the session that took it.
        let rival = state
            .locks
            .get(name)
            .filter(|h| h.token != token && h.expires_at > now)
            .map(|h| h.session.clone());
        if let Some(owner) = rival
            && state.session_alive(&owner, now)
        {
            return Ok(LockAttempt::Held);
        }
        state.locks.insert(
            name.to_string(),
            LockHolder {
                session: session.clone(),
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(LockAttempt::Acquired)
    }

    async fn unlock(&self, name: &str, token: &str) -> Result<()> {
        let mut state = self.state()?;
        if state.locks.get(name).is_some_and(|h| h.token == token) {
            state.locks.remove(name);
        }
        Ok(())
    }
}
