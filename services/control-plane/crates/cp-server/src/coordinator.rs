//! Owner of the lease-backed coordination session and the store mutex.
//!
//! One coordinator per agent manager. The session is granted at startup and
//! kept alive in the background; when the store reports it gone, the next
//! lock acquisition re-grants it before trying again.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{DistributedStore, LockAttempt, SessionId};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Lease TTL of the session; also the lapse time of an unreleased lock.
    pub session_ttl: Duration,
    /// Longest a caller waits for the mutex before giving up with `Timeout`.
    pub lock_timeout: Duration,
    /// Pause between acquisition attempts while another holder has the lock.
    pub lock_retry_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(5),
            lock_retry_interval: Duration::from_millis(25),
        }
    }
}

pub struct LeaderCoordinator {
    store: Arc<dyn DistributedStore>,
    settings: CoordinatorSettings,
    session: Arc<RwLock<SessionId>>,
    session_lost: Arc<AtomicBool>,
    /// Serializes waiters inside this process before they contend on the store.
    local: Arc<tokio::sync::Mutex<()>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderCoordinator {
    /// Grant the session and start renewing it every third of its TTL.
    pub async fn connect(
        store: Arc<dyn DistributedStore>,
        settings: CoordinatorSettings,
    ) -> Result<Self> {
        let session = store.grant_session(settings.session_ttl).await?;
        info!(session = %session, ttl_ms = settings.session_ttl.as_millis(), "coordination session granted");

        let coordinator = Self {
            store,
            settings,
            session: Arc::new(RwLock::new(session)),
            session_lost: Arc::new(AtomicBool::new(false)),
            local: Arc::new(tokio::sync::Mutex::new(())),
            keepalive: Mutex::new(None),
        };
        coordinator.start_keepalive();
        Ok(coordinator)
    }

    fn start_keepalive(&self) {
        let store = Arc::clone(&self.store);
        let session = Arc::clone(&self.session);
        let lost = Arc::clone(&self.session_lost);
        let ttl = self.settings.session_ttl;
        let period = (ttl / 3).max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let current = session.read().await.clone();
                match store.keep_alive(&current, ttl).await {
                    Ok(true) => debug!(session = %current, "session renewed"),
                    Ok(false) => {
                        // Ignore the verdict if the session was replaced meanwhile.
                        if *session.read().await == current {
                            warn!(session = %current, "coordination session expired");
                            lost.store(true, Ordering::SeqCst);
                        }
                    }
                    Err(e) => warn!(session = %current, error = %e, "session keepalive failed"),
                }
            }
        });

        *self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    pub async fn session_id(&self) -> SessionId {
        self.session.read().await.clone()
    }

    /// Replace the session with a freshly granted one.
    pub async fn renew(&self) -> Result<()> {
        let mut session = self.session.write().await;
        if let Err(e) = self.store.revoke_session(&session).await {
            debug!(session = %*session, error = %e, "revoking old session failed");
        }
        let fresh = self.store.grant_session(self.settings.session_ttl).await?;
        info!(old = %*session, new = %fresh, "coordination session renewed");
        *session = fresh;
        self.session_lost.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Acquire the named store mutex.
    ///
    /// Waits at most `lock_timeout`. A lost session is re-granted once; if the
    /// fresh session is lost too, `SessionLost` is returned.
    pub async fn lock(&self, name: &str) -> Result<LockGuard> {
        let timeout = Error::Timeout {
            operation: "lock",
            after: self.settings.lock_timeout,
        };
        let deadline = Instant::now() + self.settings.lock_timeout;

        let local = tokio::time::timeout_at(deadline, Arc::clone(&self.local).lock_owned())
            .await
            .map_err(|_| timeout)?;

        if self.session_lost.load(Ordering::SeqCst) {
            self.renew().await?;
        }

        let token = Uuid::new_v4().to_string();
        let mut renewed = false;
        loop {
            let session = self.session.read().await.clone();
            match self
                .store
                .try_lock(&session, name, &token, self.settings.session_ttl)
                .await?
            {
                LockAttempt::Acquired => {
                    debug!(lock = name, "mutex acquired");
                    return Ok(LockGuard {
                        store: Arc::clone(&self.store),
                        name: name.to_string(),
                        token,
                        armed: true,
                        _local: local,
                    });
                }
                LockAttempt::Held => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout {
                            operation: "lock",
                            after: self.settings.lock_timeout,
                        });
                    }
                    tokio::time::sleep(self.settings.lock_retry_interval).await;
                }
                LockAttempt::SessionLost => {
                    if renewed {
                        return Err(Error::SessionLost);
                    }
                    warn!(lock = name, session = %session, "coordination session lost; renewing");
                    self.renew().await?;
                    renewed = true;
                }
            }
        }
    }

    /// Stop the keepalive task and revoke the session.
    pub async fn close(&self) {
        let handle = self
            .keepalive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        let session = self.session.read().await.clone();
        if let Err(e) = self.store.revoke_session(&session).await {
            warn!(session = %session, error = %e, "failed to revoke coordination session");
        }
    }
}

impl Drop for LeaderCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self
            .keepalive
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Held store mutex. Call [`LockGuard::release`]; if the guard is dropped
/// instead, the unlock is spawned onto the runtime.
pub struct LockGuard {
    store: Arc<dyn DistributedStore>,
    name: String,
    token: String,
    armed: bool,
    _local: OwnedMutexGuard<()>,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    pub async fn release(mut self) -> Result<()> {
        self.armed = false;
        self.store.unlock(&self.name, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = Arc::clone(&self.store);
        let name = std::mem::take(&mut self.name);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.unlock(&name, &token).await {
                        warn!(lock = %name, error = %e, "deferred unlock failed; lock lapses with its TTL");
                    }
                });
            }
            Err(_) => warn!(lock = %name, "lock dropped outside a runtime; it lapses with its TTL"),
        }
    }
}
