//! Agent registration, liveness and update propagation.
//!
//! Every write to the agent record / hostname index pair happens on the
//! leader, inside the `/updateAgent` store mutex. Followers return `Ok` from
//! the leader-gated operations without touching the store.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use fleet_common::liveness::AGENT_EXPIRATION_TIMEOUT_NS;
use fleet_common::{
    AgentInfo, AgentRecord, AgentUpdateInfo, HostInfo, ResourceUpdate, agent_data_prefix,
    agent_key, hostname_agent_key, keys, validate_hostname,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::coordinator::{CoordinatorSettings, LeaderCoordinator};
use crate::error::{Error, Result};
use crate::leadership::LeaderSignal;
use crate::metadata::MetadataStore;
use crate::processor::{DeadLetter, RetryPolicy, UpdateMessage, UpdateProcessor};
use crate::store::{Compare, DistributedStore, Op, Txn};

#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
    pub coordinator: CoordinatorSettings,
    pub retry: RetryPolicy,
}

pub struct AgentManager {
    store: Arc<dyn DistributedStore>,
    mds: Arc<dyn MetadataStore>,
    coordinator: LeaderCoordinator,
    leader: LeaderSignal,
    clock: Arc<dyn Clock>,
    updates: Mutex<Option<mpsc::Sender<UpdateMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dead_letters: Mutex<Option<mpsc::Receiver<DeadLetter>>>,
}

impl AgentManager {
    /// Open the coordination session and start the update worker.
    pub async fn new(
        store: Arc<dyn DistributedStore>,
        mds: Arc<dyn MetadataStore>,
        leader: LeaderSignal,
        settings: ManagerSettings,
    ) -> Result<Self> {
        Self::with_clock(store, mds, leader, settings, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(
        store: Arc<dyn DistributedStore>,
        mds: Arc<dyn MetadataStore>,
        leader: LeaderSignal,
        settings: ManagerSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let coordinator = LeaderCoordinator::connect(Arc::clone(&store), settings.coordinator).await?;
        let processor = UpdateProcessor::spawn(Arc::clone(&mds), settings.retry);

        Ok(Self {
            store,
            mds,
            coordinator,
            leader,
            clock,
            updates: Mutex::new(Some(processor.sender)),
            worker: Mutex::new(Some(processor.task)),
            dead_letters: Mutex::new(Some(processor.dead_letters)),
        })
    }

    #[must_use]
    pub fn coordinator(&self) -> &LeaderCoordinator {
        &self.coordinator
    }

    /// Register an agent. The newest registration for a hostname wins: any
    /// agent already holding `info.hostname` is evicted first.
    pub async fn create_agent(&self, info: &AgentInfo) -> Result<()> {
        if self.skip_as_follower("create_agent") {
            return Ok(());
        }
        if info.agent_id.is_nil() {
            return Err(Error::InvalidArgument("agent id must not be nil".to_string()));
        }
        validate_hostname(&info.hostname)
            .map_err(|reason| Error::InvalidArgument(reason.to_string()))?;

        let agent_id = info.agent_id;
        let record_key = agent_key(&agent_id);
        let index_key = hostname_agent_key(&info.hostname);

        if self.store.get(&record_key).await?.is_some() {
            return Err(Error::AlreadyExists(agent_id));
        }

        if let Some(owner) = self.store.get(&index_key).await? {
            self.release_hostname(&info.hostname, &owner).await?;
        }

        let now = self.clock.now_nanos();
        let record = AgentRecord {
            agent_id,
            host_info: HostInfo {
                hostname: info.hostname.clone(),
            },
            create_time_ns: now,
            last_heartbeat_ns: now,
        };
        let json = serde_json::to_string(&record).map_err(|e| Error::codec(&record_key, e))?;

        let txn = Txn::new()
            .when([
                Compare::KeyMissing(index_key.clone()),
                Compare::KeyMissing(record_key.clone()),
            ])
            .then([
                Op::Put(index_key.clone(), agent_id.to_string()),
                Op::Put(record_key, json),
            ]);

        if !self.locked(self.store.commit(txn)).await? {
            warn!(agent_id = %agent_id, hostname = %info.hostname, "registration lost a race");
            return Err(Error::Conflict { key: index_key });
        }

        info!(agent_id = %agent_id, hostname = %info.hostname, "agent registered");
        Ok(())
    }

    /// Record a heartbeat. The stored time never moves backwards and always
    /// advances by at least one nanosecond.
    pub async fn update_heartbeat(&self, agent_id: Uuid) -> Result<()> {
        if self.skip_as_follower("update_heartbeat") {
            return Ok(());
        }
        let key = agent_key(&agent_id);

        self.locked(async {
            let raw = self
                .store
                .get(&key)
                .await?
                .ok_or(Error::NotFound(agent_id))?;
            let mut record: AgentRecord =
                serde_json::from_str(&raw).map_err(|e| Error::codec(&key, e))?;

            let now = self.clock.now_nanos();
            record.last_heartbeat_ns = now.max(record.last_heartbeat_ns.saturating_add(1));

            let json = serde_json::to_string(&record).map_err(|e| Error::codec(&key, e))?;
            self.store.put(&key, &json).await?;
            debug!(agent_id = %agent_id, heartbeat_ns = record.last_heartbeat_ns, "heartbeat recorded");
            Ok(())
        })
        .await
    }

    /// Reserved for agent-reported schema info; accepted and ignored.
    #[allow(clippy::unused_async)]
    pub async fn update_agent(&self, info: &AgentInfo) -> Result<()> {
        debug!(agent_id = %info.agent_id, "update_agent ignored");
        Ok(())
    }

    /// Evict every agent whose last heartbeat is older than the expiration
    /// timeout and return their ids.
    ///
    /// One failed eviction does not stop the sweep; the first error is
    /// returned once every stale agent has been tried.
    pub async fn update_agent_state(&self) -> Result<Vec<Uuid>> {
        if self.skip_as_follower("update_agent_state") {
            return Ok(Vec::new());
        }

        let now = self.clock.now_nanos();
        let agents = self.mds.get_agents().await?;

        let mut evicted = Vec::new();
        let mut first_error = None;
        for record in agents {
            let silent_for = now.saturating_sub(record.last_heartbeat_ns);
            if silent_for <= AGENT_EXPIRATION_TIMEOUT_NS {
                continue;
            }
            match self.evict(record.agent_id, &record.host_info.hostname).await {
                Ok(()) => {
                    info!(
                        agent_id = %record.agent_id,
                        hostname = %record.host_info.hostname,
                        silent_for_ms = silent_for / 1_000_000,
                        "expired agent evicted"
                    );
                    evicted.push(record.agent_id);
                }
                Err(e) => {
                    warn!(agent_id = %record.agent_id, error = %e, "failed to evict expired agent");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(evicted),
        }
    }

    /// Every registered agent. Not serialized with writers.
    pub async fn get_active_agents(&self) -> Result<Vec<AgentInfo>> {
        let records = self.mds.get_agents().await?;
        Ok(records.into_iter().map(AgentInfo::from).collect())
    }

    pub async fn add_to_front_of_agent_queue(
        &self,
        agent_id: &str,
        update: ResourceUpdate,
    ) -> Result<()> {
        self.mds.add_to_front_of_agent_queue(agent_id, update).await
    }

    pub async fn get_from_agent_queue(&self, agent_id: &str) -> Result<Vec<ResourceUpdate>> {
        self.mds.get_from_agent_queue(agent_id).await
    }

    /// Hand an update to the worker, waiting while it is busy. Updates with
    /// no containers and no schemas are dropped here.
    pub async fn add_to_update_queue(&self, agent_id: Uuid, update: AgentUpdateInfo) -> Result<()> {
        let sender = self
            .updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::UpdateProcessorStopped)?;

        if update.is_empty() {
            debug!(agent_id = %agent_id, "empty agent update skipped");
            return Ok(());
        }

        sender
            .send(UpdateMessage { agent_id, update })
            .await
            .map_err(|_| Error::UpdateProcessorStopped)
    }

    /// Receiver for updates the worker gave up on. Handed out once.
    pub fn take_dead_letters(&self) -> Option<mpsc::Receiver<DeadLetter>> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Stop accepting updates, wait for the worker to drain and revoke the
    /// coordination session.
    pub async fn shutdown(&self) {
        drop(
            self.updates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            error!(error = %e, "update processor task failed");
        }
        self.coordinator.close().await;
        info!("agent manager stopped");
    }

    fn skip_as_follower(&self, operation: &'static str) -> bool {
        if self.leader.is_leader() {
            return false;
        }
        debug!(operation, "not the leader; skipping");
        true
    }

    /// Run `work` while holding the update mutex. `work` is not polled until
    /// the mutex is held.
    async fn locked<T, F>(&self, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let guard = self.coordinator.lock(keys::UPDATE_LOCK).await?;
        let result = work.await;
        if let Err(e) = guard.release().await {
            warn!(error = %e, "failed to release update lock; it lapses with the session");
        }
        result
    }

    /// Free `hostname` from its current owner, whose id is `owner` as stored
    /// in the hostname index.
    async fn release_hostname(&self, hostname: &str, owner: &str) -> Result<()> {
        if let Ok(owner_id) = Uuid::parse_str(owner) {
            info!(agent_id = %owner_id, hostname = %hostname, "hostname taken over; evicting previous agent");
            return self.evict(owner_id, hostname).await;
        }

        warn!(hostname = %hostname, owner = %owner, "dropping malformed hostname index entry");
        let index_key = hostname_agent_key(hostname);
        let txn = Txn::new()
            .when([Compare::ValueEquals(index_key.clone(), owner.to_string())])
            .then([Op::Delete(index_key)]);
        self.locked(self.store.commit(txn)).await?;
        Ok(())
    }

    /// Delete the agent record and its per-agent data in one transaction.
    /// The hostname index entry goes too, but only while it still names this
    /// agent; a newer claim on the hostname is left alone.
    async fn evict(&self, agent_id: Uuid, hostname: &str) -> Result<()> {
        let record_key = agent_key(&agent_id);
        let index_key = hostname_agent_key(hostname);
        let data_prefix = agent_data_prefix(&agent_id);

        let txn = Txn::new()
            .when([Compare::ValueEquals(index_key.clone(), agent_id.to_string())])
            .then([
                Op::Delete(record_key.clone()),
                Op::Delete(index_key),
                Op::DeletePrefix(data_prefix.clone()),
            ])
            .or_else([Op::Delete(record_key), Op::DeletePrefix(data_prefix)]);

        let index_cleared = self.locked(self.store.commit(txn)).await?;
        if !index_cleared {
            debug!(agent_id = %agent_id, hostname = %hostname, "hostname index already reclaimed; kept");
        }
        Ok(())
    }
}
