//! Persistence for agent records, container/schema metadata and the
//! per-agent resource-update queues.

use std::sync::Arc;

use async_trait::async_trait;
use fleet_common::{
    AgentRecord, ContainerInfo, ResourceUpdate, SchemaInfo, agent_queue_key, agent_schema_key,
    container_key, keys, validate_agent_id,
};
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{Compare, DistributedStore, Op, Txn};

/// Optimistic retries for a queue read-modify-write before giving up.
const QUEUE_CAS_ATTEMPTS: usize = 16;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn update_containers(&self, containers: &[ContainerInfo]) -> Result<()>;

    /// Upsert the given table schemas published by `agent_id`.
    async fn update_schemas(&self, agent_id: Uuid, schemas: &[SchemaInfo]) -> Result<()>;

    async fn get_agents(&self) -> Result<Vec<AgentRecord>>;

    /// Put `update` ahead of everything already queued for the agent.
    async fn add_to_front_of_agent_queue(&self, agent_id: &str, update: ResourceUpdate)
    -> Result<()>;

    /// Remove and return every queued update for the agent, front first.
    async fn get_from_agent_queue(&self, agent_id: &str) -> Result<Vec<ResourceUpdate>>;
}

/// [`MetadataStore`] kept in the same key-value store as the agent records.
pub struct KvMetadataStore {
    store: Arc<dyn DistributedStore>,
}

impl KvMetadataStore {
    #[must_use]
    pub fn new(store: Arc<dyn DistributedStore>) -> Self {
        Self { store }
    }

    fn parse_agent_id(agent_id: &str) -> Result<Uuid> {
        validate_agent_id(agent_id).map_err(|reason| Error::InvalidArgument(reason.to_string()))
    }

    fn decode_queue(key: &str, raw: Option<&str>) -> Result<Vec<ResourceUpdate>> {
        match raw {
            Some(json) => serde_json::from_str(json).map_err(|e| Error::codec(key, e)),
            None => Ok(Vec::new()),
        }
    }

    /// Precondition that `key` still holds exactly what was read.
    fn unchanged(key: &str, raw: Option<&String>) -> Compare {
        match raw {
            Some(value) => Compare::ValueEquals(key.to_string(), value.clone()),
            None => Compare::KeyMissing(key.to_string()),
        }
    }
}

#[async_trait]
impl MetadataStore for KvMetadataStore {
    async fn update_containers(&self, containers: &[ContainerInfo]) -> Result<()> {
        if containers.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(containers.len());
        for container in containers {
            let key = container_key(&container.uid);
            let json = serde_json::to_string(container).map_err(|e| Error::codec(&key, e))?;
            ops.push(Op::Put(key, json));
        }
        self.store.commit(Txn::new().then(ops)).await?;
        Ok(())
    }

    async fn update_schemas(&self, agent_id: Uuid, schemas: &[SchemaInfo]) -> Result<()> {
        if schemas.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(schemas.len());
        for schema in schemas {
            let key = agent_schema_key(&agent_id, &schema.name);
            let json = serde_json::to_string(schema).map_err(|e| Error::codec(&key, e))?;
            ops.push(Op::Put(key, json));
        }
        self.store.commit(Txn::new().then(ops)).await?;
        Ok(())
    }

    async fn get_agents(&self) -> Result<Vec<AgentRecord>> {
        let pairs = self.store.get_prefix(keys::AGENT).await?;

        let mut agents = Vec::with_capacity(pairs.len());
        for (key, json) in pairs {
            match serde_json::from_str::<AgentRecord>(&json) {
                Ok(record) => agents.push(record),
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping malformed agent record");
                }
            }
        }
        Ok(agents)
    }

    async fn add_to_front_of_agent_queue(
        &self,
        agent_id: &str,
        update: ResourceUpdate,
    ) -> Result<()> {
        let key = agent_queue_key(&Self::parse_agent_id(agent_id)?);

        for _ in 0..QUEUE_CAS_ATTEMPTS {
            let raw = self.store.get(&key).await?;
            let mut queue = Self::decode_queue(&key, raw.as_deref())?;
            queue.insert(0, update.clone());
            let json = serde_json::to_string(&queue).map_err(|e| Error::codec(&key, e))?;

            let txn = Txn::new()
                .when([Self::unchanged(&key, raw.as_ref())])
                .then([Op::Put(key.clone(), json)]);
            if self.store.commit(txn).await? {
                return Ok(());
            }
        }
        Err(Error::Conflict { key })
    }

    async fn get_from_agent_queue(&self, agent_id: &str) -> Result<Vec<ResourceUpdate>> {
        let key = agent_queue_key(&Self::parse_agent_id(agent_id)?);

        for _ in 0..QUEUE_CAS_ATTEMPTS {
            let Some(raw) = self.store.get(&key).await? else {
                return Ok(Vec::new());
            };
            let queue = Self::decode_queue(&key, Some(&raw))?;

            let txn = Txn::new()
                .when([Compare::ValueEquals(key.clone(), raw)])
                .then([Op::Delete(key.clone())]);
            if self.store.commit(txn).await? {
                return Ok(queue);
            }
        }
        Err(Error::Conflict { key })
    }
}
