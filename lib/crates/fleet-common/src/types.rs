use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Host a registered agent runs on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostInfo {
    pub hostname: String,
}

/// Stored form of an agent registration.
/// Persisted at `/agent/{agent_id}`; written only by the leader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentRecord {
    pub agent_id: Uuid,
    pub host_info: HostInfo,
    /// Wall-clock nanoseconds at registration.
    pub create_time_ns: i64,
    /// Wall-clock nanoseconds of the most recent heartbeat.
    pub last_heartbeat_ns: i64,
}

/// Plain value view of a live agent, as returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentInfo {
    pub agent_id: Uuid,
    pub hostname: String,
    pub create_time_ns: i64,
    pub last_heartbeat_ns: i64,
}

impl AgentInfo {
    /// Registration request for a new agent; timestamps are assigned by the
    /// control plane.
    #[must_use]
    pub fn new(agent_id: Uuid, hostname: impl Into<String>) -> Self {
        Self {
            agent_id,
            hostname: hostname.into(),
            create_time_ns: 0,
            last_heartbeat_ns: 0,
        }
    }
}

impl From<AgentRecord> for AgentInfo {
    fn from(record: AgentRecord) -> Self {
        Self {
            agent_id: record.agent_id,
            hostname: record.host_info.hostname,
            create_time_ns: record.create_time_ns,
            last_heartbeat_ns: record.last_heartbeat_ns,
        }
    }
}

/// Container observed by an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerInfo {
    pub uid: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_uid: Option<String>,
    #[serde(default)]
    pub namespace: String,
    pub start_timestamp_ns: i64,
    /// Zero while the container is still running.
    #[serde(default)]
    pub stop_timestamp_ns: i64,
}

/// Column type of a table an agent collects into
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Boolean,
    Int64,
    Uint128,
    Float64,
    String,
    Time64ns,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: DataType,
}

/// Schema of one table published by an agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaInfo {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

/// Container and schema deltas reported by an agent, applied asynchronously.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentUpdateInfo {
    #[serde(default)]
    pub containers: Vec<ContainerInfo>,
    #[serde(default)]
    pub schema: Vec<SchemaInfo>,
}

impl AgentUpdateInfo {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty() && self.schema.is_empty()
    }
}

/// Kind of cluster resource a queued update refers to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Namespace,
    Pod,
    Container,
    Service,
    Endpoints,
}

/// One pending resource update waiting to be delivered to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceUpdate {
    pub kind: ResourceKind,
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub resource_version: String,
    /// Set once the resource has been deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_timestamp_ns: Option<i64>,
}
