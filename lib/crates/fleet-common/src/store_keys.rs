use uuid::Uuid;

/// Key prefixes and fixed keys of the control-plane store layout.
pub mod keys {
    /// Agent records
    /// Format: /agent/{agent_id}
    /// Value: JSON-serialized AgentRecord
    pub const AGENT: &str = "/agent/";

    /// Hostname index (secondary key enforcing one live agent per hostname)
    /// Format: /hostname/{hostname}/agent
    /// Value: agent_id as a hyphenated UUID string
    pub const HOSTNAME: &str = "/hostname/";

    /// Per-agent data: resource-update queue and schemas.
    /// Format: /agents/{agent_id}/...
    /// Everything under this prefix is deleted when the agent is evicted.
    pub const AGENT_DATA: &str = "/agents/";

    /// Container metadata reported by agents
    /// Format: /containers/{uid}/info
    /// Value: JSON-serialized ContainerInfo
    pub const CONTAINERS: &str = "/containers/";

    /// Name of the store-backed mutex guarding agent record writes.
    pub const UPDATE_LOCK: &str = "/updateAgent";
}

/// Liveness constants
pub mod liveness {
    /// How long an agent may go without a heartbeat before the sweep evicts it
    /// (60 seconds, in nanoseconds).
    pub const AGENT_EXPIRATION_TIMEOUT_NS: i64 = 60 * 1_000_000_000;
}

/// Longest hostname accepted (RFC 1035 limit on a full domain name).
pub const MAX_HOSTNAME_LEN: usize = 253;

pub fn agent_key(agent_id: &Uuid) -> String {
    format!("{}{}", keys::AGENT, agent_id)
}

pub fn hostname_agent_key(hostname: &str) -> String {
    format!("{}{}/agent", keys::HOSTNAME, hostname)
}

/// Prefix shared by every per-agent key; prefix-deleted on eviction.
pub fn agent_data_prefix(agent_id: &Uuid) -> String {
    format!("{}{}/", keys::AGENT_DATA, agent_id)
}

pub fn agent_queue_key(agent_id: &Uuid) -> String {
    format!("{}updates", agent_data_prefix(agent_id))
}

pub fn agent_schema_prefix(agent_id: &Uuid) -> String {
    format!("{}schema/", agent_data_prefix(agent_id))
}

pub fn agent_schema_key(agent_id: &Uuid, table: &str) -> String {
    format!("{}{}", agent_schema_prefix(agent_id), table)
}

pub fn container_key(uid: &str) -> String {
    format!("{}{}/info", keys::CONTAINERS, uid)
}

/// Parse an agent identifier received as a string.
/// SECURITY: Always call before constructing store keys from untrusted input.
/// Keys are always built from the parsed value, never from the raw string, so
/// the derived key cannot escape the `/agents/{agent_id}/` namespace.
pub fn validate_agent_id(agent_id: &str) -> Result<Uuid, &'static str> {
    let id = Uuid::parse_str(agent_id).map_err(|_| "agent_id must be a UUID")?;
    if id.is_nil() {
        return Err("agent_id must not be the nil UUID");
    }
    Ok(id)
}

/// Validate a hostname before it is embedded in the hostname index key.
/// Rejects path separators and glob metacharacters, which would otherwise let
/// one hostname's key collide with, or pattern-match, another's.
pub fn validate_hostname(hostname: &str) -> Result<(), &'static str> {
    if hostname.is_empty() {
        return Err("hostname must not be empty");
    }
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err("hostname must be at most 253 bytes");
    }
    if hostname
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '*' | '?' | '[' | ']' | '\\'))
    {
        return Err("hostname contains a forbidden character");
    }
    Ok(())
}
