pub mod config;
pub mod store_keys;
pub mod types;

pub use config::ControlPlaneConfig;
pub use store_keys::{
    agent_data_prefix, agent_key, agent_queue_key, agent_schema_key, agent_schema_prefix,
    container_key, hostname_agent_key, keys, liveness, validate_agent_id, validate_hostname,
};
pub use types::*;
