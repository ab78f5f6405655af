//! Fleet control plane: agent registration, liveness tracking and
//! asynchronous metadata updates over a shared key-value store.

pub mod clock;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod leadership;
pub mod manager;
pub mod metadata;
pub mod processor;
pub mod store;

pub use error::{Error, Result};
pub use manager::{AgentManager, ManagerSettings};
