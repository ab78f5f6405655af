use serde::Deserialize;
use std::time::Duration;

/// Control-plane configuration, loaded from `FLEET_CP_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlPlaneConfig {
    /// HTTP listen address for health and agent listing (default: 0.0.0.0:8080)
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Valkey connection URL
    #[serde(default = "default_valkey_url")]
    pub valkey_url: String,

    /// ACL username for Valkey authentication
    #[serde(default)]
    pub valkey_user: Option<String>,

    /// Path to a file holding the ACL password (Docker secret)
    #[serde(default)]
    pub valkey_pass_file: Option<String>,

    /// CA certificate for Valkey mTLS. TLS is enabled only when the CA,
    /// client certificate and client key are all set.
    #[serde(default)]
    pub valkey_ca: Option<String>,

    #[serde(default)]
    pub valkey_client_cert: Option<String>,

    #[serde(default)]
    pub valkey_client_key: Option<String>,

    /// Whether this replica holds leadership. Leader election is external;
    /// followers serve reads and no-op on writes.
    #[serde(default)]
    pub leader: bool,

    /// TTL of the coordination session lease
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Upper bound on waiting for the update mutex
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Deadline applied to every store round trip
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Interval between staleness sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Attempts before an update is dead-lettered (unset: retry forever)
    #[serde(default)]
    pub update_max_attempts: Option<u32>,

    #[serde(default = "default_update_backoff_initial_ms")]
    pub update_backoff_initial_ms: u64,

    #[serde(default = "default_update_backoff_max_ms")]
    pub update_backoff_max_ms: u64,
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_valkey_url() -> String {
    "redis://valkey:6379".to_string()
}

fn default_session_ttl_secs() -> u64 {
    10
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_update_backoff_initial_ms() -> u64 {
    100
}

fn default_update_backoff_max_ms() -> u64 {
    5_000
}

impl ControlPlaneConfig {
    #[must_use]
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    #[must_use]
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.sweep_interval_secs == 0 {
            return Err("sweep_interval_secs must be greater than zero");
        }
        if self.session_ttl_secs == 0 {
            return Err("session_ttl_secs must be greater than zero");
        }
        Ok(())
    }

    /// Paths for Valkey mTLS, when fully configured.
    #[must_use]
    pub fn valkey_tls_paths(&self) -> Option<(&str, &str, &str)> {
        match (
            &self.valkey_ca,
            &self.valkey_client_cert,
            &self.valkey_client_key,
        ) {
            (Some(ca), Some(cert), Some(key)) => Some((ca, cert, key)),
            _ => None,
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            valkey_url: default_valkey_url(),
            valkey_user: None,
            valkey_pass_file: None,
            valkey_ca: None,
            valkey_client_cert: None,
            valkey_client_key: None,
            leader: false,
            session_ttl_secs: default_session_ttl_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            update_max_attempts: None,
            update_backoff_initial_ms: default_update_backoff_initial_ms(),
            update_backoff_max_ms: default_update_backoff_max_ms(),
        }
    }
}
