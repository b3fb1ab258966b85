use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle states of a managed compute instance.
///
/// The core never launches processes itself; it hands placements to an
/// external instance controller and tracks state through these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Created but not started
    Pending,
    /// Starting up
    Starting,
    /// Running normally
    Running,
    /// Shutting down
    Stopping,
    /// Stopped cleanly
    Stopped,
    /// Failed or crashed
    Failed,
    /// Unknown state
    Unknown,
}

/// Resource limits attached to an instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_percent: u32,
    pub ram_mb: u64,
    pub disk_mb: u64,
    pub network_mbps: u32,
}

/// Bookkeeping record for a placed instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub name: String,
    pub node_id: String,
    pub state: InstanceState,
    pub created_at_ms: u64,
    pub limits: ResourceLimits,
}

impl InstanceInfo {
    pub fn new(name: impl Into<String>, node_id: impl Into<String>, counter: u64) -> Self {
        let created_at_ms = now_ms();
        Self {
            id: format!("inst-{}-{}", created_at_ms, counter),
            name: name.into(),
            node_id: node_id.into(),
            state: InstanceState::Pending,
            created_at_ms,
            limits: ResourceLimits::default(),
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Seconds since the Unix epoch
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
