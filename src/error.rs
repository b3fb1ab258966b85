use thiserror::Error;

/// Constellation-specific error types for better error handling
#[derive(Error, Debug)]
pub enum ConstellationError {
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("Consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("Scheduling error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Service mesh error: {0}")]
    Mesh(#[from] MeshError),

    #[error("Monitoring error: {0}")]
    Monitoring(#[from] MonitoringError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Invalid parameter: {reason}")]
    InvalidParameter { reason: String },

    #[error("Timed out waiting for {what}")]
    Timeout { what: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization error: {0}")]
    Serialization(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found at path: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format: {reason}")]
    InvalidFormat { reason: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: String },

    #[error("Node already registered: {node_id}")]
    NodeAlreadyExists { node_id: String },

    #[error("Cluster is not running")]
    NotRunning,

    #[error("Node registry is full (capacity {capacity})")]
    RegistryFull { capacity: usize },
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("Bad magic number: {got:#010x}")]
    BadMagic { got: u32 },

    #[error("Unsupported protocol version: {got}")]
    BadVersion { got: u16 },

    #[error("Unknown message kind: {code}")]
    UnknownKind { code: u32 },

    #[error("Frame too short: need {need} bytes, got {got}")]
    ShortFrame { need: usize, got: usize },
}

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Consensus is not running")]
    NotRunning,

    #[error("Peer not found: {peer_id}")]
    PeerNotFound { peer_id: String },
}

#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("No feasible node for placement request")]
    NoFeasibleNode,

    #[error("Node not registered with scheduler: {node_id}")]
    NodeNotRegistered { node_id: String },

    #[error("Insufficient resources on node: {node_id}")]
    InsufficientResources { node_id: String },

    #[error("Quota exceeded for namespace: {namespace}")]
    QuotaExceeded { namespace: String },

    #[error("Quota not found for namespace: {namespace}")]
    QuotaNotFound { namespace: String },

    #[error("Reservation not found: {reservation_id}")]
    ReservationNotFound { reservation_id: String },
}

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Service not found: {service_id}")]
    ServiceNotFound { service_id: String },

    #[error("No healthy endpoint available for service: {service}")]
    NoEndpoint { service: String },

    #[error("Circuit breaker not found: {name}")]
    CircuitNotFound { name: String },
}

#[derive(Error, Debug)]
pub enum MonitoringError {
    #[error("Metric not found: {name}")]
    MetricNotFound { name: String },

    #[error("Percentile out of range: {value}")]
    PercentileOutOfRange { value: f64 },

    #[error("Alert rule not found: {name}")]
    AlertRuleNotFound { name: String },

    #[error("Notification channel not found: {name}")]
    ChannelNotFound { name: String },

    #[error("Scaling policy not found: {name}")]
    PolicyNotFound { name: String },
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock not found: {lock_id}")]
    LockNotFound { lock_id: String },

    #[error("Lock on {resource} is held in a conflicting mode")]
    Conflict { resource: String },
}

/// Convenience type alias for Constellation results
pub type Result<T, E = ConstellationError> = std::result::Result<T, E>;
