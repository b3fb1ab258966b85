use crate::types::now_ms;
use serde::{Deserialize, Serialize};

/// SWIM membership states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Node is healthy
    Alive,
    /// Node might be dead (missed heartbeats)
    Suspect,
    /// Node is confirmed dead
    Dead,
    /// Node gracefully left the cluster
    Left,
}

impl NodeState {
    /// Stable wire code for the fixed node record layout
    pub fn wire_code(self) -> u32 {
        match self {
            NodeState::Alive => 0,
            NodeState::Suspect => 1,
            NodeState::Dead => 2,
            NodeState::Left => 3,
        }
    }

    pub fn from_wire_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(NodeState::Alive),
            1 => Some(NodeState::Suspect),
            2 => Some(NodeState::Dead),
            3 => Some(NodeState::Left),
            _ => None,
        }
    }

    /// Valid membership transitions: ALIVE→SUSPECT→{ALIVE, DEAD}, any→LEFT.
    /// Re-asserting the current state is always allowed.
    pub fn can_transition_to(self, next: NodeState) -> bool {
        if self == next || next == NodeState::Left {
            return true;
        }
        matches!(
            (self, next),
            (NodeState::Alive, NodeState::Suspect)
                | (NodeState::Suspect, NodeState::Alive)
                | (NodeState::Suspect, NodeState::Dead)
        )
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeState::Alive => "ALIVE",
            NodeState::Suspect => "SUSPECT",
            NodeState::Dead => "DEAD",
            NodeState::Left => "LEFT",
        };
        write!(f, "{name}")
    }
}

/// Cluster member metadata plus its resource vector.
///
/// Identity is `node_id = "{name}@{address}"`; everything else is mutable
/// through gossip and SWIM receipt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub state: NodeState,
    pub last_seen_ms: u64,
    /// Incarnation number, bumped by the owner to refute suspicion
    pub incarnation: u64,
    pub failed_pings: i32,

    pub max_instances: u32,
    pub current_instances: u32,

    pub cpu_total: f64,
    pub cpu_available: f64,
    pub ram_total_mb: u64,
    pub ram_available_mb: u64,
}

impl Node {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let name = name.into();
        let address = address.into();
        Self {
            id: node_id(&name, &address),
            name,
            address,
            port,
            state: NodeState::Alive,
            last_seen_ms: now_ms(),
            incarnation: 0,
            failed_pings: 0,
            max_instances: 0,
            current_instances: 0,
            cpu_total: 0.0,
            cpu_available: 0.0,
            ram_total_mb: 0,
            ram_available_mb: 0,
        }
    }

    /// Local-node constructor that fills the resource vector from the host
    pub fn local(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let cpus = num_cpus::get() as f64;
        let mut node = Self::new(name, address, port);
        node.cpu_total = cpus;
        node.cpu_available = cpus;
        node
    }

    /// Refresh the mutable fields from a newer view without reidentifying
    pub fn apply_update(&mut self, other: &Node) {
        self.state = other.state;
        self.last_seen_ms = other.last_seen_ms;
        self.incarnation = other.incarnation;
        self.failed_pings = other.failed_pings;
        self.current_instances = other.current_instances;
        self.cpu_available = other.cpu_available;
        self.ram_available_mb = other.ram_available_mb;
    }

    pub fn mark_seen(&mut self) {
        self.last_seen_ms = now_ms();
    }

    /// Bump incarnation to refute a stale suspicion claim about this node
    pub fn refute_suspicion(&mut self) {
        self.incarnation += 1;
        self.state = NodeState::Alive;
        self.failed_pings = 0;
        self.mark_seen();
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Node identity derived from name and address
pub fn node_id(name: &str, address: &str) -> String {
    format!("{name}@{address}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_is_name_at_address() {
        let node = Node::new("alpha", "10.0.0.1", 7946);
        assert_eq!(node.id, "alpha@10.0.0.1");
        assert_eq!(node.state, NodeState::Alive);
    }

    #[test]
    fn refute_bumps_incarnation_and_restores_alive() {
        let mut node = Node::new("alpha", "10.0.0.1", 7946);
        node.state = NodeState::Suspect;
        node.failed_pings = 2;
        let before = node.incarnation;

        node.refute_suspicion();
        assert_eq!(node.state, NodeState::Alive);
        assert_eq!(node.incarnation, before + 1);
        assert_eq!(node.failed_pings, 0);
    }

    #[test]
    fn membership_transitions_follow_swim_lattice() {
        use NodeState::*;
        assert!(Alive.can_transition_to(Suspect));
        assert!(Suspect.can_transition_to(Alive));
        assert!(Suspect.can_transition_to(Dead));
        assert!(Dead.can_transition_to(Left));
        assert!(!Alive.can_transition_to(Dead));
        assert!(!Dead.can_transition_to(Alive));
        assert!(!Left.can_transition_to(Suspect));
    }
}
