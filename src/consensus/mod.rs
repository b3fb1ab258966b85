//! Simplified Raft consensus for leader election.
//!
//! Terms, votes, and heartbeats only — no log replication. Safety is limited
//! to at-most-one-leader-per-term: a vote is granted at most once per term and
//! any observed higher term forces an immediate step-down.
//!
//! Based on "In Search of an Understandable Consensus Algorithm"
//! (Ongaro & Ousterhout, 2014).

use crate::cluster::wire::{
    Message, MessageKind, RaftHeartbeatPayload, RequestVotePayload, VoteReplyPayload,
};
use crate::config::ConsensusConfig;
use crate::types::now_ms;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info};

/// Raft roles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

/// Outbound consensus frame: destination address plus the encoded message
pub type RaftOutbound = mpsc::UnboundedSender<(String, Message)>;

/// Election timer poll granularity
const TIMER_POLL_MS: u64 = 25;

#[derive(Debug)]
struct RaftState {
    role: RaftRole,
    current_term: u64,
    voted_for: Option<String>,
    current_leader_id: Option<String>,

    // No log in this implementation; the markers stay at zero
    log_index: u64,
    log_term: u64,
    commit_index: u64,

    last_heartbeat_ms: u64,
    election_timeout_ms: u64,
    votes_received: usize,

    /// peer_id -> control address
    peers: HashMap<String, String>,
    /// Leader bookkeeping, reset on every election win
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,

    elections_started: u64,
}

/// Snapshot of consensus state for status surfaces
#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub role: RaftRole,
    pub current_term: u64,
    pub leader_id: Option<String>,
    pub peer_count: usize,
    pub elections_started: u64,
}

/// One node's Raft-lite participant
pub struct RaftNode {
    node_id: String,
    config: ConsensusConfig,
    state: Arc<Mutex<RaftState>>,
    outbound: RaftOutbound,
    shutdown: watch::Receiver<bool>,
}

impl RaftNode {
    pub fn new(
        node_id: impl Into<String>,
        config: ConsensusConfig,
        outbound: RaftOutbound,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let node_id = node_id.into();
        let timeout = random_election_timeout(&config);
        info!("🗳️ Raft node {} initialized as FOLLOWER", node_id);
        Self {
            node_id,
            config,
            state: Arc::new(Mutex::new(RaftState {
                role: RaftRole::Follower,
                current_term: 0,
                voted_for: None,
                current_leader_id: None,
                log_index: 0,
                log_term: 0,
                commit_index: 0,
                last_heartbeat_ms: now_ms(),
                election_timeout_ms: timeout,
                votes_received: 0,
                peers: HashMap::new(),
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                elections_started: 0,
            })),
            outbound,
            shutdown,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn add_peer(&self, peer_id: impl Into<String>, address: impl Into<String>) {
        let peer_id = peer_id.into();
        let mut state = self.state.lock().await;
        if state.peers.insert(peer_id.clone(), address.into()).is_none() {
            debug!("raft peer added: {} ({} total)", peer_id, state.peers.len());
        }
    }

    pub async fn remove_peer(&self, peer_id: &str) {
        let mut state = self.state.lock().await;
        state.peers.remove(peer_id);
        state.next_index.remove(peer_id);
        state.match_index.remove(peer_id);
    }

    pub async fn role(&self) -> RaftRole {
        self.state.lock().await.role
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == RaftRole::Leader
    }

    pub async fn current_term(&self) -> u64 {
        self.state.lock().await.current_term
    }

    pub async fn leader_id(&self) -> Option<String> {
        self.state.lock().await.current_leader_id.clone()
    }

    pub async fn status(&self) -> RaftStatus {
        let state = self.state.lock().await;
        RaftStatus {
            role: state.role,
            current_term: state.current_term,
            leader_id: state.current_leader_id.clone(),
            peer_count: state.peers.len(),
            elections_started: state.elections_started,
        }
    }

    /// Spawn the election timer, the leader heartbeat emitter, and the
    /// inbound dispatcher.
    pub fn start(self: &Arc<Self>, mut inbound: mpsc::UnboundedReceiver<(Message, SocketAddr)>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            debug!("raft election timer started");
            let mut interval = tokio::time::interval(Duration::from_millis(TIMER_POLL_MS));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                node.election_tick().await;
            }
            debug!("raft election timer stopped");
        });

        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            debug!("raft heartbeat emitter started");
            let mut interval =
                tokio::time::interval(Duration::from_millis(node.config.heartbeat_interval_ms));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
                node.emit_heartbeats().await;
            }
            debug!("raft heartbeat emitter stopped");
        });

        let node = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = inbound.recv() => {
                        match received {
                            Some((msg, from)) => node.process_message(msg, from).await,
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
                if *shutdown.borrow() {
                    break;
                }
            }
        });
    }

    /// One election-timer check: followers and candidates campaign when the
    /// randomized timeout elapses without a heartbeat.
    pub async fn election_tick(&self) {
        let should_campaign = {
            let state = self.state.lock().await;
            state.role != RaftRole::Leader
                && now_ms().saturating_sub(state.last_heartbeat_ms) >= state.election_timeout_ms
        };
        if should_campaign {
            self.start_election().await;
        }
    }

    /// Transition to CANDIDATE and broadcast vote requests
    pub async fn start_election(&self) {
        let (request, targets) = {
            let mut state = self.state.lock().await;
            state.current_term += 1;
            state.role = RaftRole::Candidate;
            state.voted_for = Some(self.node_id.clone());
            state.current_leader_id = None;
            state.votes_received = 1;
            state.elections_started += 1;
            state.last_heartbeat_ms = now_ms();
            state.election_timeout_ms = random_election_timeout(&self.config);

            info!(
                "🗳️ {} starting election for term {}",
                self.node_id, state.current_term
            );

            let request = RequestVotePayload {
                term: state.current_term,
                candidate_id: self.node_id.clone(),
                last_log_index: state.log_index,
                last_log_term: state.log_term,
            };
            let targets: Vec<String> = state.peers.values().cloned().collect();

            // Single-node cluster wins immediately
            if state.peers.is_empty() {
                drop(state);
                self.become_leader().await;
                return;
            }
            (request, targets)
        };

        let msg = Message::new(MessageKind::RequestVote, &self.node_id, request.encode());
        for target in targets {
            let _ = self.outbound.send((target, msg.clone()));
        }
    }

    /// Handle one inbound consensus frame, emitting any reply over `outbound`
    pub async fn process_message(&self, msg: Message, from: SocketAddr) {
        match msg.kind {
            MessageKind::RequestVote => {
                if let Ok(request) = RequestVotePayload::decode(&msg.payload) {
                    let reply = self.handle_request_vote(&request).await;
                    let reply_msg = Message::new(
                        MessageKind::RequestVoteReply,
                        &self.node_id,
                        reply.encode(),
                    );
                    let _ = self.outbound.send((from.to_string(), reply_msg));
                }
            }
            MessageKind::RequestVoteReply => {
                if let Ok(reply) = VoteReplyPayload::decode(&msg.payload) {
                    self.handle_vote_reply(&reply).await;
                }
            }
            MessageKind::RaftHeartbeat => {
                if let Ok(request) = RaftHeartbeatPayload::decode(&msg.payload) {
                    let reply = self.handle_heartbeat(&request).await;
                    let reply_msg = Message::new(
                        MessageKind::RaftHeartbeatReply,
                        &self.node_id,
                        reply.encode(),
                    );
                    let _ = self.outbound.send((from.to_string(), reply_msg));
                }
            }
            MessageKind::RaftHeartbeatReply => {
                if let Ok(reply) = VoteReplyPayload::decode(&msg.payload) {
                    // Only the term matters: a newer one dethrones us
                    self.observe_term(reply.term).await;
                }
            }
            _ => {}
        }
    }

    /// Vote granting: term must be current or newer, one vote per term,
    /// candidate log at least as up-to-date (trivially true without a log).
    pub async fn handle_request_vote(&self, request: &RequestVotePayload) -> VoteReplyPayload {
        let mut state = self.state.lock().await;

        if request.term > state.current_term {
            step_down(&mut state, request.term, &self.config);
        }

        let log_ok = request.last_log_term > state.log_term
            || (request.last_log_term == state.log_term
                && request.last_log_index >= state.log_index);

        let grant = request.term >= state.current_term
            && state
                .voted_for
                .as_ref()
                .map(|v| v == &request.candidate_id)
                .unwrap_or(true)
            && log_ok;

        if grant {
            state.voted_for = Some(request.candidate_id.clone());
            state.last_heartbeat_ms = now_ms();
            info!(
                "✅ {} granted vote to {} (term {})",
                self.node_id, request.candidate_id, request.term
            );
        }

        VoteReplyPayload {
            term: state.current_term,
            vote_granted: grant,
        }
    }

    async fn handle_vote_reply(&self, reply: &VoteReplyPayload) {
        let won = {
            let mut state = self.state.lock().await;
            if reply.term > state.current_term {
                step_down(&mut state, reply.term, &self.config);
                return;
            }
            if state.role != RaftRole::Candidate || reply.term < state.current_term {
                return;
            }
            if !reply.vote_granted {
                return;
            }
            state.votes_received += 1;
            let cluster_size = state.peers.len() + 1;
            state.votes_received >= cluster_size / 2 + 1
        };
        if won {
            self.become_leader().await;
        }
    }

    /// Leader heartbeat receipt: adopt newer terms, accept the current
    /// leader, reset the election timer.
    pub async fn handle_heartbeat(&self, request: &RaftHeartbeatPayload) -> VoteReplyPayload {
        let mut state = self.state.lock().await;

        if request.term > state.current_term {
            step_down(&mut state, request.term, &self.config);
        }

        if request.term == state.current_term {
            state.current_leader_id = Some(request.leader_id.clone());
            state.last_heartbeat_ms = now_ms();
            if state.role == RaftRole::Candidate {
                state.role = RaftRole::Follower;
            }
            VoteReplyPayload {
                term: state.current_term,
                vote_granted: true,
            }
        } else {
            VoteReplyPayload {
                term: state.current_term,
                vote_granted: false,
            }
        }
    }

    async fn observe_term(&self, term: u64) {
        let mut state = self.state.lock().await;
        if term > state.current_term {
            step_down(&mut state, term, &self.config);
        }
    }

    async fn become_leader(&self) {
        let (term, targets) = {
            let mut state = self.state.lock().await;
            if state.role == RaftRole::Leader {
                return;
            }
            state.role = RaftRole::Leader;
            state.current_leader_id = Some(self.node_id.clone());

            let next = state.log_index + 1;
            let peer_ids: Vec<String> = state.peers.keys().cloned().collect();
            for peer in peer_ids {
                state.next_index.insert(peer.clone(), next);
                state.match_index.insert(peer, 0);
            }

            info!(
                "👑 {} became LEADER for term {}",
                self.node_id, state.current_term
            );
            (state.current_term, state.peers.values().cloned().collect::<Vec<_>>())
        };

        // Immediate heartbeat asserts leadership before the emitter's next tick
        self.send_heartbeats(term, targets).await;
    }

    async fn emit_heartbeats(&self) {
        let (term, targets) = {
            let state = self.state.lock().await;
            if state.role != RaftRole::Leader {
                return;
            }
            (state.current_term, state.peers.values().cloned().collect::<Vec<_>>())
        };
        self.send_heartbeats(term, targets).await;
    }

    async fn send_heartbeats(&self, term: u64, targets: Vec<String>) {
        let payload = {
            let state = self.state.lock().await;
            RaftHeartbeatPayload {
                term,
                leader_id: self.node_id.clone(),
                prev_log_index: state.log_index,
                prev_log_term: state.log_term,
                leader_commit: state.commit_index,
            }
        };
        let msg = Message::new(MessageKind::RaftHeartbeat, &self.node_id, payload.encode());
        for target in targets {
            let _ = self.outbound.send((target, msg.clone()));
        }
    }

    /// Persistence hook; durability is out of scope
    pub fn save_state(&self) -> crate::error::Result<()> {
        Ok(())
    }

    /// Persistence hook; durability is out of scope
    pub fn load_state(&self) -> crate::error::Result<()> {
        Ok(())
    }
}

fn step_down(state: &mut RaftState, term: u64, config: &ConsensusConfig) {
    debug!("stepping down to FOLLOWER (term {term})");
    state.role = RaftRole::Follower;
    state.current_term = term;
    state.voted_for = None;
    state.current_leader_id = None;
    state.next_index.clear();
    state.match_index.clear();
    state.last_heartbeat_ms = now_ms();
    state.election_timeout_ms = random_election_timeout(config);
}

fn random_election_timeout(config: &ConsensusConfig) -> u64 {
    rand::thread_rng()
        .gen_range(config.election_timeout_min_ms..=config.election_timeout_max_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_node(id: &str) -> (Arc<RaftNode>, mpsc::UnboundedReceiver<(String, Message)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        std::mem::forget(shutdown_tx);
        let node = Arc::new(RaftNode::new(
            id,
            ConsensusConfig::default(),
            tx,
            shutdown_rx,
        ));
        (node, rx)
    }

    #[tokio::test]
    async fn vote_granted_at_most_once_per_term() {
        let (node, _rx) = test_node("follower@10.0.0.1");

        let first = RequestVotePayload {
            term: 1,
            candidate_id: "a@10.0.0.2".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        };
        let second = RequestVotePayload {
            candidate_id: "b@10.0.0.3".to_string(),
            ..first.clone()
        };

        assert!(node.handle_request_vote(&first).await.vote_granted);
        assert!(!node.handle_request_vote(&second).await.vote_granted);
        // Re-asking by the same candidate is granted again
        assert!(node.handle_request_vote(&first).await.vote_granted);
    }

    #[tokio::test]
    async fn stale_term_vote_requests_are_rejected() {
        let (node, _rx) = test_node("follower@10.0.0.1");
        node.handle_heartbeat(&RaftHeartbeatPayload {
            term: 5,
            leader_id: "leader@10.0.0.9".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
        })
        .await;

        let stale = RequestVotePayload {
            term: 3,
            candidate_id: "old@10.0.0.2".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        };
        let reply = node.handle_request_vote(&stale).await;
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 5);
    }

    #[tokio::test]
    async fn higher_term_heartbeat_forces_step_down() {
        let (node, _rx) = test_node("a@10.0.0.1");
        node.start_election().await;
        assert_eq!(node.role().await, RaftRole::Leader); // no peers: instant win

        let reply = node
            .handle_heartbeat(&RaftHeartbeatPayload {
                term: 10,
                leader_id: "b@10.0.0.2".to_string(),
                prev_log_index: 0,
                prev_log_term: 0,
                leader_commit: 0,
            })
            .await;
        assert!(reply.vote_granted);
        assert_eq!(node.role().await, RaftRole::Follower);
        assert_eq!(node.current_term().await, 10);
        assert_eq!(node.leader_id().await.as_deref(), Some("b@10.0.0.2"));
    }

    #[tokio::test]
    async fn candidate_wins_with_majority_of_granted_votes() {
        let (node, mut rx) = test_node("a@10.0.0.1");
        node.add_peer("b@10.0.0.2", "10.0.0.2:7946").await;
        node.add_peer("c@10.0.0.3", "10.0.0.3:7946").await;

        node.start_election().await;
        assert_eq!(node.role().await, RaftRole::Candidate);
        let term = node.current_term().await;

        // Two vote requests went out
        let mut requests = 0;
        while let Ok((_, msg)) = rx.try_recv() {
            if msg.kind == MessageKind::RequestVote {
                requests += 1;
            }
        }
        assert_eq!(requests, 2);

        // One grant reaches majority (2 of 3)
        node.handle_vote_reply(&VoteReplyPayload {
            term,
            vote_granted: true,
        })
        .await;
        assert_eq!(node.role().await, RaftRole::Leader);
        assert_eq!(node.leader_id().await.as_deref(), Some("a@10.0.0.1"));
    }

    #[tokio::test]
    async fn rejected_votes_do_not_elect() {
        let (node, _rx) = test_node("a@10.0.0.1");
        node.add_peer("b@10.0.0.2", "10.0.0.2:7946").await;
        node.add_peer("c@10.0.0.3", "10.0.0.3:7946").await;

        node.start_election().await;
        let term = node.current_term().await;
        node.handle_vote_reply(&VoteReplyPayload {
            term,
            vote_granted: false,
        })
        .await;
        node.handle_vote_reply(&VoteReplyPayload {
            term,
            vote_granted: false,
        })
        .await;
        assert_eq!(node.role().await, RaftRole::Candidate);
    }

    #[tokio::test]
    async fn vote_reply_with_newer_term_dethrones_candidate() {
        let (node, _rx) = test_node("a@10.0.0.1");
        node.add_peer("b@10.0.0.2", "10.0.0.2:7946").await;
        node.add_peer("c@10.0.0.3", "10.0.0.3:7946").await;

        node.start_election().await;
        node.handle_vote_reply(&VoteReplyPayload {
            term: 99,
            vote_granted: false,
        })
        .await;
        assert_eq!(node.role().await, RaftRole::Follower);
        assert_eq!(node.current_term().await, 99);
    }

    #[tokio::test]
    async fn heartbeat_from_current_leader_suppresses_candidacy() {
        let (node, _rx) = test_node("a@10.0.0.1");
        node.add_peer("b@10.0.0.2", "10.0.0.2:7946").await;

        node.handle_heartbeat(&RaftHeartbeatPayload {
            term: 1,
            leader_id: "b@10.0.0.2".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
        })
        .await;

        // Fresh heartbeat means the election tick does nothing
        node.election_tick().await;
        assert_eq!(node.role().await, RaftRole::Follower);
    }
}
