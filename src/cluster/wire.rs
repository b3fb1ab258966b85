use crate::cluster::node::{Node, NodeState};
use crate::error::{Result, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Protocol magic: "RADS"
pub const WIRE_MAGIC: u32 = 0x5241_4453;
/// Protocol version
pub const WIRE_VERSION: u16 = 1;

/// Fixed header size: magic + version + kind + payload_size + sender_id + timestamp
pub const HEADER_LEN: usize = 4 + 2 + 4 + 4 + SENDER_ID_LEN + 8;
/// Zero-padded sender id field width
pub const SENDER_ID_LEN: usize = 64;
/// Fixed node record size on the wire
pub const NODE_RECORD_LEN: usize = 64 + 256 + 64 + 2 + 4 + 8 + 8 + 4 + 4 + 4 + 8 + 8 + 8 + 8;

/// Message kinds, stable enumeration shared by every node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ping,
    Pong,
    GossipAnnounce,
    GossipSuspect,
    GossipConfirm,
    GossipLeave,
    SyncRequest,
    SyncResponse,
    Heartbeat,
    RequestVote,
    RequestVoteReply,
    RaftHeartbeat,
    RaftHeartbeatReply,
}

impl MessageKind {
    pub fn wire_code(self) -> u32 {
        match self {
            MessageKind::Ping => 0,
            MessageKind::Pong => 1,
            MessageKind::GossipAnnounce => 2,
            MessageKind::GossipSuspect => 3,
            MessageKind::GossipConfirm => 4,
            MessageKind::GossipLeave => 5,
            MessageKind::SyncRequest => 6,
            MessageKind::SyncResponse => 7,
            MessageKind::Heartbeat => 8,
            MessageKind::RequestVote => 9,
            MessageKind::RequestVoteReply => 10,
            MessageKind::RaftHeartbeat => 11,
            MessageKind::RaftHeartbeatReply => 12,
        }
    }

    pub fn from_wire_code(code: u32) -> Result<Self, WireError> {
        Ok(match code {
            0 => MessageKind::Ping,
            1 => MessageKind::Pong,
            2 => MessageKind::GossipAnnounce,
            3 => MessageKind::GossipSuspect,
            4 => MessageKind::GossipConfirm,
            5 => MessageKind::GossipLeave,
            6 => MessageKind::SyncRequest,
            7 => MessageKind::SyncResponse,
            8 => MessageKind::Heartbeat,
            9 => MessageKind::RequestVote,
            10 => MessageKind::RequestVoteReply,
            11 => MessageKind::RaftHeartbeat,
            12 => MessageKind::RaftHeartbeatReply,
            other => return Err(WireError::UnknownKind { code: other }),
        })
    }
}

/// A framed datagram: fixed header plus opaque payload
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub sender_id: String,
    pub timestamp_ms: u64,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, sender_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            kind,
            sender_id: sender_id.into(),
            timestamp_ms: crate::types::now_ms(),
            payload,
        }
    }

    /// Header-only message (PING, PONG, HEARTBEAT, SYNC_REQUEST)
    pub fn control(kind: MessageKind, sender_id: impl Into<String>) -> Self {
        Self::new(kind, sender_id, Bytes::new())
    }

    /// Serialize to the little-endian wire layout
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32_le(WIRE_MAGIC);
        buf.put_u16_le(WIRE_VERSION);
        buf.put_u32_le(self.kind.wire_code());
        buf.put_u32_le(self.payload.len() as u32);
        put_fixed_str(&mut buf, &self.sender_id, SENDER_ID_LEN);
        buf.put_u64_le(self.timestamp_ms);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a received frame, rejecting bad magic/version/short reads
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        if frame.len() < HEADER_LEN {
            return Err(WireError::ShortFrame {
                need: HEADER_LEN,
                got: frame.len(),
            });
        }

        let mut buf = frame;
        let magic = buf.get_u32_le();
        if magic != WIRE_MAGIC {
            return Err(WireError::BadMagic { got: magic });
        }
        let version = buf.get_u16_le();
        if version != WIRE_VERSION {
            return Err(WireError::BadVersion { got: version });
        }

        let kind = MessageKind::from_wire_code(buf.get_u32_le())?;
        let payload_size = buf.get_u32_le() as usize;
        let sender_id = get_fixed_str(&mut buf, SENDER_ID_LEN);
        let timestamp_ms = buf.get_u64_le();

        if buf.remaining() < payload_size {
            return Err(WireError::ShortFrame {
                need: HEADER_LEN + payload_size,
                got: frame.len(),
            });
        }

        Ok(Self {
            kind,
            sender_id,
            timestamp_ms,
            payload: Bytes::copy_from_slice(&buf[..payload_size]),
        })
    }
}

/// Serialize a node record into the fixed wire layout
pub fn encode_node(node: &Node) -> Bytes {
    let mut buf = BytesMut::with_capacity(NODE_RECORD_LEN);
    put_fixed_str(&mut buf, &node.id, 64);
    put_fixed_str(&mut buf, &node.name, 256);
    put_fixed_str(&mut buf, &node.address, 64);
    buf.put_u16_le(node.port);
    buf.put_u32_le(node.state.wire_code());
    buf.put_u64_le(node.last_seen_ms);
    buf.put_u64_le(node.incarnation);
    buf.put_i32_le(node.failed_pings);
    buf.put_u32_le(node.max_instances);
    buf.put_u32_le(node.current_instances);
    buf.put_f64_le(node.cpu_total);
    buf.put_f64_le(node.cpu_available);
    buf.put_u64_le(node.ram_total_mb);
    buf.put_u64_le(node.ram_available_mb);
    buf.freeze()
}

/// Deserialize a node record from the fixed wire layout
pub fn decode_node(payload: &[u8]) -> Result<Node, WireError> {
    if payload.len() < NODE_RECORD_LEN {
        return Err(WireError::ShortFrame {
            need: NODE_RECORD_LEN,
            got: payload.len(),
        });
    }

    let mut buf = payload;
    let id = get_fixed_str(&mut buf, 64);
    let name = get_fixed_str(&mut buf, 256);
    let address = get_fixed_str(&mut buf, 64);
    let port = buf.get_u16_le();
    let state_code = buf.get_u32_le();
    let state = NodeState::from_wire_code(state_code)
        .ok_or(WireError::UnknownKind { code: state_code })?;

    Ok(Node {
        id,
        name,
        address,
        port,
        state,
        last_seen_ms: buf.get_u64_le(),
        incarnation: buf.get_u64_le(),
        failed_pings: buf.get_i32_le(),
        max_instances: buf.get_u32_le(),
        current_instances: buf.get_u32_le(),
        cpu_total: buf.get_f64_le(),
        cpu_available: buf.get_f64_le(),
        ram_total_mb: buf.get_u64_le(),
        ram_available_mb: buf.get_u64_le(),
    })
}

/// Concatenate node records for a SYNC_RESPONSE payload
pub fn encode_node_list(nodes: &[Node]) -> Bytes {
    let mut buf = BytesMut::with_capacity(nodes.len() * NODE_RECORD_LEN);
    for node in nodes {
        buf.put_slice(&encode_node(node));
    }
    buf.freeze()
}

/// Split a SYNC_RESPONSE payload back into node records
pub fn decode_node_list(payload: &[u8]) -> Result<Vec<Node>, WireError> {
    let mut nodes = Vec::with_capacity(payload.len() / NODE_RECORD_LEN);
    for chunk in payload.chunks_exact(NODE_RECORD_LEN) {
        nodes.push(decode_node(chunk)?);
    }
    Ok(nodes)
}

/// RequestVote RPC payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestVotePayload {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

impl RequestVotePayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + 64 + 8 + 8);
        buf.put_u64_le(self.term);
        put_fixed_str(&mut buf, &self.candidate_id, 64);
        buf.put_u64_le(self.last_log_index);
        buf.put_u64_le(self.last_log_term);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < 8 + 64 + 8 + 8 {
            return Err(WireError::ShortFrame {
                need: 8 + 64 + 8 + 8,
                got: payload.len(),
            });
        }
        let mut buf = payload;
        Ok(Self {
            term: buf.get_u64_le(),
            candidate_id: get_fixed_str(&mut buf, 64),
            last_log_index: buf.get_u64_le(),
            last_log_term: buf.get_u64_le(),
        })
    }
}

/// RequestVote reply payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteReplyPayload {
    pub term: u64,
    pub vote_granted: bool,
}

impl VoteReplyPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u64_le(self.term);
        buf.put_u8(self.vote_granted as u8);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < 9 {
            return Err(WireError::ShortFrame {
                need: 9,
                got: payload.len(),
            });
        }
        let mut buf = payload;
        Ok(Self {
            term: buf.get_u64_le(),
            vote_granted: buf.get_u8() != 0,
        })
    }
}

/// Leader heartbeat payload (simplified AppendEntries)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftHeartbeatPayload {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub leader_commit: u64,
}

impl RaftHeartbeatPayload {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + 64 + 8 + 8 + 8);
        buf.put_u64_le(self.term);
        put_fixed_str(&mut buf, &self.leader_id, 64);
        buf.put_u64_le(self.prev_log_index);
        buf.put_u64_le(self.prev_log_term);
        buf.put_u64_le(self.leader_commit);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < 8 + 64 + 8 + 8 + 8 {
            return Err(WireError::ShortFrame {
                need: 8 + 64 + 8 + 8 + 8,
                got: payload.len(),
            });
        }
        let mut buf = payload;
        Ok(Self {
            term: buf.get_u64_le(),
            leader_id: get_fixed_str(&mut buf, 64),
            prev_log_index: buf.get_u64_le(),
            prev_log_term: buf.get_u64_le(),
            leader_commit: buf.get_u64_le(),
        })
    }
}

fn put_fixed_str(buf: &mut BytesMut, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let take = bytes.len().min(width);
    buf.put_slice(&bytes[..take]);
    buf.put_bytes(0, width - take);
}

fn get_fixed_str(buf: &mut &[u8], width: usize) -> String {
    let raw = &buf[..width];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
    let value = String::from_utf8_lossy(&raw[..end]).into_owned();
    buf.advance(width);
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_node() -> Node {
        let mut node = Node::new("alpha", "10.0.0.1", 7946);
        node.incarnation = 4;
        node.failed_pings = -1;
        node.max_instances = 32;
        node.current_instances = 7;
        node.cpu_total = 8.0;
        node.cpu_available = 3.5;
        node.ram_total_mb = 16_384;
        node.ram_available_mb = 9_000;
        node
    }

    #[test]
    fn header_round_trip() {
        let msg = Message::control(MessageKind::Heartbeat, "alpha@10.0.0.1");
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Heartbeat);
        assert_eq!(decoded.sender_id, "alpha@10.0.0.1");
        assert_eq!(decoded.timestamp_ms, msg.timestamp_ms);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn node_record_round_trip() {
        let node = sample_node();
        let encoded = encode_node(&node);
        assert_eq!(encoded.len(), NODE_RECORD_LEN);

        let decoded = decode_node(&encoded).unwrap();
        assert_eq!(decoded.id, node.id);
        assert_eq!(decoded.name, node.name);
        assert_eq!(decoded.port, node.port);
        assert_eq!(decoded.state, node.state);
        assert_eq!(decoded.incarnation, node.incarnation);
        assert_eq!(decoded.failed_pings, node.failed_pings);
        assert_eq!(decoded.cpu_available, node.cpu_available);
        assert_eq!(decoded.ram_available_mb, node.ram_available_mb);
    }

    #[test]
    fn announce_message_round_trip() {
        let node = sample_node();
        let msg = Message::new(MessageKind::GossipAnnounce, &node.id, encode_node(&node));
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.kind, MessageKind::GossipAnnounce);
        let inner = decode_node(&decoded.payload).unwrap();
        assert_eq!(inner.id, node.id);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut frame = Message::control(MessageKind::Ping, "x").encode().to_vec();
        frame[0] ^= 0xff;
        assert!(matches!(
            Message::decode(&frame),
            Err(WireError::BadMagic { .. })
        ));
    }

    #[test]
    fn bad_version_is_rejected() {
        let mut frame = Message::control(MessageKind::Ping, "x").encode().to_vec();
        frame[4] = 9;
        assert!(matches!(
            Message::decode(&frame),
            Err(WireError::BadVersion { got: 9 })
        ));
    }

    #[test]
    fn short_frame_is_rejected() {
        let frame = Message::control(MessageKind::Ping, "x").encode();
        assert!(matches!(
            Message::decode(&frame[..HEADER_LEN - 1]),
            Err(WireError::ShortFrame { .. })
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let node = sample_node();
        let msg = Message::new(MessageKind::GossipAnnounce, &node.id, encode_node(&node));
        let frame = msg.encode();
        assert!(matches!(
            Message::decode(&frame[..frame.len() - 10]),
            Err(WireError::ShortFrame { .. })
        ));
    }

    #[test]
    fn node_list_round_trip() {
        let nodes = vec![sample_node(), Node::new("beta", "10.0.0.2", 7946)];
        let payload = encode_node_list(&nodes);
        let decoded = decode_node_list(&payload).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].id, "beta@10.0.0.2");
    }

    #[test]
    fn raft_payload_round_trips() {
        let vote = RequestVotePayload {
            term: 7,
            candidate_id: "alpha@10.0.0.1".to_string(),
            last_log_index: 0,
            last_log_term: 0,
        };
        assert_eq!(RequestVotePayload::decode(&vote.encode()).unwrap(), vote);

        let reply = VoteReplyPayload {
            term: 7,
            vote_granted: true,
        };
        assert_eq!(VoteReplyPayload::decode(&reply.encode()).unwrap(), reply);

        let hb = RaftHeartbeatPayload {
            term: 8,
            leader_id: "beta@10.0.0.2".to_string(),
            prev_log_index: 0,
            prev_log_term: 0,
            leader_commit: 0,
        };
        assert_eq!(RaftHeartbeatPayload::decode(&hb.encode()).unwrap(), hb);
    }

    #[test]
    fn long_sender_id_is_truncated_not_panicking() {
        let long = "x".repeat(200);
        let msg = Message::control(MessageKind::Ping, long);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.sender_id.len(), SENDER_ID_LEN);
    }
}
