use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Identity of one cluster instance.
///
/// Two ids are equal only when every field matches, so a process that restarts
/// on the same endpoint with a fresh attachment is a different member. The
/// total order (address bytes, then port) is what leader tie-breaks use.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub addr: SocketAddr,
    pub client: bool,
    pub attachment: Vec<u8>,
}

impl NodeId {
    pub fn new(addr: SocketAddr, client: bool, attachment: Vec<u8>) -> Self {
        Self {
            addr,
            client,
            attachment,
        }
    }

    /// Creates an id whose attachment is a fresh UUIDv4.
    pub fn with_instance_id(addr: SocketAddr, client: bool) -> Self {
        Self::new(addr, client, uuid::Uuid::new_v4().as_bytes().to_vec())
    }

    pub fn same_endpoint(&self, other: &NodeId) -> bool {
        self.addr == other.addr
    }
}

fn ip_key(ip: &IpAddr) -> (u8, Vec<u8>) {
    match ip {
        IpAddr::V4(v4) => (4, v4.octets().to_vec()),
        IpAddr::V6(v6) => (6, v6.octets().to_vec()),
    }
}

impl Ord for NodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        ip_key(&self.addr.ip())
            .cmp(&ip_key(&other.addr.ip()))
            .then(self.addr.port().cmp(&other.addr.port()))
            .then(self.client.cmp(&other.client))
            .then_with(|| self.attachment.cmp(&other.attachment))
    }
}

impl PartialOrd for NodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.client {
            write!(f, "{}(client)", self.addr)
        } else {
            write!(f, "{}", self.addr)
        }
    }
}

/// Wire type codes. The numbering is part of the frame format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    AddReq = 1,
    MemberChangeReqReq = 2,
    MemberChangeReq = 3,
    MemberMergeReq = 4,
    MemberMergeRes = 5,
    MainHelloReq = 6,
    MainReq = 7,
    MainRes = 8,
    HelloReq = 9,
    HelloRes = 10,
    ByeReq = 11,
    AddReqReq = 12,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::AddReq,
            2 => Self::MemberChangeReqReq,
            3 => Self::MemberChangeReq,
            4 => Self::MemberMergeReq,
            5 => Self::MemberMergeRes,
            6 => Self::MainHelloReq,
            7 => Self::MainReq,
            8 => Self::MainRes,
            9 => Self::HelloReq,
            10 => Self::HelloRes,
            11 => Self::ByeReq,
            12 => Self::AddReqReq,
            other => return Err(other),
        })
    }
}

/// The control messages exchanged between members.
///
/// - `AddReq` / `AddReqReq`: bootstrap, directly or relayed through a follower.
/// - `MemberChangeReq*`: full membership snapshots and requests for one.
/// - `MemberMerge*`: split-brain reconciliation between rival leaders.
/// - `MainHelloReq`, `MainReq` / `MainRes`: leader announcement and quorum claim.
/// - `HelloReq` / `HelloRes`: ring heartbeat.
/// - `ByeReq`: departure, sent by the leaver or on behalf of a dead neighbour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    AddReq {
        size: u32,
    },
    MemberChangeReqReq,
    MemberChangeReq {
        members: Vec<NodeId>,
    },
    MemberMergeReq {
        target: NodeId,
        members: Vec<NodeId>,
    },
    MemberMergeRes {
        members: Vec<NodeId>,
    },
    MainHelloReq {
        size: u32,
    },
    MainReq,
    MainRes {
        defer: bool,
    },
    HelloReq,
    HelloRes {
        valid: bool,
        size: u32,
    },
    ByeReq {
        departed: NodeId,
    },
    AddReqReq {
        newcomer: NodeId,
        size: u32,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::AddReq { .. } => MessageType::AddReq,
            Self::MemberChangeReqReq => MessageType::MemberChangeReqReq,
            Self::MemberChangeReq { .. } => MessageType::MemberChangeReq,
            Self::MemberMergeReq { .. } => MessageType::MemberMergeReq,
            Self::MemberMergeRes { .. } => MessageType::MemberMergeRes,
            Self::MainHelloReq { .. } => MessageType::MainHelloReq,
            Self::MainReq => MessageType::MainReq,
            Self::MainRes { .. } => MessageType::MainRes,
            Self::HelloReq => MessageType::HelloReq,
            Self::HelloRes { .. } => MessageType::HelloRes,
            Self::ByeReq { .. } => MessageType::ByeReq,
            Self::AddReqReq { .. } => MessageType::AddReqReq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub sender: NodeId,
    pub body: MessageBody,
}

impl Message {
    pub fn new(sender: NodeId, body: MessageBody) -> Self {
        Self { sender, body }
    }
}
