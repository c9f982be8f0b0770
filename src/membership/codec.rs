//! Binary encoding of node ids and protocol messages.
//!
//! Every field is length-prefixed or fixed-width and big-endian, so any peer
//! that follows the layout below can talk to this one:
//!
//! ```text
//! NodeId   = family:u8 ip:[u8; 4|16] port:u16 client:u8 attachment_len:u16 attachment
//! List     = count:u16 NodeId*
//! Message  = sender:NodeId type:u8 fields
//! ```

use super::types::{Message, MessageBody, MessageType, NodeId};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated input: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unknown address family {0}")]
    UnknownFamily(u8),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("bad frame magic {0:#06x}")]
    BadMagic(u16),

    #[error("unsupported frame version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u8),

    #[error("fragment index {index} out of range for {count} fragments")]
    FragmentIndex { index: u16, count: u16 },

    #[error("frame size {max} leaves no room for payload after {header} header bytes")]
    FrameTooSmall { max: usize, header: usize },

    #[error("payload needs {0} fragments, more than a frame header can describe")]
    TooManyFragments(usize),

    #[error("{0} exceeds the encodable length")]
    TooLong(&'static str),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

pub type CodecResult<T> = Result<T, CodecError>;

pub(crate) fn ensure(buf: &impl Buf, len: usize) -> CodecResult<()> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated {
            needed: len - buf.remaining(),
        });
    }
    Ok(())
}

pub fn encoded_node_len(node: &NodeId) -> usize {
    let ip_len = match node.addr.ip() {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    };
    1 + ip_len + 2 + 1 + 2 + node.attachment.len()
}

pub fn put_node(buf: &mut BytesMut, node: &NodeId) -> CodecResult<()> {
    let attachment_len =
        u16::try_from(node.attachment.len()).map_err(|_| CodecError::TooLong("attachment"))?;

    match node.addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(6);
            buf.put_slice(&ip.octets());
        }
    }
    buf.put_u16(node.addr.port());
    buf.put_u8(node.client as u8);
    buf.put_u16(attachment_len);
    buf.put_slice(&node.attachment);
    Ok(())
}

pub fn get_node(buf: &mut impl Buf) -> CodecResult<NodeId> {
    ensure(&*buf, 1)?;
    let ip = match buf.get_u8() {
        4 => {
            ensure(&*buf, 4)?;
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        6 => {
            ensure(&*buf, 16)?;
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(CodecError::UnknownFamily(other)),
    };

    ensure(&*buf, 5)?;
    let port = buf.get_u16();
    let client = buf.get_u8() != 0;
    let attachment_len = buf.get_u16() as usize;
    ensure(&*buf, attachment_len)?;
    let mut attachment = vec![0u8; attachment_len];
    buf.copy_to_slice(&mut attachment);

    Ok(NodeId::new(SocketAddr::new(ip, port), client, attachment))
}

fn put_nodes(buf: &mut BytesMut, nodes: &[NodeId]) -> CodecResult<()> {
    let count = u16::try_from(nodes.len()).map_err(|_| CodecError::TooLong("member list"))?;
    buf.put_u16(count);
    for node in nodes {
        put_node(buf, node)?;
    }
    Ok(())
}

/// Smallest possible NodeId: IPv4, empty attachment.
const MIN_NODE_LEN: usize = 1 + 4 + 2 + 1 + 2;

/// Capacity for a list of `count` nodes that cannot exceed what `remaining` bytes hold.
fn list_capacity(count: usize, remaining: usize) -> usize {
    count.min(remaining / MIN_NODE_LEN)
}

fn get_nodes(buf: &mut impl Buf) -> CodecResult<Vec<NodeId>> {
    ensure(&*buf, 2)?;
    let count = buf.get_u16() as usize;
    let mut nodes = Vec::with_capacity(list_capacity(count, buf.remaining()));
    for _ in 0..count {
        nodes.push(get_node(buf)?);
    }
    Ok(nodes)
}

fn get_u32(buf: &mut impl Buf) -> CodecResult<u32> {
    ensure(&*buf, 4)?;
    Ok(buf.get_u32())
}

fn get_bool(buf: &mut impl Buf) -> CodecResult<bool> {
    ensure(&*buf, 1)?;
    Ok(buf.get_u8() != 0)
}

pub fn encode_message(msg: &Message) -> CodecResult<Bytes> {
    let mut buf = BytesMut::with_capacity(64);
    put_node(&mut buf, &msg.sender)?;
    buf.put_u8(msg.body.message_type() as u8);

    match &msg.body {
        MessageBody::AddReq { size } | MessageBody::MainHelloReq { size } => buf.put_u32(*size),
        MessageBody::MemberChangeReqReq | MessageBody::MainReq | MessageBody::HelloReq => {}
        MessageBody::MemberChangeReq { members } | MessageBody::MemberMergeRes { members } => {
            put_nodes(&mut buf, members)?
        }
        MessageBody::MemberMergeReq { target, members } => {
            put_node(&mut buf, target)?;
            put_nodes(&mut buf, members)?;
        }
        MessageBody::MainRes { defer } => buf.put_u8(*defer as u8),
        MessageBody::HelloRes { valid, size } => {
            buf.put_u8(*valid as u8);
            buf.put_u32(*size);
        }
        MessageBody::ByeReq { departed } => put_node(&mut buf, departed)?,
        MessageBody::AddReqReq { newcomer, size } => {
            put_node(&mut buf, newcomer)?;
            buf.put_u32(*size);
        }
    }

    Ok(buf.freeze())
}

pub fn decode_message(mut buf: impl Buf) -> CodecResult<Message> {
    let sender = get_node(&mut buf)?;
    ensure(&buf, 1)?;
    let raw_type = buf.get_u8();
    let message_type =
        MessageType::try_from(raw_type).map_err(CodecError::UnknownMessageType)?;

    let body = match message_type {
        MessageType::AddReq => MessageBody::AddReq {
            size: get_u32(&mut buf)?,
        },
        MessageType::MemberChangeReqReq => MessageBody::MemberChangeReqReq,
        MessageType::MemberChangeReq => MessageBody::MemberChangeReq {
            members: get_nodes(&mut buf)?,
        },
        MessageType::MemberMergeReq => MessageBody::MemberMergeReq {
            target: get_node(&mut buf)?,
            members: get_nodes(&mut buf)?,
        },
        MessageType::MemberMergeRes => MessageBody::MemberMergeRes {
            members: get_nodes(&mut buf)?,
        },
        MessageType::MainHelloReq => MessageBody::MainHelloReq {
            size: get_u32(&mut buf)?,
        },
        MessageType::MainReq => MessageBody::MainReq,
        MessageType::MainRes => MessageBody::MainRes {
            defer: get_bool(&mut buf)?,
        },
        MessageType::HelloReq => MessageBody::HelloReq,
        MessageType::HelloRes => MessageBody::HelloRes {
            valid: get_bool(&mut buf)?,
            size: get_u32(&mut buf)?,
        },
        MessageType::ByeReq => MessageBody::ByeReq {
            departed: get_node(&mut buf)?,
        },
        MessageType::AddReqReq => MessageBody::AddReqReq {
            newcomer: get_node(&mut buf)?,
            size: get_u32(&mut buf)?,
        },
    };

    if buf.has_remaining() {
        return Err(CodecError::TrailingBytes(buf.remaining()));
    }

    Ok(Message { sender, body })
}
