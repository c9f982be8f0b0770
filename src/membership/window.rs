//! Fragmentation ("windows") of protocol messages over datagrams.
//!
//! ```text
//! Frame    = magic:u16 version:u8 kind:u8 sender:NodeId sequence:u64 body
//! single   = len:u32 payload
//! fragment = count:u16 index:u16 len:u32 chunk
//! ```
//!
//! A message that fits into one datagram is sent as a `single` frame and never
//! touches the reassembly table.

use super::codec::{self, CodecError, CodecResult, ensure};
use super::types::NodeId;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

pub const FRAME_MAGIC: u16 = 0x5243;
pub const FRAME_VERSION: u8 = 1;

const KIND_SINGLE: u8 = 0;
const KIND_FRAGMENT: u8 = 1;

fn single_header_len(sender: &NodeId) -> usize {
    2 + 1 + 1 + codec::encoded_node_len(sender) + 8 + 4
}

fn fragment_header_len(sender: &NodeId) -> usize {
    2 + 1 + 1 + codec::encoded_node_len(sender) + 8 + 2 + 2 + 4
}

/// Largest payload `sender` can ship in one unfragmented frame.
fn single_frame_capacity(sender: &NodeId, max_frame_size: usize) -> usize {
    max_frame_size.saturating_sub(single_header_len(sender))
}

/// One datagram: a whole message (`count == 1`) or one fragment of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub sender: NodeId,
    pub sequence: u64,
    pub count: u16,
    pub index: u16,
    pub chunk: Bytes,
}

impl Window {
    pub fn is_complete(&self) -> bool {
        self.count == 1
    }

    pub fn encode(&self) -> CodecResult<Bytes> {
        let chunk_len =
            u32::try_from(self.chunk.len()).map_err(|_| CodecError::TooLong("frame chunk"))?;
        let mut buf = BytesMut::with_capacity(fragment_header_len(&self.sender) + self.chunk.len());

        buf.put_u16(FRAME_MAGIC);
        buf.put_u8(FRAME_VERSION);
        buf.put_u8(if self.is_complete() {
            KIND_SINGLE
        } else {
            KIND_FRAGMENT
        });
        codec::put_node(&mut buf, &self.sender)?;
        buf.put_u64(self.sequence);
        if !self.is_complete() {
            buf.put_u16(self.count);
            buf.put_u16(self.index);
        }
        buf.put_u32(chunk_len);
        buf.put_slice(&self.chunk);

        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> CodecResult<Self> {
        ensure(&buf, 4)?;
        let magic = buf.get_u16();
        if magic != FRAME_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }
        let version = buf.get_u8();
        if version != FRAME_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let kind = buf.get_u8();

        let sender = codec::get_node(&mut buf)?;
        ensure(&buf, 8)?;
        let sequence = buf.get_u64();

        let (count, index) = match kind {
            KIND_SINGLE => (1, 0),
            KIND_FRAGMENT => {
                ensure(&buf, 4)?;
                let count = buf.get_u16();
                let index = buf.get_u16();
                if index >= count {
                    return Err(CodecError::FragmentIndex { index, count });
                }
                (count, index)
            }
            other => return Err(CodecError::UnknownFrameKind(other)),
        };

        ensure(&buf, 4)?;
        let len = buf.get_u32() as usize;
        ensure(&buf, len)?;
        let chunk = buf.split_to(len);
        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            sender,
            sequence,
            count,
            index,
            chunk,
        })
    }
}

/// Splits `payload` into encoded frames no larger than `max_frame_size`.
pub fn divide(
    sender: &NodeId,
    sequence: u64,
    payload: &Bytes,
    max_frame_size: usize,
) -> CodecResult<Vec<Bytes>> {
    let capacity = single_frame_capacity(sender, max_frame_size);
    if capacity == 0 {
        return Err(CodecError::FrameTooSmall {
            max: max_frame_size,
            header: single_header_len(sender),
        });
    }

    if payload.len() <= capacity {
        let window = Window {
            sender: sender.clone(),
            sequence,
            count: 1,
            index: 0,
            chunk: payload.clone(),
        };
        return Ok(vec![window.encode()?]);
    }

    let fragment_header = fragment_header_len(sender);
    if max_frame_size <= fragment_header {
        return Err(CodecError::FrameTooSmall {
            max: max_frame_size,
            header: fragment_header,
        });
    }
    let chunk_size = max_frame_size - fragment_header;
    let needed = payload.len().div_ceil(chunk_size);
    let count = u16::try_from(needed).map_err(|_| CodecError::TooManyFragments(needed))?;

    (0..count)
        .map(|index| {
            let start = (index as usize * chunk_size).min(payload.len());
            let end = (start + chunk_size).min(payload.len());
            Window {
                sender: sender.clone(),
                sequence,
                count,
                index,
                chunk: payload.slice(start..end),
            }
            .encode()
        })
        .collect()
}

struct PartialMessage {
    first_seen: Instant,
    chunks: Vec<Option<Bytes>>,
    received: usize,
}

/// Holds incomplete fragment sets keyed by (sender, sequence).
///
/// Entries expire `lost_timeout` after their first fragment arrived locally.
/// Expiry is queued in insertion order, which is also deadline order, so the
/// sweep can stop at the first live entry.
pub struct Reassembler {
    lost_timeout: Duration,
    pending: HashMap<(NodeId, u64), PartialMessage>,
    expiry: VecDeque<(Instant, NodeId, u64)>,
}

impl Reassembler {
    pub fn new(lost_timeout: Duration) -> Self {
        Self {
            lost_timeout,
            pending: HashMap::new(),
            expiry: VecDeque::new(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn sweep(&mut self, now: Instant) {
        while let Some((first_seen, _, _)) = self.expiry.front() {
            if now.saturating_duration_since(*first_seen) < self.lost_timeout {
                break;
            }
            let Some((first_seen, sender, sequence)) = self.expiry.pop_front() else {
                break;
            };
            let key = (sender, sequence);
            if self
                .pending
                .get(&key)
                .is_some_and(|partial| partial.first_seen == first_seen)
            {
                self.pending.remove(&key);
                tracing::debug!(
                    "Dropped incomplete message {} from {} after {:?}",
                    key.1,
                    key.0,
                    self.lost_timeout
                );
            }
        }
    }

    /// Feeds one window in; returns the full message once every fragment is in.
    pub fn accept(&mut self, window: Window, now: Instant) -> Option<(NodeId, Bytes)> {
        self.sweep(now);

        if window.is_complete() {
            return Some((window.sender, window.chunk));
        }

        let key = (window.sender, window.sequence);
        let count = window.count as usize;

        if let Some(partial) = self.pending.get(&key)
            && partial.chunks.len() != count
        {
            tracing::warn!(
                "Fragment count changed from {} to {} for message {} from {}, discarding",
                partial.chunks.len(),
                count,
                key.1,
                key.0
            );
            self.pending.remove(&key);
            return None;
        }

        let partial = self.pending.entry(key.clone()).or_insert_with(|| {
            self.expiry.push_back((now, key.0.clone(), key.1));
            PartialMessage {
                first_seen: now,
                chunks: vec![None; count],
                received: 0,
            }
        });

        let slot = &mut partial.chunks[window.index as usize];
        if slot.is_none() {
            *slot = Some(window.chunk);
            partial.received += 1;
        }

        if partial.received < count {
            return None;
        }

        let partial = self.pending.remove(&key)?;
        let mut message = BytesMut::new();
        for chunk in partial.chunks.into_iter().flatten() {
            message.put_slice(&chunk);
        }
        Some((key.0, message.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> NodeId {
        NodeId::new("127.0.0.1:7000".parse().unwrap(), false, vec![1, 2, 3, 4])
    }

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
    }

    fn reassemble(frames: Vec<Bytes>) -> Bytes {
        let mut reassembler = Reassembler::new(Duration::from_secs(5));
        let now = Instant::now();
        let mut result = None;
        for frame in frames {
            let window = Window::decode(frame).unwrap();
            if let Some((from, message)) = reassembler.accept(window, now) {
                assert_eq!(from, sender());
                result = Some(message);
            }
        }
        assert_eq!(reassembler.pending_len(), 0);
        result.expect("message never completed")
    }

    #[test]
    fn test_divide_and_reassemble_boundary_sizes() {
        let max_frame = 128;
        let w = single_frame_capacity(&sender(), max_frame);

        for len in [0, w - 1, w, w + 1, 10 * w] {
            let original = payload(len);
            let frames = divide(&sender(), 42, &original, max_frame).unwrap();

            assert!(frames.iter().all(|frame| frame.len() <= max_frame));
            if len <= w {
                assert_eq!(frames.len(), 1, "size {} should fit one frame", len);
            } else {
                assert!(frames.len() > 1);
            }

            assert_eq!(reassemble(frames), original, "size {}", len);
        }
    }

    #[test]
    fn test_out_of_order_fragments_reassemble_by_index() {
        let original = payload(1000);
        let mut frames = divide(&sender(), 7, &original, 100).unwrap();
        frames.reverse();
        frames.swap(1, 3);

        assert_eq!(reassemble(frames), original);
    }

    #[test]
    fn test_duplicate_fragment_is_ignored() {
        let original = payload(300);
        let frames = divide(&sender(), 1, &original, 100).unwrap();
        let mut with_dup = vec![frames[0].clone()];
        with_dup.extend(frames.iter().cloned());

        assert_eq!(reassemble(with_dup), original);
    }

    #[test]
    fn test_incomplete_set_is_evicted_after_lost_timeout() {
        let lost = Duration::from_millis(100);
        let mut reassembler = Reassembler::new(lost);
        let start = Instant::now();

        let frames = divide(&sender(), 9, &payload(500), 100).unwrap();
        let first = Window::decode(frames[0].clone()).unwrap();
        assert!(reassembler.accept(first, start).is_none());
        assert_eq!(reassembler.pending_len(), 1);

        reassembler.sweep(start + lost / 2);
        assert_eq!(reassembler.pending_len(), 1);

        reassembler.sweep(start + lost);
        assert_eq!(reassembler.pending_len(), 0);

        // the rest of the set arrives too late to complete anything
        for frame in frames.into_iter().skip(1) {
            let window = Window::decode(frame).unwrap();
            assert!(reassembler.accept(window, start + lost * 2).is_none());
        }
    }

    #[test]
    fn test_frame_too_small_is_an_error() {
        assert!(matches!(
            divide(&sender(), 1, &payload(10), 8),
            Err(CodecError::FrameTooSmall { .. })
        ));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let frames = divide(&sender(), 1, &payload(4), 128).unwrap();
        let mut raw = BytesMut::from(&frames[0][..]);
        raw[0] = 0xFF;

        assert!(matches!(
            Window::decode(raw.freeze()),
            Err(CodecError::BadMagic(_))
        ));
    }
}
