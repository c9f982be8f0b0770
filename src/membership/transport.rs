//! UDP transport for protocol messages.
//!
//! Outbound messages are encoded, divided into windows and sent to one node or
//! to every known address. Inbound datagrams are reassembled and decoded; bad
//! frames are logged and dropped, and socket failures rebind the socket.
//! Only the receive loop rebinds, once it has let go of the old socket.

use super::codec;
use super::config::MembershipConfig;
use super::types::{Message, NodeId};
use super::window::{self, Reassembler, Window};

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify, RwLock, watch};

const MAX_DATAGRAM: usize = 65_536;
const REBIND_DELAY: Duration = Duration::from_millis(100);

/// Supplies the addresses a node announces itself to.
pub trait MembershipSource: Send + Sync {
    fn addresses(&self) -> Vec<SocketAddr>;
}

/// A fixed list: unicast peers, a multicast group, or both.
pub struct StaticSource {
    addresses: Vec<SocketAddr>,
}

impl StaticSource {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }
}

impl MembershipSource for StaticSource {
    fn addresses(&self) -> Vec<SocketAddr> {
        self.addresses.clone()
    }
}

/// Addresses published by an external watcher, such as one following an
/// orchestrator's endpoint list.
pub struct WatchSource {
    rx: watch::Receiver<Vec<SocketAddr>>,
}

impl WatchSource {
    pub fn channel(initial: Vec<SocketAddr>) -> (watch::Sender<Vec<SocketAddr>>, Self) {
        let (tx, rx) = watch::channel(initial);
        (tx, Self { rx })
    }
}

impl MembershipSource for WatchSource {
    fn addresses(&self) -> Vec<SocketAddr> {
        self.rx.borrow().clone()
    }
}

struct Inbound {
    buf: Vec<u8>,
    reassembler: Reassembler,
}

pub struct Transport {
    local: NodeId,
    bound: SocketAddr,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    source: Arc<dyn MembershipSource>,
    sequence: AtomicU64,
    max_frame_size: usize,
    keep_order: bool,
    /// Highest sequence delivered per sender, used by `keep_order`.
    last_delivered: DashMap<NodeId, u64>,
    rebind_requested: Notify,
    inbound: Mutex<Inbound>,
}

async fn bind_socket(addr: SocketAddr, groups: &[Ipv4Addr]) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    for group in groups {
        socket.join_multicast_v4(*group, Ipv4Addr::UNSPECIFIED)?;
    }
    Ok(socket)
}

fn multicast_groups(addresses: &[SocketAddr]) -> Vec<Ipv4Addr> {
    addresses
        .iter()
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(ip) if ip.is_multicast() => Some(ip),
            _ => None,
        })
        .collect()
}

impl Transport {
    pub async fn bind(config: &MembershipConfig, source: Arc<dyn MembershipSource>) -> Result<Self> {
        let groups = multicast_groups(&source.addresses());
        let socket = bind_socket(config.bind_addr, &groups)
            .await
            .with_context(|| format!("binding UDP socket on {}", config.bind_addr))?;
        let bound = socket.local_addr()?;
        let advertised = config.advertise_addr.unwrap_or(bound);
        let local = NodeId::with_instance_id(advertised, config.is_client);

        // milliseconds in the high bits keep a restarted sender ahead of its old sequences
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        tracing::info!("Membership transport bound on {} as {}", bound, local);

        Ok(Self {
            local,
            bound,
            socket: RwLock::new(Some(Arc::new(socket))),
            source,
            sequence: AtomicU64::new(epoch_ms << 16),
            max_frame_size: config.receive_buffer_size,
            keep_order: config.keep_order,
            last_delivered: DashMap::new(),
            rebind_requested: Notify::new(),
            inbound: Mutex::new(Inbound {
                buf: vec![0u8; MAX_DATAGRAM],
                reassembler: Reassembler::new(config.lost_timeout()),
            }),
        })
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.bound
    }

    pub fn discovery_addresses(&self) -> Vec<SocketAddr> {
        self.source.addresses()
    }

    fn is_self(&self, addr: &SocketAddr) -> bool {
        *addr == self.local.addr || *addr == self.bound
    }

    /// Drops ordering state for a node that left the cluster.
    pub fn forget(&self, node: &NodeId) {
        self.last_delivered.remove(node);
    }

    async fn current_socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.read().await.clone()
    }

    /// Retires the current socket; the receive loop binds its replacement.
    async fn invalidate(&self) {
        self.socket.write().await.take();
        self.rebind_requested.notify_one();
    }

    /// Replaces the socket with a fresh one on the same local address.
    /// Called from the receive loop only, after its own handle is dropped.
    async fn rebind(&self) {
        let mut slot = self.socket.write().await;
        slot.take();

        let groups = multicast_groups(&self.source.addresses());
        match bind_socket(self.bound, &groups).await {
            Ok(socket) => {
                tracing::info!("Rebound membership socket on {}", self.bound);
                *slot = Some(Arc::new(socket));
            }
            Err(e) => {
                tracing::warn!("Failed to rebind {}: {}", self.bound, e);
            }
        }
    }

    fn frames(&self, msg: &Message) -> Option<Vec<Bytes>> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let encoded = codec::encode_message(msg)
            .and_then(|payload| window::divide(&self.local, sequence, &payload, self.max_frame_size));

        match encoded {
            Ok(frames) => Some(frames),
            Err(e) => {
                tracing::error!("Failed to encode {:?}: {}", msg.body.message_type(), e);
                None
            }
        }
    }

    async fn send_frames(&self, frames: &[Bytes], target: SocketAddr) {
        let Some(socket) = self.current_socket().await else {
            tracing::debug!("No socket available, dropping datagram to {}", target);
            return;
        };

        for frame in frames {
            if let Err(e) = socket.send_to(frame, target).await {
                tracing::warn!("Failed to send to {}: {}", target, e);
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe
                ) {
                    drop(socket);
                    self.invalidate().await;
                }
                return;
            }
        }
    }

    pub async fn send(&self, msg: &Message, to: &NodeId) {
        if let Some(frames) = self.frames(msg) {
            tracing::debug!("Sending {:?} to {}", msg.body.message_type(), to);
            self.send_frames(&frames, to.addr).await;
        }
    }

    /// Sends to every discovery address plus `known`, skipping this node.
    pub async fn broadcast(&self, msg: &Message, known: &[SocketAddr]) {
        let Some(frames) = self.frames(msg) else {
            return;
        };

        let mut targets: Vec<SocketAddr> = Vec::new();
        for addr in self.source.addresses().into_iter().chain(known.iter().copied()) {
            if !self.is_self(&addr) && !targets.contains(&addr) {
                targets.push(addr);
            }
        }

        tracing::debug!(
            "Broadcasting {:?} to {} addresses",
            msg.body.message_type(),
            targets.len()
        );
        for target in targets {
            self.send_frames(&frames, target).await;
        }
    }

    /// Records `sequence` for the sender; false if it is not newer than the last one.
    fn in_order(&self, msg: &Message, sequence: u64) -> bool {
        if !self.last_delivered.contains_key(&msg.sender) {
            // a restarted peer: its previous identity will never send again
            self.last_delivered
                .retain(|known, _| !known.same_endpoint(&msg.sender));
        }

        let mut last = self.last_delivered.entry(msg.sender.clone()).or_insert(0);
        if sequence <= *last {
            tracing::debug!(
                "Dropping out-of-order {:?} from {} ({} <= {})",
                msg.body.message_type(),
                msg.sender,
                sequence,
                *last
            );
            return false;
        }
        *last = sequence;
        true
    }

    /// Waits for the next complete, decodable message.
    pub async fn receive(&self) -> Message {
        let mut inbound = self.inbound.lock().await;
        let inbound = &mut *inbound;

        loop {
            let Some(socket) = self.current_socket().await else {
                tokio::time::sleep(REBIND_DELAY).await;
                self.rebind().await;
                continue;
            };

            let received = tokio::select! {
                received = socket.recv_from(&mut inbound.buf) => Some(received),
                _ = self.rebind_requested.notified() => None,
            };
            let Some(received) = received else {
                drop(socket);
                self.rebind().await;
                continue;
            };

            let (len, src) = match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Failed to receive UDP packet: {}", e);
                    drop(socket);
                    tokio::time::sleep(REBIND_DELAY).await;
                    self.rebind().await;
                    continue;
                }
            };

            let window = match Window::decode(Bytes::copy_from_slice(&inbound.buf[..len])) {
                Ok(window) => window,
                Err(e) => {
                    tracing::warn!("Dropping malformed frame from {}: {}", src, e);
                    continue;
                }
            };
            let sequence = window.sequence;

            let Some((sender, payload)) = inbound.reassembler.accept(window, Instant::now())
            else {
                continue;
            };

            let msg = match codec::decode_message(payload) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!("Dropping undecodable message from {}: {}", sender, e);
                    continue;
                }
            };

            if self.keep_order && !self.in_order(&msg, sequence) {
                continue;
            }

            return msg;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::types::MessageBody;

    async fn transport(keep_order: bool, receive_buffer_size: usize) -> Transport {
        let config = MembershipConfig {
            keep_order,
            receive_buffer_size,
            ..Default::default()
        };
        Transport::bind(&config, Arc::new(StaticSource::new(vec![])))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_large_message_is_fragmented_and_reassembled() {
        let sender = transport(false, 256).await;
        let receiver = transport(false, 256).await;

        let members: Vec<NodeId> = (0..40)
            .map(|i| NodeId::with_instance_id(format!("10.0.0.{}:7000", i).parse().unwrap(), false))
            .collect();
        let msg = Message::new(
            sender.local_id().clone(),
            MessageBody::MemberChangeReq { members },
        );

        sender.send(&msg, receiver.local_id()).await;
        let received = tokio::time::timeout(Duration::from_secs(2), receiver.receive())
            .await
            .expect("message not received");

        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_skipped() {
        let receiver = transport(false, 1400).await;
        let sender = transport(false, 1400).await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(b"garbage", receiver.local_addr()).await.unwrap();

        let msg = Message::new(sender.local_id().clone(), MessageBody::MainReq);
        sender.send(&msg, receiver.local_id()).await;

        let received = tokio::time::timeout(Duration::from_secs(2), receiver.receive())
            .await
            .expect("valid message not received");
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_discovery_and_known_addresses() {
        let a = transport(false, 1400).await;
        let b = transport(false, 1400).await;
        let (tx, source) = WatchSource::channel(vec![]);
        let config = MembershipConfig::default();
        let sender = Transport::bind(&config, Arc::new(source)).await.unwrap();
        tx.send(vec![a.local_addr(), sender.local_addr()]).unwrap();

        let msg = Message::new(sender.local_id().clone(), MessageBody::HelloReq);
        sender.broadcast(&msg, &[b.local_addr()]).await;

        for receiver in [&a, &b] {
            let received = tokio::time::timeout(Duration::from_secs(2), receiver.receive())
                .await
                .expect("broadcast not received");
            assert_eq!(received, msg);
        }
    }

    // ============================================================================
    // Ordering and socket recovery
    // ============================================================================

    async fn send_raw(
        raw: &UdpSocket,
        to: SocketAddr,
        sender: &NodeId,
        sequence: u64,
        body: MessageBody,
    ) {
        let payload = codec::encode_message(&Message::new(sender.clone(), body)).unwrap();
        for frame in window::divide(sender, sequence, &payload, 1400).unwrap() {
            raw.send_to(&frame, to).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_keep_order_drops_stale_sequences() {
        let receiver = transport(true, 1400).await;
        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = NodeId::with_instance_id(raw.local_addr().unwrap(), false);
        let to = receiver.local_addr();

        send_raw(&raw, to, &sender, 10, MessageBody::MainReq).await;
        send_raw(&raw, to, &sender, 10, MessageBody::MemberChangeReqReq).await;
        send_raw(&raw, to, &sender, 5, MessageBody::MemberChangeReqReq).await;
        send_raw(&raw, to, &sender, 11, MessageBody::HelloReq).await;

        let first = tokio::time::timeout(Duration::from_secs(2), receiver.receive())
            .await
            .expect("first message not received");
        assert_eq!(first.body, MessageBody::MainReq);

        let second = tokio::time::timeout(Duration::from_secs(2), receiver.receive())
            .await
            .expect("newer message not received");
        assert_eq!(second.body, MessageBody::HelloReq);
        assert_eq!(receiver.last_delivered.get(&sender).map(|v| *v), Some(11));
    }

    #[tokio::test]
    async fn test_restarted_sender_replaces_ordering_entry() {
        let receiver = transport(true, 1400).await;
        let addr: SocketAddr = "10.0.0.1:7000".parse().unwrap();
        let before = NodeId::with_instance_id(addr, false);
        let after = NodeId::with_instance_id(addr, false);
        let other = NodeId::with_instance_id("10.0.0.2:7000".parse().unwrap(), false);

        assert!(receiver.in_order(&Message::new(before.clone(), MessageBody::HelloReq), 100));
        assert!(receiver.in_order(&Message::new(other.clone(), MessageBody::HelloReq), 7));
        assert!(receiver.in_order(&Message::new(after.clone(), MessageBody::HelloReq), 1));

        assert!(!receiver.last_delivered.contains_key(&before));
        assert!(receiver.last_delivered.contains_key(&after));
        assert_eq!(receiver.last_delivered.len(), 2);

        receiver.forget(&other);
        assert!(!receiver.last_delivered.contains_key(&other));
        assert_eq!(receiver.last_delivered.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidated_socket_is_rebound_by_receive_loop() {
        let receiver = Arc::new(transport(false, 1400).await);
        let sender = transport(false, 1400).await;
        let port = receiver.local_addr().port();

        let rx = receiver.clone();
        let handle = tokio::spawn(async move { rx.receive().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        receiver.invalidate().await;

        let msg = Message::new(sender.local_id().clone(), MessageBody::MainReq);
        for _ in 0..20 {
            if handle.is_finished() {
                break;
            }
            sender.send(&msg, receiver.local_id()).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let received = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("message not received after rebind")
            .unwrap();
        assert_eq!(received, msg);

        let socket = receiver.current_socket().await.expect("socket not rebound");
        assert_eq!(socket.local_addr().unwrap().port(), port);
    }
}
