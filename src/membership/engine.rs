//! Protocol engine: one handler per message type.
//!
//! Handlers take the state lock only to decide, then release it before any
//! network send or event publication.

use super::election::{ClaimProgress, outranks};
use super::events::Event;
use super::service::MembershipService;
use super::types::{Message, MessageBody, NodeId};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What a MEMBER_CHANGE_REQ did to local state.
enum SnapshotOutcome {
    Ignored,
    JoinAccepted,
    Changed(Vec<NodeId>, Vec<NodeId>),
    Readmit(NodeId),
}

/// Follow-up of a MAIN_HELLO_REQ.
enum HelloAction {
    Nothing,
    Join,
    Resync(NodeId),
    Relay(NodeId),
    Merge,
}

/// Follow-up of a membership removal.
enum DepartureAction {
    Nothing,
    Rebroadcast(Vec<NodeId>),
    Promote,
    Claim(Vec<NodeId>),
}

impl MembershipService {
    pub(crate) async fn receive_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown_signal();
        tracing::info!("Receive loop started on {}", self.local_addr());

        loop {
            tokio::select! {
                msg = self.transport.receive() => self.handle_message(msg).await,
                _ = shutdown.changed() => break,
            }
        }

        tracing::info!("Receive loop stopped");
    }

    pub(crate) async fn handle_message(self: &Arc<Self>, msg: Message) {
        if msg.sender.same_endpoint(self.local_id()) {
            return;
        }

        let (joined, joining) = {
            let state = self.state.read().await;
            (state.joined, state.joining)
        };
        if !joined {
            let allowed = matches!(msg.body, MessageBody::MainReq)
                || (joining && matches!(msg.body, MessageBody::MemberChangeReq { .. }));
            if !allowed {
                debug!(
                    "Ignoring {:?} from {} while not joined",
                    msg.body.message_type(),
                    msg.sender
                );
                return;
            }
        }

        debug!("Received {:?} from {}", msg.body.message_type(), msg.sender);

        let from = msg.sender;
        match msg.body {
            MessageBody::AddReq { size } => self.on_add_req(from, size).await,
            MessageBody::MemberChangeReqReq => self.on_member_change_req_req(from).await,
            MessageBody::MemberChangeReq { members } => self.on_member_change(from, members).await,
            MessageBody::MemberMergeReq { target, members } => {
                self.on_merge_req(from, target, members).await
            }
            MessageBody::MemberMergeRes { members } => self.on_merge_res(from, members).await,
            MessageBody::MainHelloReq { size } => self.on_main_hello(from, size as usize).await,
            MessageBody::MainReq => self.on_main_req(from).await,
            MessageBody::MainRes { defer } => self.on_main_res(from, defer).await,
            MessageBody::HelloReq => self.on_hello_req(from).await,
            MessageBody::HelloRes { valid, size } => {
                self.on_hello_res(from, valid, size as usize).await
            }
            MessageBody::ByeReq { departed } => self.on_bye(from, departed).await,
            MessageBody::AddReqReq { newcomer, size } => {
                self.on_add_req_req(from, newcomer, size as usize).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    async fn on_add_req(self: &Arc<Self>, from: NodeId, size: u32) {
        if self.is_client() {
            return;
        }

        let relay_to = {
            let state = self.state.read().await;
            if state.election.is_confirmed_main() {
                None
            } else if state.election.main {
                debug!("Deferring ADD_REQ from {} while leadership is in doubt", from);
                return;
            } else {
                state
                    .members
                    .first()
                    .filter(|leader| {
                        !leader.same_endpoint(self.local_id()) && !leader.same_endpoint(&from)
                    })
                    .cloned()
            }
        };

        match relay_to {
            None => self.admit(from).await,
            Some(leader) => {
                debug!("Relaying ADD_REQ from {} to leader {}", from, leader);
                self.send(
                    &leader,
                    MessageBody::AddReqReq {
                        newcomer: from,
                        size,
                    },
                )
                .await;
            }
        }
    }

    /// Admits a voting member or registers a client. Leader only.
    async fn admit(self: &Arc<Self>, newcomer: NodeId) {
        if newcomer.client {
            if !self.state.read().await.election.is_confirmed_main() {
                return;
            }
            for old in self.clients.register(&newcomer, Instant::now()) {
                info!("Client {} reconnected as {}", old, newcomer);
                self.transport.forget(&old);
            }
            let members = self.members().await;
            info!("Registered client {}", newcomer);
            self.send(&newcomer, MessageBody::MemberChangeReq { members })
                .await;
            return;
        }

        let (old, new) = {
            let mut state = self.state.write().await;
            if !state.election.is_confirmed_main() {
                return;
            }
            let old = state.members.snapshot();
            state.members.insert(newcomer.clone());
            (old, state.members.snapshot())
        };

        if old == new {
            // already a member: answer the requester alone
            self.send(&newcomer, MessageBody::MemberChangeReq { members: new })
                .await;
            return;
        }

        info!("Admitted {} ({} members)", newcomer, new.len());
        self.broadcast(MessageBody::MemberChangeReq {
            members: new.clone(),
        })
        .await;
        self.events.member_change(old, new);
    }

    async fn on_add_req_req(self: &Arc<Self>, from: NodeId, newcomer: NodeId, size: usize) {
        if self.is_client() || newcomer.same_endpoint(self.local_id()) {
            return;
        }

        let (main, my_size, leader) = {
            let state = self.state.read().await;
            (
                state.election.main,
                state.members.len(),
                state.members.first().cloned(),
            )
        };

        if !main {
            match leader {
                Some(leader) if leader.same_endpoint(&newcomer) => {
                    // the sender still follows this node: pass on the merge it missed
                    let members = self.members().await;
                    self.send(&from, MessageBody::MemberMergeRes { members })
                        .await;
                }
                Some(leader)
                    if !leader.same_endpoint(self.local_id()) && !leader.same_endpoint(&from) =>
                {
                    self.send(&leader, MessageBody::AddReqReq {
                        newcomer,
                        size: size as u32,
                    })
                    .await;
                }
                _ => {}
            }
            return;
        }

        if size <= 1 || newcomer.client {
            self.admit(newcomer).await;
            return;
        }

        // the newcomer leads a cluster of its own
        if outranks(size, &newcomer, my_size, self.local_id()) {
            self.request_merge(&newcomer).await;
        } else {
            self.send(&newcomer, MessageBody::MainHelloReq {
                size: my_size as u32,
            })
            .await;
        }
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    async fn on_member_change_req_req(self: &Arc<Self>, from: NodeId) {
        let members = {
            let state = self.state.read().await;
            if !state.election.is_confirmed_main() {
                return;
            }
            state.members.snapshot()
        };

        self.broadcast(MessageBody::MemberChangeReq {
            members: members.clone(),
        })
        .await;
        if from.client {
            self.send(&from, MessageBody::MemberChangeReq { members })
                .await;
        }
    }

    async fn on_member_change(self: &Arc<Self>, from: NodeId, members: Vec<NodeId>) {
        let me = self.local_id().clone();
        let accepts_self = me.client || members.contains(&me);

        let outcome = {
            let mut state = self.state.write().await;
            if state.joining {
                if accepts_self {
                    state.members.replace(members);
                    SnapshotOutcome::JoinAccepted
                } else {
                    SnapshotOutcome::Ignored
                }
            } else if state.rejoining && accepts_self {
                state.rejoining = false;
                let old = state.members.snapshot();
                state.members.replace(members);
                SnapshotOutcome::Changed(old, state.members.snapshot())
            } else if state.members.first() != members.first() {
                debug!("Ignoring snapshot from {} with a different leader", from);
                SnapshotOutcome::Ignored
            } else if !accepts_self {
                match members.first() {
                    Some(leader) => {
                        state.rejoining = true;
                        SnapshotOutcome::Readmit(leader.clone())
                    }
                    None => SnapshotOutcome::Ignored,
                }
            } else {
                let old = state.members.snapshot();
                if state.members.replace(members) {
                    SnapshotOutcome::Changed(old, state.members.snapshot())
                } else {
                    SnapshotOutcome::Ignored
                }
            }
        };

        match outcome {
            SnapshotOutcome::Ignored => {}
            SnapshotOutcome::JoinAccepted => self.membership_ready.notify_one(),
            SnapshotOutcome::Changed(old, new) => {
                info!("Membership updated from {}: {} members", from, new.len());
                self.membership_ready.notify_one();
                self.events.member_change(old, new);
            }
            SnapshotOutcome::Readmit(leader) => {
                warn!("Leader {} dropped this node, asking to be re-admitted", leader);
                self.send(&leader, MessageBody::AddReq { size: 1 }).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Split-brain merge
    // ------------------------------------------------------------------

    /// Marks doubt and hands this cluster's members to the winning `rival`.
    async fn request_merge(&self, rival: &NodeId) {
        let members = {
            let mut state = self.state.write().await;
            state.election.doubt = true;
            state.members.snapshot()
        };
        info!("Rival leader {} outranks this node, requesting merge", rival);
        self.send(rival, MessageBody::MemberMergeReq {
            target: rival.clone(),
            members,
        })
        .await;
    }

    async fn on_merge_req(self: &Arc<Self>, from: NodeId, target: NodeId, members: Vec<NodeId>) {
        if target != *self.local_id() {
            debug!("Ignoring merge request from {} addressed to {}", from, target);
            return;
        }

        let (old, new) = {
            let mut state = self.state.write().await;
            if !state.election.is_confirmed_main() {
                debug!("Not a confirmed leader, ignoring merge request from {}", from);
                return;
            }
            let old = state.members.snapshot();
            state.members.union(&members);
            (old, state.members.snapshot())
        };

        info!("Merged {} members from {}, now {}", members.len(), from, new.len());
        // sent even when nothing changed so the rival can settle
        self.broadcast(MessageBody::MemberMergeRes {
            members: new.clone(),
        })
        .await;
        self.events.member_change(old, new);
    }

    async fn on_merge_res(self: &Arc<Self>, from: NodeId, members: Vec<NodeId>) {
        let me = self.local_id().clone();

        let (old, new, demoted, readmit) = {
            let mut state = self.state.write().await;
            state.election.doubt = false;

            let leads = members.first() == Some(&me);
            let demoted = !leads && state.election.demote();
            if !leads {
                state.election.claim = None;
            }

            let old = state.members.snapshot();
            if !me.client && !members.contains(&me) {
                state.rejoining = true;
                (old.clone(), old, demoted, members.first().cloned())
            } else {
                state.members.replace(members);
                (old, state.members.snapshot(), demoted, None)
            }
        };

        if demoted {
            info!("{} leads the merged cluster, stepping down", from);
            self.events.publish(Event::ChangeSub);
        }
        self.events.member_change(old, new);
        if let Some(leader) = readmit {
            self.send(&leader, MessageBody::AddReq { size: 1 }).await;
        }
    }

    async fn on_main_hello(self: &Arc<Self>, from: NodeId, size: usize) {
        let me = self.local_id().clone();

        let action = {
            let mut state = self.state.write().await;
            let my_size = state.members.len();
            let leader = state.members.first().cloned();

            if me.client {
                if leader.is_none() {
                    state.rejoining = true;
                    HelloAction::Join
                } else if leader.as_ref() == Some(&from) && size != my_size {
                    HelloAction::Resync(from.clone())
                } else {
                    HelloAction::Nothing
                }
            } else if !state.election.main {
                if my_size <= 1 {
                    state.rejoining = true;
                    HelloAction::Join
                } else if leader.as_ref() == Some(&from) {
                    if size != my_size {
                        HelloAction::Resync(from.clone())
                    } else {
                        HelloAction::Nothing
                    }
                } else {
                    match leader {
                        Some(leader) if leader != me => HelloAction::Relay(leader),
                        _ => HelloAction::Nothing,
                    }
                }
            } else {
                let rival_wins = outranks(size, &from, my_size, &me);
                if state.election.doubt && !rival_wins {
                    info!("Rival {} does not outrank this node, doubt cleared", from);
                    state.election.doubt = false;
                    HelloAction::Nothing
                } else if rival_wins {
                    HelloAction::Merge
                } else {
                    HelloAction::Nothing
                }
            }
        };

        match action {
            HelloAction::Nothing => {}
            HelloAction::Join => {
                info!("Heard leader {}, asking to be admitted", from);
                self.send(&from, MessageBody::AddReq { size: 1 }).await;
            }
            HelloAction::Resync(leader) => {
                self.send(&leader, MessageBody::MemberChangeReqReq).await;
            }
            HelloAction::Relay(leader) => {
                debug!("Relaying rival leader {} to {}", from, leader);
                self.send(&leader, MessageBody::AddReqReq {
                    newcomer: from,
                    size: size as u32,
                })
                .await;
            }
            HelloAction::Merge => self.request_merge(&from).await,
        }
    }

    // ------------------------------------------------------------------
    // Leadership quorum
    // ------------------------------------------------------------------

    async fn on_main_req(&self, from: NodeId) {
        let defer = !self.state.read().await.election.main;
        self.send(&from, MessageBody::MainRes { defer }).await;
    }

    async fn on_main_res(self: &Arc<Self>, from: NodeId, defer: bool) {
        let progress = {
            let mut state = self.state.write().await;
            let progress = state.election.record_response(&from, defer);
            if progress == ClaimProgress::Granted {
                state.election.promote();
            }
            progress
        };

        match progress {
            ClaimProgress::Granted => self.assume_main().await,
            ClaimProgress::Refused => {
                info!("{} refused the leadership claim, resynchronising", from);
                self.send(&from, MessageBody::MemberChangeReqReq).await;
            }
            ClaimProgress::Waiting | ClaimProgress::Idle => {}
        }
    }

    /// Announces a freshly won leadership. `election.main` is already set.
    pub(crate) async fn assume_main(self: &Arc<Self>) {
        if !self.clients.is_empty() {
            debug!("Dropping {} clients registered before the takeover", self.clients.len());
            self.clients.clear();
        }
        let members = self.members().await;
        info!("{} is now leader of {} members", self.local_id(), members.len());

        self.broadcast(MessageBody::MemberMergeRes { members }).await;

        let ack = self.events.change_main();
        let service = Arc::clone(self);
        tokio::spawn(async move {
            match ack.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Listener rejected leadership, stepping down: {:#}", e);
                    service.state.write().await.election.demote();
                }
                Err(_) => debug!("Dispatcher stopped before leadership was acknowledged"),
            }
        });
    }

    // ------------------------------------------------------------------
    // Heartbeat messages
    // ------------------------------------------------------------------

    async fn on_hello_req(self: &Arc<Self>, from: NodeId) {
        if self.is_client() {
            return;
        }

        if from.client {
            let (confirmed, size) = {
                let state = self.state.read().await;
                (state.election.is_confirmed_main(), state.members.len())
            };
            if confirmed {
                for old in self.clients.register(&from, Instant::now()) {
                    info!("Client {} reconnected as {}", old, from);
                    self.transport.forget(&old);
                }
            }
            self.send(&from, MessageBody::HelloRes {
                valid: confirmed,
                size: size as u32,
            })
            .await;
            return;
        }

        let (valid, size) = {
            let mut state = self.state.write().await;
            let valid = state.members.predecessor(self.local_id()) == Some(&from);
            if valid {
                state.predecessor = Some((from.clone(), Instant::now()));
            }
            (valid, state.members.len())
        };

        self.send(&from, MessageBody::HelloRes {
            valid,
            size: size as u32,
        })
        .await;

        if !valid {
            debug!("Unexpected heartbeat from {}, resynchronising", from);
            self.resync().await;
        }
    }

    async fn on_hello_res(self: &Arc<Self>, from: NodeId, valid: bool, size: usize) {
        let my_size = {
            let mut state = self.state.write().await;
            if state.awaiting_hello.as_ref() == Some(&from) {
                state.hello_answered = true;
            }
            state.members.len()
        };
        self.hello_received.notify_one();

        if valid && size == my_size {
            return;
        }

        if self.is_client() && !valid {
            info!("Leader {} no longer recognises this client, re-registering", from);
            self.state.write().await.rejoining = true;
            self.broadcast(MessageBody::AddReq { size: 0 }).await;
        } else {
            debug!(
                "Heartbeat answer from {} disagrees (valid={}, size {} vs {})",
                from, valid, size, my_size
            );
            self.resync().await;
        }
    }

    /// Pulls or pushes a fresh snapshot after an inconsistency.
    async fn resync(&self) {
        let (confirmed, members) = {
            let state = self.state.read().await;
            (state.election.is_confirmed_main(), state.members.snapshot())
        };

        if confirmed {
            self.broadcast(MessageBody::MemberChangeReq { members }).await;
        } else if let Some(leader) = members.first()
            && !leader.same_endpoint(self.local_id())
        {
            self.send(leader, MessageBody::MemberChangeReqReq).await;
        }
    }

    // ------------------------------------------------------------------
    // Departures
    // ------------------------------------------------------------------

    async fn on_bye(self: &Arc<Self>, from: NodeId, departed: NodeId) {
        if departed == *self.local_id() {
            debug!("{} reported this node as departed, ignoring", from);
            return;
        }
        self.apply_departure(&departed).await;
    }

    /// Removes `departed` and takes over leadership if this node is now first.
    pub(crate) async fn apply_departure(self: &Arc<Self>, departed: &NodeId) {
        let me = self.local_id().clone();
        self.transport.forget(departed);

        if me.client {
            let (old, new) = {
                let mut state = self.state.write().await;
                let old = state.members.snapshot();
                state.members.remove(departed);
                (old, state.members.snapshot())
            };
            self.events.member_change(old, new);
            return;
        }

        if departed.client {
            if self.clients.remove(departed) {
                info!("Client {} left", departed);
            }
            return;
        }

        let (old, new, action) = {
            let mut state = self.state.write().await;
            if !state.joined {
                return;
            }

            let old = state.members.snapshot();
            let removed = state.members.remove(departed);
            if state
                .predecessor
                .as_ref()
                .is_some_and(|(predecessor, _)| predecessor == departed)
            {
                state.predecessor = None;
            }
            let forgotten = state.election.forget(departed);

            let action = if state.election.main {
                if removed {
                    DepartureAction::Rebroadcast(state.members.snapshot())
                } else {
                    DepartureAction::Nothing
                }
            } else if forgotten == ClaimProgress::Granted {
                state.election.promote();
                DepartureAction::Promote
            } else if state.members.is_first(&me) && !state.election.is_claiming() {
                if state.members.len() == 1 {
                    state.election.promote();
                    DepartureAction::Promote
                } else {
                    let pending: HashSet<NodeId> = state
                        .members
                        .as_slice()
                        .iter()
                        .filter(|member| **member != me)
                        .cloned()
                        .collect();
                    state.election.begin_claim(pending.clone(), Instant::now());
                    DepartureAction::Claim(pending.into_iter().collect())
                }
            } else {
                DepartureAction::Nothing
            };

            (old, state.members.snapshot(), action)
        };

        if old != new {
            info!("{} departed, {} members remain", departed, new.len());
            self.events.member_change(old, new);
        }

        match action {
            DepartureAction::Nothing => {}
            DepartureAction::Rebroadcast(members) => {
                self.broadcast(MessageBody::MemberChangeReq { members }).await;
            }
            DepartureAction::Promote => self.assume_main().await,
            DepartureAction::Claim(pending) => {
                info!("First in the ring, claiming leadership from {} members", pending.len());
                for member in &pending {
                    self.send(member, MessageBody::MainReq).await;
                }
            }
        }
    }
}
