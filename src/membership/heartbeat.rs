//! Heartbeat daemon.
//!
//! Every interval a voting member pings its ring successor and watches its
//! predecessor; the leader also announces itself with MAIN_HELLO_REQ and
//! expires silent clients. Clients ping the leader instead.

use super::service::MembershipService;
use super::types::{MessageBody, NodeId};

use std::sync::Arc;
use std::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Consecutive unanswered heartbeats, counted per target.
#[derive(Debug, Default)]
pub(crate) struct MissCounter {
    target: Option<NodeId>,
    count: u32,
}

impl MissCounter {
    pub(crate) fn reset(&mut self) {
        self.target = None;
        self.count = 0;
    }

    /// Restarts the count when the target changed; returns the new count.
    pub(crate) fn miss(&mut self, target: &NodeId) -> u32 {
        if self.target.as_ref() != Some(target) {
            self.target = Some(target.clone());
            self.count = 0;
        }
        self.count += 1;
        self.count
    }
}

impl MembershipService {
    pub(crate) async fn heartbeat_loop(self: Arc<Self>) {
        let mut enabled = self.heartbeat_enabled.subscribe();
        let mut shutdown = self.shutdown_signal();
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut misses = MissCounter::default();

        tracing::info!(
            "Heartbeat loop started (interval {:?})",
            self.config.heartbeat_interval()
        );

        loop {
            // suspended until join() enables it, and again after leave()
            loop {
                let on = *enabled.borrow_and_update();
                if on {
                    break;
                }
                misses.reset();
                tokio::select! {
                    changed = enabled.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }

            tokio::select! {
                _ = interval.tick() => {}
                _ = enabled.changed() => continue,
                _ = shutdown.changed() => return,
            }

            tokio::select! {
                _ = self.tick(&mut misses) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn tick(self: &Arc<Self>, misses: &mut MissCounter) {
        if self.is_client() {
            self.client_tick(misses).await;
        } else {
            self.member_tick(misses).await;
        }
    }

    pub(crate) async fn member_tick(self: &Arc<Self>, misses: &mut MissCounter) {
        let me = self.local_id().clone();
        let window = self.config.silence_window();
        let now = Instant::now();

        let (main, size, stale_claim) = {
            let mut state = self.state.write().await;
            (
                state.election.main,
                state.members.len(),
                state.election.stale_claim(window, now),
            )
        };

        if main {
            self.broadcast(MessageBody::MainHelloReq { size: size as u32 })
                .await;
            for client in self.clients.prune(window, now) {
                info!("Client {} silent for more than {:?}, dropped", client, window);
                self.transport.forget(&client);
            }
        }

        if let Some(pending) = stale_claim {
            debug!("Leadership claim unanswered, asking {} members again", pending.len());
            for member in &pending {
                self.send(member, MessageBody::MainReq).await;
            }
        }

        if let Some(predecessor) = self.silent_predecessor(&me, window, now).await {
            warn!("Predecessor {} silent for more than {:?}, removing it", predecessor, window);
            self.broadcast(MessageBody::ByeReq {
                departed: predecessor.clone(),
            })
            .await;
            self.apply_departure(&predecessor).await;
        }

        let successor = self.state.read().await.members.successor(&me).cloned();
        let Some(successor) = successor else {
            misses.reset();
            return;
        };

        if self.ping(&successor).await {
            misses.reset();
            return;
        }

        let missed = misses.miss(&successor);
        debug!("Successor {} missed heartbeat ({} in a row)", successor, missed);
        if missed > self.config.heartbeat_retry_count {
            misses.reset();
            warn!("Successor {} stopped answering heartbeats, removing it", successor);
            self.broadcast(MessageBody::ByeReq {
                departed: successor.clone(),
            })
            .await;
            self.apply_departure(&successor).await;
        }
    }

    /// Tracks the ring predecessor; returns it once it has been silent too long.
    async fn silent_predecessor(
        &self,
        me: &NodeId,
        window: std::time::Duration,
        now: Instant,
    ) -> Option<NodeId> {
        let mut state = self.state.write().await;
        let Some(current) = state.members.predecessor(me).cloned() else {
            state.predecessor = None;
            return None;
        };

        let heard = state
            .predecessor
            .as_ref()
            .filter(|(known, _)| *known == current)
            .map(|(_, heard)| *heard);

        match heard {
            Some(heard) if now.saturating_duration_since(heard) > window => Some(current),
            Some(_) => None,
            None => {
                // new neighbour: start its clock now
                state.predecessor = Some((current, now));
                None
            }
        }
    }

    async fn client_tick(self: &Arc<Self>, misses: &mut MissCounter) {
        let Some(leader) = self.leader().await else {
            misses.reset();
            self.bootstrap_client().await;
            return;
        };

        if self.ping(&leader).await {
            misses.reset();
            return;
        }

        if misses.miss(&leader) <= self.config.heartbeat_retry_count {
            return;
        }

        misses.reset();
        warn!("Leader {} unresponsive, looking for a new one", leader);
        if !self.bootstrap_client().await {
            let old = {
                let mut state = self.state.write().await;
                let old = state.members.snapshot();
                state.members.clear();
                old
            };
            info!("No leader answered, membership view cleared");
            self.events.member_change(old, Vec::new());
        }
    }

    /// Broadcasts ADD_REQ and waits one add-member timeout for a snapshot.
    async fn bootstrap_client(&self) -> bool {
        self.state.write().await.rejoining = true;
        self.broadcast(MessageBody::AddReq { size: 0 }).await;

        let accepted = self
            .wait_for_snapshot(self.config.add_member_response_timeout(), |state| {
                !state.rejoining
            })
            .await;
        if !accepted {
            self.state.write().await.rejoining = false;
        }
        accepted
    }

    /// Sends HELLO_REQ to `target` and waits for its answer.
    async fn ping(&self, target: &NodeId) -> bool {
        {
            let mut state = self.state.write().await;
            state.awaiting_hello = Some(target.clone());
            state.hello_answered = false;
        }
        self.send(target, MessageBody::HelloReq).await;

        let answered = tokio::time::timeout(self.config.heartbeat_response_timeout(), async {
            loop {
                let answered = self.state.read().await.hello_answered;
                if answered {
                    return;
                }
                self.hello_received.notified().await;
            }
        })
        .await
        .is_ok();

        self.state.write().await.finish_hello() || answered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(port: u16) -> NodeId {
        NodeId::new(([10, 0, 0, 1], port).into(), false, vec![])
    }

    #[test]
    fn test_misses_accumulate_for_the_same_target() {
        let mut misses = MissCounter::default();
        assert_eq!(misses.miss(&node(1)), 1);
        assert_eq!(misses.miss(&node(1)), 2);
        assert_eq!(misses.miss(&node(1)), 3);
    }

    #[test]
    fn test_new_target_starts_from_one() {
        let mut misses = MissCounter::default();
        misses.miss(&node(1));
        misses.miss(&node(1));

        assert_eq!(misses.miss(&node(2)), 1);
        assert_eq!(misses.miss(&node(1)), 1);
    }

    #[test]
    fn test_reset_clears_count() {
        let mut misses = MissCounter::default();
        misses.miss(&node(1));
        misses.miss(&node(1));
        misses.reset();

        assert_eq!(misses.miss(&node(1)), 1);
    }
}
