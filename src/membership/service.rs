use super::config::MembershipConfig;
use super::events::{self, Event, EventDispatcher, ListenerList, MembershipListener};
use super::store::{ClientRegistry, ClusterState};
use super::transport::{MembershipSource, StaticSource, Transport};
use super::types::{Message, MessageBody, NodeId};

use anyhow::Result;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

/// One member of the cluster: owns the socket, the shared state and the
/// receive / heartbeat / dispatch tasks.
pub struct MembershipService {
    pub(crate) config: MembershipConfig,
    pub(crate) transport: Transport,
    pub(crate) state: RwLock<ClusterState>,
    pub(crate) clients: ClientRegistry,
    pub(crate) events: EventDispatcher,
    listeners: ListenerList,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    /// Signalled whenever a membership snapshot is accepted during (re)join.
    pub(crate) membership_ready: Notify,
    /// Signalled whenever the awaited HELLO_RES arrives.
    pub(crate) hello_received: Notify,
    pub(crate) heartbeat_enabled: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MembershipService {
    pub async fn new(
        config: MembershipConfig,
        source: Arc<dyn MembershipSource>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let transport = Transport::bind(&config, source).await?;
        let (events, event_rx) = EventDispatcher::new();
        let (heartbeat_enabled, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            transport,
            state: RwLock::new(ClusterState::new()),
            clients: ClientRegistry::new(),
            events,
            listeners: Arc::new(RwLock::new(Vec::new())),
            event_rx: Mutex::new(Some(event_rx)),
            membership_ready: Notify::new(),
            hello_received: Notify::new(),
            heartbeat_enabled,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Uses `config.seeds` as a static discovery list.
    pub async fn with_seeds(config: MembershipConfig) -> Result<Arc<Self>> {
        let source = Arc::new(StaticSource::new(config.seeds.clone()));
        Self::new(config, source).await
    }

    pub async fn add_listener(&self, listener: Arc<dyn MembershipListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Spawns the receive, heartbeat and event-dispatch tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let Some(event_rx) = self.event_rx.lock().await.take() else {
            anyhow::bail!("membership service already started");
        };

        tracing::info!("Starting membership service on {}", self.local_addr());

        // the dispatcher is left to drain its queue on shutdown
        tokio::spawn(events::dispatch_loop(
            self.listeners.clone(),
            event_rx,
            self.shutdown.subscribe(),
        ));

        let mut tasks = self.tasks.lock().await;
        tasks.push({
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        });
        tasks.push({
            let service = self.clone();
            tokio::spawn(async move {
                service.heartbeat_loop().await;
            })
        });

        tracing::info!("All background tasks started");
        Ok(())
    }

    /// Joins the cluster, or founds it when nobody answers.
    pub async fn join(self: &Arc<Self>) -> Result<()> {
        if self.event_rx.lock().await.is_some() {
            anyhow::bail!("start() must be called before join()");
        }
        if self.transport.discovery_addresses().is_empty() {
            anyhow::bail!("no discovery addresses configured");
        }

        let me = self.local_id().clone();
        {
            let mut state = self.state.write().await;
            if state.joined {
                return Ok(());
            }
            state.members.clear();
            state.joining = true;
        }

        let attempts = self.config.add_member_retry_count + 1;
        for attempt in 1..=attempts {
            self.broadcast(MessageBody::AddReq { size: 0 }).await;
            if self
                .wait_for_snapshot(self.add_member_wait(), |state| !state.members.is_empty())
                .await
            {
                break;
            }
            tracing::debug!(
                "No membership answer to ADD_REQ (attempt {}/{})",
                attempt,
                attempts
            );
        }

        let (members, founding) = {
            let mut state = self.state.write().await;
            state.joining = false;
            let founding = !me.client
                && (state.members.is_empty() || state.members.is_first(&me));
            if founding {
                state.members.insert(me.clone());
                state.election.promote();
            }
            state.joined = true;
            (state.members.snapshot(), founding)
        };

        self.events.publish(Event::MemberInit {
            self_id: (!me.client).then(|| me.clone()),
            members: members.clone(),
        });

        if founding {
            info!("No cluster found, {} founded one and leads it", me);
            let outcome = match self.events.change_main().await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::anyhow!("event dispatcher stopped during join")),
            };
            if let Err(e) = outcome {
                let mut state = self.state.write().await;
                state.election.demote();
                state.joined = false;
                state.members.clear();
                return Err(e.context("listener rejected leadership"));
            }
        } else if me.client {
            info!("Client {} joined, {} members visible", me, members.len());
        } else {
            info!("{} joined as follower of {} members", me, members.len());
            self.events.publish(Event::ChangeSub);
        }

        self.heartbeat_enabled.send_replace(true);
        Ok(())
    }

    /// Leaves the cluster gracefully. Peers are told with a best-effort BYE.
    pub async fn leave(&self) {
        self.heartbeat_enabled.send_replace(false);

        let me = self.local_id().clone();
        let (joined, leader) = {
            let state = self.state.read().await;
            (state.joined, state.members.first().cloned())
        };
        if !joined {
            return;
        }

        let bye = MessageBody::ByeReq {
            departed: me.clone(),
        };
        if me.client {
            if let Some(leader) = leader {
                self.send(&leader, bye).await;
            }
        } else {
            self.broadcast(bye).await;
        }

        let (old, new, was_main) = {
            let mut state = self.state.write().await;
            let old = state.members.snapshot();
            if me.client {
                state.members.clear();
            } else {
                state.members.replace(vec![me.clone()]);
            }
            state.joined = false;
            state.joining = false;
            state.rejoining = false;
            state.predecessor = None;
            state.finish_hello();
            let was_main = state.election.demote();
            (old, state.members.snapshot(), was_main)
        };
        self.clients.clear();

        info!("{} left the cluster", me);
        self.events.member_change(old, new);
        if was_main {
            self.events.publish(Event::ChangeSub);
        }
    }

    /// Leaves with a bounded wait, then stops every task.
    pub async fn stop(&self) {
        if tokio::time::timeout(self.config.shutdown_timeout(), self.leave())
            .await
            .is_err()
        {
            tracing::warn!("Leave did not finish within {:?}", self.config.shutdown_timeout());
        }
        self.shutdown().await;

        let mut state = self.state.write().await;
        state.members.clear();
        self.clients.clear();
    }

    /// Stops every task without telling peers, as a crash would.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        self.heartbeat_enabled.send_replace(false);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        tracing::info!("Membership service on {} stopped", self.local_addr());
    }

    pub fn local_id(&self) -> &NodeId {
        self.transport.local_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn is_client(&self) -> bool {
        self.local_id().client
    }

    pub async fn members(&self) -> Vec<NodeId> {
        self.state.read().await.members.snapshot()
    }

    pub async fn leader(&self) -> Option<NodeId> {
        self.state.read().await.members.first().cloned()
    }

    pub fn clients(&self) -> Vec<NodeId> {
        self.clients.snapshot()
    }

    pub async fn is_main(&self) -> bool {
        self.state.read().await.election.main
    }

    pub async fn is_main_doubt(&self) -> bool {
        self.state.read().await.election.doubt
    }

    pub async fn is_joined(&self) -> bool {
        self.state.read().await.joined
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn add_member_wait(&self) -> Duration {
        let base = self.config.add_member_response_timeout();
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 10);
        base + Duration::from_millis(jitter_ms)
    }

    /// Waits up to `wait` for `accepted` to hold, re-checking on every snapshot.
    pub(crate) async fn wait_for_snapshot(
        &self,
        wait: Duration,
        accepted: impl Fn(&ClusterState) -> bool,
    ) -> bool {
        tokio::time::timeout(wait, async {
            loop {
                let done = accepted(&*self.state.read().await);
                if done {
                    return;
                }
                self.membership_ready.notified().await;
            }
        })
        .await
        .is_ok()
    }

    pub(crate) fn message(&self, body: MessageBody) -> Message {
        Message::new(self.local_id().clone(), body)
    }

    pub(crate) async fn send(&self, to: &NodeId, body: MessageBody) {
        self.transport.send(&self.message(body), to).await;
    }

    /// Sends to the discovery addresses, every member and every client.
    pub(crate) async fn broadcast(&self, body: MessageBody) {
        let mut known: Vec<SocketAddr> = self
            .state
            .read()
            .await
            .members
            .as_slice()
            .iter()
            .map(|member| member.addr)
            .collect();
        known.extend(self.clients.snapshot().iter().map(|client| client.addr));

        self.transport.broadcast(&self.message(body), &known).await;
    }
}
