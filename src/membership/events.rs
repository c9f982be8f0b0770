//! Listener notifications.
//!
//! The protocol engine never calls listeners itself: it pushes `Event`s onto an
//! unbounded queue that a dedicated task drains, so a slow listener delays
//! only other listeners, never membership traffic.

use super::types::NodeId;

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, oneshot, watch};

/// Callbacks for membership and leadership changes.
///
/// Errors from `member_init`, `member_change` and `change_sub` are logged and
/// swallowed. An error from `change_main` aborts the promotion.
pub trait MembershipListener: Send + Sync {
    fn member_init(&self, _self_id: Option<&NodeId>, _members: &[NodeId]) -> Result<()> {
        Ok(())
    }

    fn member_change(&self, _old: &[NodeId], _new: &[NodeId]) -> Result<()> {
        Ok(())
    }

    fn change_main(&self) -> Result<()> {
        Ok(())
    }

    fn change_sub(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub enum Event {
    MemberInit {
        self_id: Option<NodeId>,
        members: Vec<NodeId>,
    },
    MemberChange {
        old: Vec<NodeId>,
        new: Vec<NodeId>,
    },
    ChangeMain {
        ack: oneshot::Sender<Result<()>>,
    },
    ChangeSub,
}

pub type ListenerList = Arc<RwLock<Vec<Arc<dyn MembershipListener>>>>;

#[derive(Clone)]
pub struct EventDispatcher {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: Event) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event dispatcher stopped, dropping event");
        }
    }

    pub fn member_change(&self, old: Vec<NodeId>, new: Vec<NodeId>) {
        if old != new {
            self.publish(Event::MemberChange { old, new });
        }
    }

    /// Queues a ChangeMain; the receiver resolves once every listener accepted
    /// or one of them failed.
    pub fn change_main(&self) -> oneshot::Receiver<Result<()>> {
        let (ack, rx) = oneshot::channel();
        self.publish(Event::ChangeMain { ack });
        rx
    }
}

fn log_failure(callback: &str, result: Result<()>) {
    if let Err(e) = result {
        tracing::error!("Listener {} failed: {:#}", callback, e);
    }
}

pub async fn dispatch(listeners: &ListenerList, event: Event) {
    let listeners = listeners.read().await.clone();

    match event {
        Event::MemberInit { self_id, members } => {
            for listener in &listeners {
                log_failure("member_init", listener.member_init(self_id.as_ref(), &members));
            }
        }
        Event::MemberChange { old, new } => {
            for listener in &listeners {
                log_failure("member_change", listener.member_change(&old, &new));
            }
        }
        Event::ChangeMain { ack } => {
            let mut outcome = Ok(());
            for listener in &listeners {
                if let Err(e) = listener.change_main() {
                    outcome = Err(e);
                    break;
                }
            }
            // nobody waiting means the promotion was already abandoned
            let _ = ack.send(outcome);
        }
        Event::ChangeSub => {
            for listener in &listeners {
                log_failure("change_sub", listener.change_sub());
            }
        }
    }
}

pub async fn dispatch_loop(
    listeners: ListenerList,
    mut rx: mpsc::UnboundedReceiver<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!("Event dispatcher started");

    loop {
        tokio::select! {
            // queued events are delivered before shutdown is honoured
            biased;
            event = rx.recv() => match event {
                Some(event) => dispatch(&listeners, event).await,
                None => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!("Event dispatcher stopped");
}
