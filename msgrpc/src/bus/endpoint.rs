use bytes::Bytes;
use dashmap::DashMap;
use foldhash::fast::RandomState;
use std::sync::{
    Arc, Weak,
    atomic::{AtomicU64, Ordering},
};

use super::{BusEvent, BusMessage, EventReceiver, Mailbox, Membership, MembershipReason, MessageKind};
use crate::{
    TaskSupervisor,
    error::{Error, ErrorKind, Result},
};

pub type KindHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Identifies one registered handler so its owner can remove just that one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct KindHandlers {
    exclusive: bool,
    handlers: Vec<(HandlerId, KindHandler)>,
}

/// One member's connection to the bus.
///
/// Runs a single receive loop that hands each message to every handler
/// registered for its kind. Membership notifications stop here: they
/// update the member lists of joined groups and are never given to a
/// handler.
pub struct BusEndpoint<M: Mailbox> {
    mailbox: M,
    handlers: DashMap<MessageKind, KindHandlers, RandomState>,
    next_handler: AtomicU64,
    groups: DashMap<String, Vec<String>, RandomState>,
    task_supervisor: TaskSupervisor,
}

impl<M: Mailbox> BusEndpoint<M> {
    pub fn start(mailbox: M, events: EventReceiver) -> Arc<Self> {
        let endpoint = Arc::new(Self {
            mailbox,
            handlers: DashMap::default(),
            next_handler: AtomicU64::default(),
            groups: DashMap::default(),
            task_supervisor: TaskSupervisor::create(),
        });
        tracing::info!("bus endpoint {} started", endpoint.private_group());
        endpoint
            .task_supervisor
            .spawn("bus receive loop", Self::receive_loop(Arc::downgrade(&endpoint), events));
        endpoint
    }

    async fn receive_loop(endpoint: Weak<Self>, mut events: EventReceiver) {
        while let Some(event) = events.recv().await {
            let Some(this) = endpoint.upgrade() else {
                break;
            };
            this.receive(event);
        }
    }

    /// Routes one inbound event.
    pub fn receive(&self, event: BusEvent) {
        match event {
            BusEvent::Membership(membership) => self.receive_membership(membership),
            BusEvent::Message(msg) => {
                let handlers: Vec<KindHandler> = self
                    .handlers
                    .get(&msg.kind)
                    .map(|entry| entry.handlers.iter().map(|(_, h)| h.clone()).collect())
                    .unwrap_or_default();
                match handlers.split_last() {
                    Some((last, rest)) => {
                        for handler in rest {
                            handler(msg.clone());
                        }
                        last(msg);
                    }
                    None => {
                        tracing::trace!("drop message of kind {} from {}", msg.kind, msg.sender);
                    }
                }
            }
        }
    }

    fn receive_membership(&self, membership: Membership) {
        let Some(mut members) = self.groups.get_mut(&membership.group) else {
            return;
        };
        match membership.reason {
            MembershipReason::Join => {
                tracing::info!("{:?} joined {}", membership.changed, membership.group);
            }
            MembershipReason::Leave | MembershipReason::Disconnect => {
                tracing::info!("{:?} left {}", membership.changed, membership.group);
            }
            MembershipReason::Network | MembershipReason::Transitional => {}
        }
        *members = membership.members;
    }

    /// Adds a handler for `kind` next to any others; each one sees every
    /// message of that kind.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `kind` is held by an exclusive handler.
    pub fn register(
        &self,
        kind: MessageKind,
        handler: impl Fn(BusMessage) + Send + Sync + 'static,
    ) -> Result<HandlerId> {
        self.insert(kind, false, Arc::new(handler))
    }

    /// Adds the only handler of `kind`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` when `kind` already has a handler.
    pub fn register_exclusive(
        &self,
        kind: MessageKind,
        handler: impl Fn(BusMessage) + Send + Sync + 'static,
    ) -> Result<HandlerId> {
        self.insert(kind, true, Arc::new(handler))
    }

    fn insert(&self, kind: MessageKind, exclusive: bool, handler: KindHandler) -> Result<HandlerId> {
        let mut entry = self.handlers.entry(kind).or_default();
        if entry.exclusive || (exclusive && !entry.handlers.is_empty()) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("message kind {kind} is already handled on {}", self.private_group()),
            ));
        }
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        entry.exclusive = exclusive;
        entry.handlers.push((id, handler));
        Ok(id)
    }

    /// Removes the handler `id` of `kind`, leaving other handlers in place.
    pub fn remove(&self, kind: MessageKind, id: HandlerId) -> bool {
        let mut removed = false;
        if let Some(mut entry) = self.handlers.get_mut(&kind) {
            let before = entry.handlers.len();
            entry.handlers.retain(|(handler, _)| *handler != id);
            removed = entry.handlers.len() < before;
        }
        self.handlers
            .remove_if(&kind, |_, entry| entry.handlers.is_empty());
        removed
    }

    /// Number of handlers registered for `kind`.
    #[must_use]
    pub fn handlers(&self, kind: MessageKind) -> usize {
        self.handlers
            .get(&kind)
            .map_or(0, |entry| entry.handlers.len())
    }

    #[must_use]
    pub fn private_group(&self) -> &str {
        self.mailbox.private_group()
    }

    /// # Errors
    ///
    /// Fails when the bus rejects the join.
    pub fn join_group(&self, group: &str) -> Result<()> {
        tracing::info!("joining {group}");
        self.groups.entry(group.to_string()).or_default();
        self.mailbox.join(group).inspect_err(|_| {
            self.groups.remove(group);
        })
    }

    /// # Errors
    ///
    /// Fails when the bus rejects the leave.
    pub fn leave_group(&self, group: &str) -> Result<()> {
        self.groups.remove(group);
        self.mailbox.leave(group)
    }

    /// Last known members of a joined group.
    #[must_use]
    pub fn members(&self, group: &str) -> Vec<String> {
        self.groups
            .get(group)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    /// # Errors
    ///
    /// Fails when the bus cannot take the message.
    pub fn send(&self, groups: &[&str], kind: MessageKind, payload: Bytes) -> Result<()> {
        self.mailbox.multicast(groups, kind, payload)
    }

    pub fn stop(&self) {
        self.task_supervisor.stop();
    }

    pub async fn join(&self) {
        self.task_supervisor.all_stopped().await;
    }
}

impl<M: Mailbox> std::fmt::Debug for BusEndpoint<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusEndpoint")
            .field("private_group", &self.private_group())
            .field("kinds", &self.handlers.iter().map(|h| *h.key()).collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_routes_by_kind_and_tracks_members() {
        let bus = LocalBus::new();
        let (mailbox, events) = bus.connect("a").unwrap();
        let endpoint = BusEndpoint::start(mailbox, events);
        let (other, _other_events) = bus.connect("b").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        endpoint
            .register(42, move |msg| {
                let _ = tx.send(msg);
            })
            .unwrap();
        endpoint.join_group("room").unwrap();
        other.join("room").unwrap();

        other
            .multicast(&["room"], 42, Bytes::from_static(b"one"))
            .unwrap();
        other
            .multicast(&["room"], 43, Bytes::from_static(b"ignored"))
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(&msg.payload[..], b"one");
        assert_eq!(msg.sender, "#b#local");

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(endpoint.members("room"), ["#a#local", "#b#local"]);

        drop(other);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(endpoint.members("room"), ["#a#local"]);

        endpoint.stop();
        endpoint.join().await;
    }

    #[tokio::test]
    async fn test_handlers_share_a_kind_and_remove_only_their_own() {
        let bus = LocalBus::new();
        let (mailbox, events) = bus.connect("a").unwrap();
        let endpoint = BusEndpoint::start(mailbox, events);
        let (other, _other_events) = bus.connect("b").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = endpoint
            .register(7, {
                let tx = tx.clone();
                move |_| {
                    let _ = tx.send("first");
                }
            })
            .unwrap();
        let second = endpoint
            .register(7, move |_| {
                let _ = tx.send("second");
            })
            .unwrap();
        assert_eq!(endpoint.handlers(7), 2);
        let err = endpoint.register_exclusive(7, |_| {}).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        other
            .multicast(&["#a#local"], 7, Bytes::from_static(b"x"))
            .unwrap();
        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort_unstable();
        assert_eq!(seen, ["first", "second"]);

        assert!(endpoint.remove(7, first));
        assert!(!endpoint.remove(7, first));
        other
            .multicast(&["#a#local"], 7, Bytes::from_static(b"y"))
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), "second");

        assert!(endpoint.remove(7, second));
        assert_eq!(endpoint.handlers(7), 0);
        let owner = endpoint.register_exclusive(7, |_| {}).unwrap();
        let err = endpoint.register(7, |_| {}).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(endpoint.remove(7, owner));
    }
}
