use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use foldhash::fast::RandomState;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::{
    BusEvent, BusMessage, EventReceiver, Mailbox, Membership, MembershipReason, MessageKind,
};
use crate::error::{Error, ErrorKind, Result};

/// In-process group bus.
///
/// Members connect under a name and get the private group
/// `#<name>#local`. Delivery is reliable and ordered per sender, members
/// receive their own multicasts, and every member of a group is told
/// about joins, leaves and disconnects of that group.
#[derive(Clone, Default)]
pub struct LocalBus(Arc<LocalBusState>);

#[derive(Default)]
struct LocalBusState {
    members: DashMap<String, mpsc::UnboundedSender<BusEvent>, RandomState>,
    groups: DashMap<String, Vec<String>, RandomState>,
}

impl LocalBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` if a member with this name is connected.
    pub fn connect(&self, name: &str) -> Result<(LocalMailbox, EventReceiver)> {
        let private_group = format!("#{name}#local");
        let (tx, rx) = mpsc::unbounded_channel();
        match self.0.members.entry(private_group.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::new(
                    ErrorKind::InvalidArgument,
                    format!("{private_group} is already connected"),
                ));
            }
            Entry::Vacant(entry) => {
                entry.insert(tx);
            }
        }
        tracing::debug!("{private_group} connected");

        let mailbox = LocalMailbox {
            bus: self.clone(),
            private_group,
        };
        Ok((mailbox, rx))
    }

    #[must_use]
    pub fn members(&self, group: &str) -> Vec<String> {
        self.0
            .groups
            .get(group)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    fn deliver(&self, member: &str, event: BusEvent) {
        if let Some(tx) = self.0.members.get(member) {
            // a closed receiver means the member is going away
            let _ = tx.send(event);
        }
    }

    fn notify(&self, group: &str, reason: MembershipReason, changed: &str) {
        let members = self.members(group);
        for member in &members {
            self.deliver(
                member,
                BusEvent::Membership(Membership {
                    group: group.to_string(),
                    reason,
                    changed: vec![changed.to_string()],
                    members: members.clone(),
                }),
            );
        }
    }

    fn remove_member(&self, group: &str, member: &str) -> bool {
        let mut removed = false;
        if let Some(mut members) = self.0.groups.get_mut(group) {
            let before = members.len();
            members.retain(|m| m != member);
            removed = members.len() != before;
        }
        self.0.groups.remove_if(group, |_, members| members.is_empty());
        removed
    }
}

pub struct LocalMailbox {
    bus: LocalBus,
    private_group: String,
}

impl Mailbox for LocalMailbox {
    fn private_group(&self) -> &str {
        &self.private_group
    }

    fn join(&self, group: &str) -> Result<()> {
        if group.starts_with('#') {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("cannot join private group {group}"),
            ));
        }
        {
            let mut members = self.bus.0.groups.entry(group.to_string()).or_default();
            if members.contains(&self.private_group) {
                return Ok(());
            }
            members.push(self.private_group.clone());
        }
        self.bus
            .notify(group, MembershipReason::Join, &self.private_group);
        Ok(())
    }

    fn leave(&self, group: &str) -> Result<()> {
        if self.bus.remove_member(group, &self.private_group) {
            self.bus
                .notify(group, MembershipReason::Leave, &self.private_group);
        }
        Ok(())
    }

    fn multicast(&self, groups: &[&str], kind: MessageKind, payload: Bytes) -> Result<()> {
        let mut recipients: Vec<String> = vec![];
        for group in groups {
            let members = if self.bus.0.members.contains_key(*group) {
                vec![(*group).to_string()]
            } else {
                self.bus.members(group)
            };
            for member in members {
                if !recipients.contains(&member) {
                    recipients.push(member);
                }
            }
        }
        if recipients.is_empty() {
            tracing::trace!("multicast to {groups:?} reached nobody");
        }

        let message = BusMessage {
            sender: self.private_group.clone(),
            groups: groups.iter().map(ToString::to_string).collect(),
            kind,
            payload,
        };
        for member in &recipients {
            self.bus.deliver(member, BusEvent::Message(message.clone()));
        }
        Ok(())
    }
}

impl Drop for LocalMailbox {
    fn drop(&mut self) {
        self.bus.0.members.remove(&self.private_group);
        let groups: Vec<String> = self
            .bus
            .0
            .groups
            .iter()
            .filter(|entry| entry.value().contains(&self.private_group))
            .map(|entry| entry.key().clone())
            .collect();
        for group in groups {
            if self.bus.remove_member(&group, &self.private_group) {
                self.bus
                    .notify(&group, MembershipReason::Disconnect, &self.private_group);
            }
        }
        tracing::debug!("{} disconnected", self.private_group);
    }
}

impl std::fmt::Debug for LocalMailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMailbox")
            .field("private_group", &self.private_group)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_group_delivery() {
        let bus = LocalBus::new();
        let (alice, mut alice_rx) = bus.connect("alice").unwrap();
        let (bob, mut bob_rx) = bus.connect("bob").unwrap();
        assert!(bus.connect("bob").is_err());

        alice.join("workers").unwrap();
        bob.join("workers").unwrap();
        assert_eq!(bus.members("workers"), ["#alice#local", "#bob#local"]);

        let BusEvent::Membership(join) = alice_rx.recv().await.unwrap() else {
            panic!("expected membership");
        };
        assert_eq!(join.reason, MembershipReason::Join);
        assert_eq!(join.members, ["#alice#local"]);

        bob.multicast(&["#alice#local"], 7, Bytes::from_static(b"hi"))
            .unwrap();
        // alice first sees bob joining, then the private message
        assert!(matches!(
            alice_rx.recv().await.unwrap(),
            BusEvent::Membership(_)
        ));
        let BusEvent::Message(msg) = alice_rx.recv().await.unwrap() else {
            panic!("expected message");
        };
        assert_eq!(msg.sender, "#bob#local");
        assert_eq!(msg.kind, 7);

        drop(alice);
        assert_eq!(bus.members("workers"), ["#bob#local"]);
        let mut saw_disconnect = false;
        while let Ok(event) = bob_rx.try_recv() {
            if let BusEvent::Membership(m) = event {
                saw_disconnect |= m.reason == MembershipReason::Disconnect;
            }
        }
        assert!(saw_disconnect);
    }
}
