//! Correlated request/reply over a group-messaging bus.
//!
//! The bus itself is consumed through [`Mailbox`] (outbound primitives)
//! and an [`EventReceiver`] (inbound messages and membership changes).
//! [`LocalBus`] is an in-process implementation of both.
//!
//! Wire payloads of the two RPC message kinds are
//! `correlation id (16 bytes) || encoded envelope`.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

mod client;
pub use client::{BusClient, BusTransport};

mod endpoint;
pub use endpoint::{BusEndpoint, HandlerId, KindHandler};

mod local;
pub use local::{LocalBus, LocalMailbox};

mod server;
pub use server::BusServer;

/// Application-level type tag of a bus message.
pub type MessageKind = i16;

/// Kind tag of RPC request frames.
pub const RPC_REQUEST: MessageKind = 1000;
/// Kind tag of RPC reply frames.
pub const RPC_REPLY: MessageKind = 1001;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Private group of the sending member.
    pub sender: String,
    /// Groups the message was addressed to.
    pub groups: Vec<String>,
    pub kind: MessageKind,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipReason {
    Join,
    Leave,
    Disconnect,
    Network,
    Transitional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub group: String,
    pub reason: MembershipReason,
    /// Members whose change caused this notification.
    pub changed: Vec<String>,
    /// Full member list after the change.
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Message(BusMessage),
    Membership(Membership),
}

pub type EventReceiver = mpsc::UnboundedReceiver<BusEvent>;

/// Outbound primitives of a group bus connection.
pub trait Mailbox: Send + Sync + 'static {
    /// Address that reaches only this member.
    fn private_group(&self) -> &str;

    /// # Errors
    fn join(&self, group: &str) -> Result<()>;

    /// # Errors
    fn leave(&self, group: &str) -> Result<()>;

    /// Sends `payload` to every member of every group in `groups`; a
    /// private group name addresses that single member.
    ///
    /// # Errors
    fn multicast(&self, groups: &[&str], kind: MessageKind, payload: Bytes) -> Result<()>;
}
