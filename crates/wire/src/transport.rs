//! Transport seam.
//!
//! Sockets, relays and in-process hubs all sit behind [`Transport`]. The
//! controllers only ever send `(recipient, msg_type, bytes)`. Incoming
//! [`TransportEvent`]s reach them either directly from the host loop or
//! through a [`Mailbox`] that I/O threads post into and the controller
//! drains at the start of its next tick.

use std::sync::mpsc::{Receiver, Sender, channel};

use prost::Message;

/// Connection handle assigned by the transport.
pub type ClientId = u32;

/// Sender id used for messages coming from the server.
pub const SERVER_ID: ClientId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipient {
    Server,
    One(ClientId),
}

/// An undecoded message as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub from: ClientId,
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(ClientId),
    Disconnected(ClientId),
    Message(RawMessage),
}

/// Outgoing half of a network link. Delivery is assumed reliable and
/// ordered per connection.
pub trait Transport {
    fn send(&mut self, to: Recipient, msg_type: u8, payload: Vec<u8>);

    /// Encode and send a protobuf message.
    fn send_message<M: Message>(&mut self, to: Recipient, msg_type: u8, message: &M)
    where
        Self: Sized,
    {
        self.send(to, msg_type, message.encode_to_vec());
    }
}

/// Transport that records what was sent. Useful for hosts that batch
/// outgoing traffic themselves, and for tests.
#[derive(Debug, Default)]
pub struct Outbox {
    pub sent: Vec<(Recipient, u8, Vec<u8>)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self) -> Vec<(Recipient, u8, Vec<u8>)> {
        std::mem::take(&mut self.sent)
    }

    /// Sent messages of one type, in order.
    pub fn of_type(&self, msg_type: u8) -> impl Iterator<Item = (Recipient, &[u8])> + '_ {
        self.sent
            .iter()
            .filter(move |(_, t, _)| *t == msg_type)
            .map(|(to, _, payload)| (*to, payload.as_slice()))
    }
}

impl Transport for Outbox {
    fn send(&mut self, to: Recipient, msg_type: u8, payload: Vec<u8>) {
        self.sent.push((to, msg_type, payload));
    }
}

/// Events queued for the next controller tick.
#[derive(Debug)]
pub struct Mailbox {
    sender: Sender<TransportEvent>,
    receiver: Receiver<TransportEvent>,
}

impl Mailbox {
    pub fn new() -> Self {
        let (sender, receiver) = channel();
        Self { sender, receiver }
    }

    /// A handle that can be moved to the thread receiving from the network.
    pub fn poster(&self) -> MailboxPoster {
        MailboxPoster(self.sender.clone())
    }

    /// Everything posted so far, in posting order.
    pub fn drain(&self) -> Vec<TransportEvent> {
        self.receiver.try_iter().collect()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MailboxPoster(Sender<TransportEvent>);

impl MailboxPoster {
    /// Queue an event. Returns `false` once the controller is gone.
    pub fn post(&self, event: TransportEvent) -> bool {
        self.0.send(event).is_ok()
    }
}
