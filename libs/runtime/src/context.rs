//! The receive context handed to handlers.

use hivemind_codec::PayloadRegistry;
use hivemind_state::{DictRef, InMemoryBackend, TxState};
use hivemind_types::{BeeId, HiveError, Message, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Everything a handler may touch while processing one message: the bee's
/// state (staged while a transaction is open) and an outbox.
///
/// Emissions are buffered; for transactional apps they dispatch only after
/// the transaction commits, and are discarded on abort.
pub struct RcvContext<'a> {
    bee: &'a BeeId,
    state: &'a mut TxState,
    codec: &'a PayloadRegistry,
    msg_from: Option<BeeId>,
    outgoing: Vec<Message>,
}

impl<'a> RcvContext<'a> {
    pub(crate) fn new(
        bee: &'a BeeId,
        state: &'a mut TxState,
        codec: &'a PayloadRegistry,
        msg_from: Option<BeeId>,
    ) -> Self {
        Self {
            bee,
            state,
            codec,
            msg_from,
            outgoing: Vec::new(),
        }
    }

    /// The bee's state. Dictionary access goes through the open transaction
    /// when there is one.
    pub fn state(&mut self) -> &mut TxState {
        self.state
    }

    /// Shorthand for `state().dict(name)`.
    pub fn dict(&mut self, name: &str) -> DictRef<'_, InMemoryBackend> {
        self.state.dict(name)
    }

    /// Broadcasts a registered payload from this bee.
    pub fn emit<T: Serialize + 'static>(&mut self, data: T) -> Result<()> {
        let (kind, payload) = self.codec.encode(&data)?;
        self.outgoing
            .push(Message::broadcast(kind, payload).with_from(self.bee.clone()));
        Ok(())
    }

    /// Sends a registered payload to a specific bee.
    pub fn send_to_bee<T: Serialize + 'static>(&mut self, data: T, to: BeeId) -> Result<()> {
        let (kind, payload) = self.codec.encode(&data)?;
        self.outgoing
            .push(Message::unicast(kind, payload, to).with_from(self.bee.clone()));
        Ok(())
    }

    /// Replies to the sender of `msg`; fails when the message carries no
    /// sender.
    pub fn reply_to<T: Serialize + 'static>(&mut self, msg: &Message, data: T) -> Result<()> {
        let to = msg
            .from
            .clone()
            .ok_or_else(|| HiveError::invalid_state("cannot reply to a no-reply message"))?;
        self.send_to_bee(data, to)
    }

    /// Decodes the payload of a message as a registered type.
    pub fn decode<T: DeserializeOwned + 'static>(&self, msg: &Message) -> Result<T> {
        self.codec.decode(&msg.kind, &msg.payload)
    }

    /// This bee's identity.
    pub fn id(&self) -> &BeeId {
        self.bee
    }

    /// The sender of the message being processed, when it has one.
    pub fn from(&self) -> Option<&BeeId> {
        self.msg_from.as_ref()
    }

    pub(crate) fn take_outgoing(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.outgoing)
    }
}
