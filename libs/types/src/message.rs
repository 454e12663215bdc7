//! The message envelope routed between bees.

use crate::ids::BeeId;
use serde::{Deserialize, Serialize};

/// A typed message between bees.
///
/// The payload is opaque bytes; `kind` is the registered payload tag used to
/// pick the handler and the decoder. A message with a destination is unicast;
/// one without is broadcast to every app handling its kind. A message without
/// a source cannot be replied to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub from: Option<BeeId>,
    pub to: Option<BeeId>,
    pub kind: String,
    pub payload: Vec<u8>,
}

impl Message {
    /// A broadcast message with no sender.
    pub fn broadcast(kind: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            from: None,
            to: None,
            kind: kind.into(),
            payload,
        }
    }

    /// A unicast message addressed to a specific bee.
    pub fn unicast(kind: impl Into<String>, payload: Vec<u8>, to: BeeId) -> Self {
        Self {
            from: None,
            to: Some(to),
            kind: kind.into(),
            payload,
        }
    }

    pub fn with_from(mut self, from: BeeId) -> Self {
        self.from = Some(from);
        self
    }

    pub fn is_unicast(&self) -> bool {
        self.to.is_some()
    }

    /// True when the message carries no sender and therefore cannot be
    /// replied to.
    pub fn no_reply(&self) -> bool {
        self.from.is_none()
    }
}
