//! Core Types for the Hivemind Runtime
//!
//! Foundation crate shared by every other workspace member. It defines the
//! cluster identifiers (nodes, bees, cells, colonies), the message envelope,
//! the transaction record, and the error taxonomy. Nothing here performs I/O;
//! these are the vocabulary types the rest of the runtime speaks.

pub mod error;
pub mod ids;
pub mod message;
pub mod tx;

pub use error::{HiveError, Result};
pub use ids::{AppName, BeeId, CellKey, Colony, NodeId, NodeInfo};
pub use message::Message;
pub use tx::{Tx, TxOp, TxStatus};
