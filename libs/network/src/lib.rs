//! Inter-Node Networking
//!
//! The v1 protocol every hive speaks to its peers: three HTTP endpoints
//! carrying bincode envelopes (messages, remote commands, consensus
//! traffic), a [`Proxy`] client per destination address, and a
//! [`ProxyPool`] caching proxies. The protocol is idempotent against
//! reconnection; transport failures surface as `Transient` so callers
//! choose the retry policy.

mod proxy;
mod server;
mod wire;

pub use proxy::{Proxy, ProxyPool};
pub use server::{bind, ServerChannels};
pub use wire::{BeeWireCmd, CmdData, CmdResult, HiveWireCmd, RemoteCmd};
