//! Hivemind Runtime
//!
//! The distributed execution engine: hives (nodes) host apps, apps shard
//! into bees (single-threaded stateful actors) keyed by dictionary cells,
//! and every bee's committed transactions replicate to its colony's slaves
//! on peer nodes. The consensus-backed registry agrees on membership, bee
//! identity, and cell ownership.
//!
//! ```no_run
//! use hivemind_runtime::{Hive, HiveConfig};
//!
//! # async fn demo() -> hivemind_types::Result<()> {
//! let mut hive = Hive::new(HiveConfig::default());
//! let app = hive.new_app("counter");
//! // app.handle("inc", IncHandler) registers a handler for a message kind.
//! let handle = hive.handle();
//! tokio::spawn(hive.start());
//! // handle.emit(...) / handle.stop() drive the running hive.
//! # Ok(())
//! # }
//! ```

mod app;
mod bee;
mod config;
mod context;
mod hive;
mod qee;
mod stats;

pub use app::{App, Handler};
pub use config::HiveConfig;
pub use context::RcvContext;
pub use hive::{Hive, HiveHandle};
pub use stats::HiveStatsSnapshot;

pub use hivemind_registry::Registry;
pub use hivemind_types::{
    AppName, BeeId, CellKey, Colony, HiveError, Message, NodeId, NodeInfo, Result,
};
