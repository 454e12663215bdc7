//! Hive configuration.
//!
//! Constructed explicitly at startup and passed into `Hive::new`; the
//! command-line shell maps flags onto these fields one to one.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HiveConfig {
    /// Listening address for the inter-node protocol.
    pub addr: String,
    /// Seed peer addresses for joining an existing cluster.
    pub peer_addrs: Vec<String>,
    /// External registry seed addresses.
    pub reg_addrs: Vec<String>,
    /// Persistent state directory, owned by this node.
    pub state_path: PathBuf,
    pub data_ch_buf_size: usize,
    pub cmd_ch_buf_size: usize,
    /// Heartbeat query interval.
    pub hb_query_interval: Duration,
    /// After this long without a heartbeat a remote bee is declared dead.
    pub hb_dead_timeout: Duration,
    /// Backoff between registry retry attempts.
    pub reg_lock_timeout: Duration,
    /// Heartbeat bees directly instead of relying on registry events.
    pub use_bee_heartbeat: bool,
    /// Keep lightweight runtime counters.
    pub instrument: bool,
    /// Required replication acknowledgements, counted in slave order. The
    /// transaction aborts unless the first this-many slaves ack.
    pub replication_quorum: usize,
}

impl Default for HiveConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:7767".to_string(),
            peer_addrs: Vec::new(),
            reg_addrs: Vec::new(),
            state_path: PathBuf::from("/tmp/hivemind"),
            data_ch_buf_size: 1024,
            cmd_ch_buf_size: 128,
            hb_query_interval: Duration::from_millis(100),
            hb_dead_timeout: Duration::from_millis(300),
            reg_lock_timeout: Duration::from_millis(10),
            use_bee_heartbeat: false,
            instrument: false,
            replication_quorum: 1,
        }
    }
}
