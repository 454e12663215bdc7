//! Hivemind node daemon.
//!
//! Thin shell around the runtime: flags map one to one onto `HiveConfig`,
//! signals trigger the graceful stop inside the hive, and a clean stop
//! exits 0.

use anyhow::Context;
use clap::Parser;
use hivemind_runtime::{Hive, HiveConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "hived", about = "Hivemind node daemon", version)]
struct Args {
    /// Listening address used to communicate with other nodes.
    #[arg(long, default_value = "localhost:7767")]
    addr: String,

    /// Addresses of peers; separate entries with a comma.
    #[arg(long, value_delimiter = ',')]
    peer_addrs: Vec<String>,

    /// Addresses of external registry seeds; separate entries with a comma.
    #[arg(long, value_delimiter = ',')]
    reg_addrs: Vec<String>,

    /// Where to store persistent state data.
    #[arg(long, default_value = "/tmp/hivemind")]
    state_path: PathBuf,

    /// Buffer size of data channels.
    #[arg(long, default_value_t = 1024)]
    data_ch_buf_size: usize,

    /// Buffer size of command channels.
    #[arg(long, default_value_t = 128)]
    cmd_ch_buf_size: usize,

    /// Heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 100)]
    hb_query_interval_ms: u64,

    /// After this many milliseconds without a heartbeat a non-responsive
    /// bee is announced dead.
    #[arg(long, default_value_t = 300)]
    hb_dead_timeout_ms: u64,

    /// Backoff before retrying a contended registry entry, milliseconds.
    #[arg(long, default_value_t = 10)]
    reg_lock_timeout_ms: u64,

    /// Heartbeat bees directly instead of relying on registry events.
    #[arg(long)]
    use_bee_heartbeat: bool,

    /// Keep runtime counters.
    #[arg(long)]
    instrument: bool,

    /// Required replication acknowledgements per transaction.
    #[arg(long, default_value_t = 1)]
    replication_quorum: usize,
}

impl Args {
    fn into_config(self) -> HiveConfig {
        HiveConfig {
            addr: self.addr,
            peer_addrs: self.peer_addrs,
            reg_addrs: self.reg_addrs,
            state_path: self.state_path,
            data_ch_buf_size: self.data_ch_buf_size,
            cmd_ch_buf_size: self.cmd_ch_buf_size,
            hb_query_interval: Duration::from_millis(self.hb_query_interval_ms),
            hb_dead_timeout: Duration::from_millis(self.hb_dead_timeout_ms),
            reg_lock_timeout: Duration::from_millis(self.reg_lock_timeout_ms),
            use_bee_heartbeat: self.use_bee_heartbeat,
            instrument: self.instrument,
            replication_quorum: self.replication_quorum,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hived=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.into_config();
    info!(
        addr = %config.addr,
        state_path = %config.state_path.display(),
        peers = config.peer_addrs.len(),
        "starting hived"
    );

    let hive = Hive::new(config);
    hive.start().await.context("hive exited with an error")?;
    info!("hived stopped cleanly");
    Ok(())
}
