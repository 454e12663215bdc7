//! The server side of the v1 protocol.
//!
//! Three endpoints, all POST with bincode bodies:
//! - `/v1/msgs` — inbound messages, forwarded to the hive's data channel.
//! - `/v1/cmds` — remote commands with a reply, forwarded with a oneshot.
//! - `/v1/raft` — consensus traffic, forwarded to the consensus engine.
//!
//! Every response body is an encoded [`CmdResult`] so errors stay typed
//! end to end.

use crate::wire::{CmdResult, RemoteCmd};
use hivemind_consensus::RaftMessage;
use hivemind_types::{HiveError, Message, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use warp::Filter;

/// Where the server delivers inbound traffic.
#[derive(Clone)]
pub struct ServerChannels {
    pub msg_tx: mpsc::Sender<Message>,
    pub cmd_tx: mpsc::Sender<(RemoteCmd, oneshot::Sender<CmdResult>)>,
    pub raft_tx: mpsc::UnboundedSender<RaftMessage>,
}

/// How long a remote command may wait for its local reply.
const CMD_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Binds the listener and serves until the shutdown signal fires.
///
/// Returns the bound address (useful when the configured port is 0) and the
/// serving task.
pub async fn bind(
    addr: &str,
    channels: ServerChannels,
    shutdown: oneshot::Receiver<()>,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let socket_addr = resolve(addr)?;

    let msgs = {
        let channels = channels.clone();
        warp::path!("v1" / "msgs")
            .and(warp::post())
            .and(warp::body::bytes())
            .then(move |body: bytes::Bytes| {
                let channels = channels.clone();
                async move { reply(handle_msg(&channels, &body).await) }
            })
    };
    let cmds = {
        let channels = channels.clone();
        warp::path!("v1" / "cmds")
            .and(warp::post())
            .and(warp::body::bytes())
            .then(move |body: bytes::Bytes| {
                let channels = channels.clone();
                async move { reply(handle_cmd(&channels, &body).await) }
            })
    };
    let raft = {
        let channels = channels.clone();
        warp::path!("v1" / "raft")
            .and(warp::post())
            .and(warp::body::bytes())
            .then(move |body: bytes::Bytes| {
                let channels = channels.clone();
                async move { reply(handle_raft(&channels, &body)) }
            })
    };

    let routes = msgs.or(cmds).or(raft);
    let (bound, serving) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(socket_addr, async {
            shutdown.await.ok();
        })
        .map_err(|e| HiveError::fatal(format!("cannot listen on {addr}: {e}")))?;

    info!(addr = %bound, "listening for the v1 protocol");
    let task = tokio::spawn(serving);
    Ok((bound, task))
}

async fn handle_msg(channels: &ServerChannels, body: &[u8]) -> CmdResult {
    let msg: Message = match hivemind_codec::decode_frame(body) {
        Ok(msg) => msg,
        Err(e) => return CmdResult::from_err(e),
    };
    match channels.msg_tx.send(msg).await {
        Ok(()) => CmdResult::ok(),
        Err(_) => CmdResult::from_err(HiveError::invalid_state("hive is stopped")),
    }
}

async fn handle_cmd(channels: &ServerChannels, body: &[u8]) -> CmdResult {
    let cmd: RemoteCmd = match hivemind_codec::decode_frame(body) {
        Ok(cmd) => cmd,
        Err(e) => return CmdResult::from_err(e),
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    if channels.cmd_tx.send((cmd, reply_tx)).await.is_err() {
        return CmdResult::from_err(HiveError::invalid_state("hive is stopped"));
    }
    match tokio::time::timeout(CMD_REPLY_TIMEOUT, reply_rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => CmdResult::from_err(HiveError::transient("command reply dropped")),
        Err(_) => CmdResult::from_err(HiveError::transient("command timed out")),
    }
}

fn handle_raft(channels: &ServerChannels, body: &[u8]) -> CmdResult {
    let msg: RaftMessage = match hivemind_codec::decode_frame(body) {
        Ok(msg) => msg,
        Err(e) => return CmdResult::from_err(e),
    };
    match channels.raft_tx.send(msg) {
        Ok(()) => CmdResult::ok(),
        Err(_) => CmdResult::from_err(HiveError::invalid_state("consensus is stopped")),
    }
}

fn reply(result: CmdResult) -> warp::reply::Response {
    match hivemind_codec::encode_frame(&result) {
        Ok(bytes) => warp::http::Response::new(bytes.into()),
        Err(e) => {
            warn!(error = %e, "cannot encode command result");
            let mut response = warp::http::Response::new(Vec::new().into());
            *response.status_mut() = warp::http::StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    addr.to_socket_addrs()
        .map_err(|e| HiveError::fatal(format!("cannot resolve {addr}: {e}")))?
        .next()
        .ok_or_else(|| HiveError::fatal(format!("{addr} resolves to no address")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyPool;
    use crate::wire::{BeeWireCmd, CmdData, HiveWireCmd};
    use hivemind_types::{BeeId, NodeId, NodeInfo};

    fn channels() -> (
        ServerChannels,
        mpsc::Receiver<Message>,
        mpsc::Receiver<(RemoteCmd, oneshot::Sender<CmdResult>)>,
        mpsc::UnboundedReceiver<RaftMessage>,
    ) {
        let (msg_tx, msg_rx) = mpsc::channel(16);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (raft_tx, raft_rx) = mpsc::unbounded_channel();
        (
            ServerChannels {
                msg_tx,
                cmd_tx,
                raft_tx,
            },
            msg_rx,
            cmd_rx,
            raft_rx,
        )
    }

    #[tokio::test]
    async fn messages_flow_through_the_server() {
        let (channels, mut msg_rx, _cmd_rx, _raft_rx) = channels();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (addr, task) = bind("127.0.0.1:0", channels, shutdown_rx).await.unwrap();

        let pool = ProxyPool::new().unwrap();
        let proxy = pool.proxy(&addr.to_string());
        let msg = Message::broadcast("inc", vec![1, 2, 3]);
        proxy.send_msg(&msg).await.unwrap();
        assert_eq!(msg_rx.recv().await.unwrap(), msg);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn commands_round_trip_with_typed_replies() {
        let (channels, _msg_rx, mut cmd_rx, _raft_rx) = channels();
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        let (addr, _task) = bind("127.0.0.1:0", channels, shutdown_rx).await.unwrap();

        // A local responder standing in for the hive's control loop.
        tokio::spawn(async move {
            while let Some((cmd, reply)) = cmd_rx.recv().await {
                let result = match cmd {
                    RemoteCmd::ToHive {
                        cmd: HiveWireCmd::Ping,
                    } => CmdResult::ok(),
                    RemoteCmd::ToHive {
                        cmd: HiveWireCmd::LiveHives,
                    } => CmdResult::with_data(CmdData::Nodes(vec![NodeInfo::new(
                        NodeId(1),
                        "localhost:7767",
                    )])),
                    RemoteCmd::ToBee { bee, .. } => {
                        CmdResult::from_err(HiveError::UnknownBee(bee))
                    }
                    _ => CmdResult::from_err(HiveError::invalid_command("unhandled")),
                };
                let _ = reply.send(result);
            }
        });

        let pool = ProxyPool::new().unwrap();
        let proxy = pool.proxy(&addr.to_string());

        let pong = proxy
            .send_cmd(&RemoteCmd::ToHive {
                cmd: HiveWireCmd::Ping,
            })
            .await
            .unwrap();
        assert!(pong.err.is_none());

        let hives = proxy
            .send_cmd(&RemoteCmd::ToHive {
                cmd: HiveWireCmd::LiveHives,
            })
            .await
            .unwrap();
        match hives.into_result().unwrap() {
            Some(CmdData::Nodes(nodes)) => assert_eq!(nodes.len(), 1),
            other => panic!("unexpected reply {other:?}"),
        }

        let unknown = proxy
            .send_cmd(&RemoteCmd::ToBee {
                bee: BeeId::new(NodeId(9), "counter", 1),
                cmd: BeeWireCmd::ListSlaves,
            })
            .await
            .unwrap();
        assert_eq!(
            unknown.into_result().unwrap_err().category(),
            "unknown_bee"
        );
    }

    #[tokio::test]
    async fn unreachable_peer_is_transient() {
        let pool = ProxyPool::new().unwrap();
        // Port 1 is never listening.
        let proxy = pool.proxy("127.0.0.1:1");
        let err = proxy
            .send_msg(&Message::broadcast("inc", vec![]))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
