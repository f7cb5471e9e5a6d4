//! Client implementation.
//!
//! The client maintains:
//! - A reliable control stream (handshake, scene loads, spawns, deaths)
//! - An unreliable datagram socket (entity snapshots)
//! - A [`ClientSession`] fed from both
//!
//! The reliable stream is read by a background task so that polling with a
//! timeout never abandons a half-read frame.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use session_shared::{
    config::ClientConfig,
    net::{ConnectionId, NetMsg, ReliableConn, ReliableWriter, UnreliableConn, PROTOCOL_VERSION},
};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::session::{ClientSession, ClientState};

/// High-level game client.
pub struct GameClient {
    session: ClientSession,
    writer: ReliableWriter,
    unreliable: UnreliableConn,
    reliable_rx: mpsc::UnboundedReceiver<anyhow::Result<NetMsg>>,
    reader_task: JoinHandle<()>,
    auto_ack: bool,
    server_addr: SocketAddr,
}

impl GameClient {
    /// Connects to a server and performs the handshake.
    pub async fn connect(cfg: &ClientConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(server = %server_addr, player = %cfg.player_name, "Connecting to server");

        // Bind UDP first so we can tell the server where to send snapshots.
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let unreliable = UnreliableConn::connect(bind, server_addr).await?;
        let client_udp_port = unreliable.local_addr().context("udp local_addr")?.port();

        let stream = TcpStream::connect(server_addr)
            .await
            .context("tcp connect")?;
        let mut reliable = ReliableConn::new(stream);

        reliable
            .send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;
        reliable.send(&NetMsg::UdpHello { client_udp_port }).await?;

        let connection = match reliable.recv().await? {
            NetMsg::Welcome { connection } => connection,
            NetMsg::Disconnect { reason } => anyhow::bail!("rejected by server: {reason}"),
            other => anyhow::bail!("expected Welcome, got {}", other.kind()),
        };
        info!(connection = ?connection, "Connected to server");

        let (mut reader, writer) = reliable.into_split();
        let (tx, reliable_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(async move {
            loop {
                let msg = reader.recv().await;
                let failed = msg.is_err();
                if tx.send(msg).is_err() || failed {
                    break;
                }
            }
        });

        Ok(Self {
            session: ClientSession::new(connection),
            writer,
            unreliable,
            reliable_rx,
            reader_task,
            auto_ack: true,
            server_addr,
        })
    }

    pub fn connection(&self) -> ConnectionId {
        self.session.connection()
    }

    pub fn session(&self) -> &ClientSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut ClientSession {
        &mut self.session
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn is_connected(&self) -> bool {
        self.session.state() != ClientState::Disconnected
    }

    /// When off, scene loads stay pending until [`GameClient::ack_scene`].
    pub fn set_auto_ack(&mut self, auto_ack: bool) {
        self.auto_ack = auto_ack;
    }

    /// Applies every reliable message received so far, then waits up to
    /// `timeout` for snapshots.
    pub async fn poll(&mut self, timeout: Duration) -> anyhow::Result<()> {
        self.poll_reliable().await?;
        if !self.is_connected() {
            return Ok(());
        }
        self.poll_unreliable(timeout).await;
        Ok(())
    }

    async fn poll_reliable(&mut self) -> anyhow::Result<()> {
        while self.is_connected() {
            match self.reliable_rx.try_recv() {
                Ok(Ok(msg)) => {
                    self.session.handle(msg);
                    if self.auto_ack {
                        self.ack_scene().await?;
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Reliable connection error");
                    self.session.mark_disconnected(format!("{e:#}"));
                    return Ok(());
                }
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    self.session.mark_disconnected("connection closed");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn poll_unreliable(&mut self, timeout: Duration) {
        let mut wait = timeout;
        loop {
            match self.unreliable.recv_timeout(wait).await {
                Ok(Some(msg)) => self.session.handle(msg),
                Ok(None) => break,
                Err(e) => debug!(error = %e, "Dropped datagram"),
            }
            wait = Duration::ZERO;
        }
    }

    /// Acknowledges a pending scene load. Returns false if none was pending.
    pub async fn ack_scene(&mut self) -> anyhow::Result<bool> {
        let Some(ack) = self.session.finish_loading() else {
            return Ok(false);
        };
        self.writer.send(&ack).await?;
        Ok(true)
    }

    /// Sends a raw reliable message.
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        self.writer.send(msg).await
    }

    /// Polls until `pred` holds or `timeout` elapses. Returns whether it held.
    pub async fn wait_until(
        &mut self,
        timeout: Duration,
        mut pred: impl FnMut(&ClientSession) -> bool,
    ) -> anyhow::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if pred(&self.session) {
                return Ok(true);
            }
            if Instant::now() >= deadline || !self.is_connected() {
                return Ok(pred(&self.session));
            }
            self.poll(Duration::from_millis(5)).await?;
        }
    }

    /// Leaves politely.
    pub async fn disconnect(mut self, reason: &str) -> anyhow::Result<()> {
        self.writer
            .send(&NetMsg::Disconnect {
                reason: reason.to_string(),
            })
            .await?;
        self.session.mark_disconnected(reason);
        Ok(())
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, _args)) = tokens.split_first() else {
            return Ok(Vec::new());
        };
        match command {
            "status" => {
                let s = &self.session;
                let mut out = vec![
                    format!("State: {:?}", s.state()),
                    format!("Connection: {:?}", s.connection()),
                    format!(
                        "Scene: {} (generation {})",
                        s.scene_name().unwrap_or("<none>"),
                        s.generation()
                    ),
                ];
                for r in s.replicas() {
                    out.push(format!(
                        "  {}: {}/{}{}",
                        r.entity(),
                        r.health(),
                        r.max(),
                        if r.is_owned() { " (you)" } else { "" }
                    ));
                }
                Ok(out)
            }
            "ack" => {
                if self.ack_scene().await? {
                    Ok(vec![format!("Acknowledged generation {}", self.session.generation())])
                } else {
                    Ok(vec!["No scene load pending".to_string()])
                }
            }
            "autoack" => {
                self.auto_ack = !self.auto_ack;
                Ok(vec![format!("Auto-ack {}", if self.auto_ack { "on" } else { "off" })])
            }
            "disconnect" | "quit" | "exit" => {
                self.writer
                    .send(&NetMsg::Disconnect {
                        reason: "client quit".to_string(),
                    })
                    .await?;
                self.session.mark_disconnected("client quit");
                Ok(vec!["Disconnected".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }
}

impl Drop for GameClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}
