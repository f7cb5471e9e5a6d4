//! Server IO loop.
//!
//! Fixed-timestep loop around a [`Session`]. Per-peer tokio tasks own the
//! sockets and talk to the loop over channels:
//! - an accept task performs the `Hello`/`UdpHello`/`Welcome` handshake and
//!   spawns a reader and a writer per peer;
//! - readers forward decoded messages and the final drop as [`NetEvent`]s;
//! - writers drain an unbounded queue of reliable messages.
//!
//! Each step applies pending console lines and network events, evicts peers
//! stuck loading, ticks the session, and flushes its outbox. Snapshots go out
//! over UDP from the same port as the TCP listener.

use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use anyhow::Context;
use session_shared::{
    config::ServerConfig,
    ecs::EntityId,
    health::DamageOutcome,
    net::{
        encode_to_bytes, Channel, ConnectionId, DamageCause, NetMsg, ReliableConn,
        ReliableListener, PROTOCOL_VERSION,
    },
};
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::{
    outbox::Outgoing,
    session::{Collaborators, Session},
};

/// Something that happened on a peer's socket.
#[derive(Debug)]
pub enum NetEvent {
    Connected {
        connection: ConnectionId,
        udp_peer: SocketAddr,
        reliable_tx: mpsc::UnboundedSender<NetMsg>,
    },
    Message {
        connection: ConnectionId,
        msg: NetMsg,
    },
    Disconnected {
        connection: ConnectionId,
        reason: String,
    },
}

/// Loop-side handle on a connected peer.
struct PeerLink {
    udp_peer: SocketAddr,
    reliable_tx: mpsc::UnboundedSender<NetMsg>,
}

pub struct GameServer {
    pub cfg: ServerConfig,
    session: Session,
    peers: BTreeMap<ConnectionId, PeerLink>,
    udp: UdpSocket,
    local_addr: SocketAddr,
    events_rx: mpsc::UnboundedReceiver<NetEvent>,
    accept_task: JoinHandle<()>,
    console_rx: Option<mpsc::Receiver<String>>,
    started: Instant,
    shutdown: bool,
}

impl GameServer {
    /// Binds TCP and UDP on `cfg.server_addr` and starts accepting peers. The
    /// default scene, if any, is loaded immediately.
    pub async fn new(mut cfg: ServerConfig, collaborators: Collaborators) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let local_addr = tcp.local_addr()?;
        // UDP shares the TCP port, including when the port was ephemeral.
        let udp = UdpSocket::bind(local_addr).await.context("udp bind")?;
        cfg.server_addr = local_addr.to_string();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let accept_task = tokio::spawn(accept_loop(tcp, events_tx));

        let mut session = Session::new(&cfg, collaborators);
        if !cfg.default_scene.is_empty() {
            session
                .load_scene(&cfg.default_scene)
                .context("load default scene")?;
        }

        Ok(Self {
            cfg,
            session,
            peers: BTreeMap::new(),
            udp,
            local_addr,
            events_rx,
            accept_task,
            console_rx: None,
            started: Instant::now(),
            shutdown: false,
        })
    }

    /// Binds with in-process collaborators.
    pub async fn bind(cfg: ServerConfig) -> anyhow::Result<Self> {
        let collaborators = Collaborators::local(&cfg);
        Self::new(cfg, collaborators).await
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// True once `quit` was issued.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown
    }

    /// Runs until `quit`.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.cfg.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while !self.shutdown {
            interval.tick().await;
            self.step().await?;
        }
        info!("Server stopped");
        Ok(())
    }

    /// Runs a fixed number of ticks at the configured rate.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = self.cfg.tick_interval();
        let mut next = Instant::now();
        for _ in 0..ticks {
            next += dt;
            self.step().await?;
            if self.shutdown {
                break;
            }
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one fixed simulation step.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        self.process_console_commands();
        self.process_net_events()?;
        self.evict_stalled_loaders();
        if let Err(e) = self.session.tick(self.started.elapsed()) {
            error!(error = %e, tick = self.session.tick_count(), "Tick failed");
        }
        self.flush().await;
        Ok(())
    }

    fn process_console_commands(&mut self) {
        let mut lines = Vec::new();
        if let Some(rx) = self.console_rx.as_mut() {
            while let Ok(line) = rx.try_recv() {
                lines.push(line);
            }
        }
        for line in lines {
            for out in self.exec_console(&line) {
                println!("{out}");
            }
        }
    }

    /// Executes a console command and returns the lines to print.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = tokens.split_first() else {
            return Vec::new();
        };

        match command {
            "map" => {
                let Some(scene) = args.first() else {
                    return vec!["Usage: map <scene>".to_string()];
                };
                match self.session.load_scene(scene) {
                    Ok(generation) => {
                        vec![format!("Loading scene '{scene}' (generation {generation})")]
                    }
                    Err(e) => vec![format!("Failed to load scene: {e}")],
                }
            }
            "status" => self.status_lines(),
            "startmatch" => match self.session.start_match() {
                Ok(()) => vec![self.match_line()],
                Err(e) => vec![format!("Failed to start match: {e}")],
            },
            "endmatch" => {
                self.session.end_match();
                vec![self.match_line()]
            }
            "damage" => match (parse_entity(args.first()), parse_amount(args.get(1))) {
                (Some(entity), Some(amount)) => {
                    let cause = DamageCause::new("console");
                    match self.session.apply_damage(entity, amount, cause) {
                        DamageOutcome::Ignored => vec![format!("{entity} is dead or unknown")],
                        DamageOutcome::Damaged { remaining } => {
                            vec![format!("{entity} has {remaining} health left")]
                        }
                        DamageOutcome::Died => vec![format!("{entity} died")],
                    }
                }
                _ => vec!["Usage: damage <entity> <amount>".to_string()],
            },
            "heal" => match (parse_entity(args.first()), parse_amount(args.get(1))) {
                (Some(entity), Some(amount)) => {
                    let restored = self.session.heal(entity, amount);
                    vec![format!("{entity} healed by {restored}")]
                }
                _ => vec!["Usage: heal <entity> <amount>".to_string()],
            },
            "kill" => {
                let Some(entity) = parse_entity(args.first()) else {
                    return vec!["Usage: kill <entity> [reason]".to_string()];
                };
                let reason = if args.len() > 1 {
                    args[1..].join(" ")
                } else {
                    "console".to_string()
                };
                if self.session.kill(entity, reason) {
                    vec![format!("{entity} killed")]
                } else {
                    vec![format!("{entity} is dead or unknown")]
                }
            }
            "say" => {
                let message = args.join(" ");
                let msg = NetMsg::ServerPrint { message };
                for link in self.peers.values() {
                    let _ = link.reliable_tx.send(msg.clone());
                }
                Vec::new()
            }
            "kick" => {
                let Some(connection) = args.first().and_then(|s| s.parse().ok()) else {
                    return vec!["Usage: kick <connection>".to_string()];
                };
                let connection = ConnectionId(connection);
                if self.peers.contains_key(&connection) {
                    self.drop_peer(connection, "kicked by operator");
                    vec![format!("Kicked {connection:?}")]
                } else {
                    vec![format!("No such connection {connection:?}")]
                }
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                let ids: Vec<ConnectionId> = self.peers.keys().copied().collect();
                for connection in ids {
                    self.drop_peer(connection, "server shutting down");
                }
                self.shutdown = true;
                vec!["Shutting down".to_string()]
            }
            other => vec![format!("Unknown command: {other}")],
        }
    }

    fn match_line(&self) -> String {
        match self.session.match_state() {
            Some(state) => format!("Match: {state}"),
            None => "No match (no scene loaded)".to_string(),
        }
    }

    fn status_lines(&self) -> Vec<String> {
        let s = &self.session;
        let mut out = vec![
            format!(
                "Scene: {} (generation {})",
                s.scene_name().unwrap_or("<none>"),
                s.generation()
            ),
            self.match_line(),
            format!("Tick: {}", s.tick_count()),
            format!("Entities: {}", s.world().len()),
            format!(
                "Connections: {} ({} loading)",
                s.registry().len(),
                s.registry().loading_count()
            ),
        ];
        for view in s.registry().iter() {
            let udp = self
                .peers
                .get(&view.id())
                .map(|l| l.udp_peer.to_string())
                .unwrap_or_default();
            out.push(format!(
                "  {:?}: udp={} loading={} pawn={:?}",
                view.id(),
                udp,
                view.is_loading_level(),
                view.controller().pawn()
            ));
        }
        out
    }

    fn process_net_events(&mut self) -> anyhow::Result<()> {
        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                NetEvent::Connected {
                    connection,
                    udp_peer,
                    reliable_tx,
                } => {
                    info!(connection = ?connection, %udp_peer, "Client connected");
                    self.peers.insert(
                        connection,
                        PeerLink {
                            udp_peer,
                            reliable_tx,
                        },
                    );
                    self.session.connect(connection)?;
                }
                NetEvent::Message {
                    connection,
                    msg: NetMsg::Disconnect { reason },
                } => {
                    if self.peers.remove(&connection).is_some() {
                        info!(connection = ?connection, %reason, "Client left");
                        self.session.disconnect(connection);
                    }
                }
                NetEvent::Message { connection, msg } => {
                    self.session.handle_message(connection, msg);
                }
                NetEvent::Disconnected { connection, reason } => {
                    if self.peers.remove(&connection).is_some() {
                        info!(connection = ?connection, %reason, "Client dropped");
                        self.session.disconnect(connection);
                    }
                }
            }
        }
        Ok(())
    }

    fn evict_stalled_loaders(&mut self) {
        let Some(timeout) = self.cfg.load_timeout() else {
            return;
        };
        for connection in self.session.stalled_loaders(timeout) {
            warn!(connection = ?connection, ?timeout, "Peer never finished loading");
            self.drop_peer(connection, "scene load timed out");
        }
    }

    fn drop_peer(&mut self, connection: ConnectionId, reason: &str) {
        if let Some(link) = self.peers.remove(&connection) {
            let _ = link.reliable_tx.send(NetMsg::Disconnect {
                reason: reason.to_string(),
            });
        }
        self.session.disconnect(connection);
    }

    async fn flush(&mut self) {
        for Outgoing { to, channel, msg } in self.session.drain_outbox() {
            let Some(link) = self.peers.get(&to) else {
                continue;
            };
            match channel {
                Channel::Reliable => {
                    if link.reliable_tx.send(msg).is_err() {
                        debug!(connection = ?to, "Writer gone");
                    }
                }
                Channel::Unreliable => {
                    let payload = match encode_to_bytes(&msg) {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(error = %e, kind = msg.kind(), "Failed to encode datagram");
                            continue;
                        }
                    };
                    if let Err(e) = self.udp.send_to(&payload, link.udp_peer).await {
                        debug!(connection = ?to, error = %e, "UDP send failed");
                    }
                }
            }
        }
    }
}

impl Drop for GameServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn parse_entity(arg: Option<&&str>) -> Option<EntityId> {
    let s = arg?.trim_start_matches('#');
    s.parse().ok().map(EntityId)
}

fn parse_amount(arg: Option<&&str>) -> Option<u32> {
    arg?.parse().ok()
}

async fn accept_loop(tcp: ReliableListener, events: mpsc::UnboundedSender<NetEvent>) {
    loop {
        let (conn, peer) = match tcp.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_peer(conn, peer, events).await {
                debug!(%peer, error = %e, "Peer task ended");
            }
        });
    }
}

/// Reads `Hello` and `UdpHello`. Returns the peer's UDP port.
async fn handshake(conn: &mut ReliableConn) -> anyhow::Result<u16> {
    match conn.recv().await? {
        NetMsg::Hello { protocol } if protocol == PROTOCOL_VERSION => {}
        NetMsg::Hello { protocol } => {
            let _ = conn
                .send(&NetMsg::Disconnect {
                    reason: format!("protocol {protocol} unsupported, expected {PROTOCOL_VERSION}"),
                })
                .await;
            anyhow::bail!("protocol mismatch: {protocol}");
        }
        other => anyhow::bail!("unexpected handshake msg: {}", other.kind()),
    }
    match conn.recv().await? {
        NetMsg::UdpHello { client_udp_port } => Ok(client_udp_port),
        other => anyhow::bail!("expected UdpHello, got {}", other.kind()),
    }
}

async fn serve_peer(
    mut conn: ReliableConn,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<NetEvent>,
) -> anyhow::Result<()> {
    let client_udp_port = handshake(&mut conn).await?;
    let connection = ConnectionId::new_unique();
    conn.send(&NetMsg::Welcome { connection }).await?;

    let (mut reader, mut writer) = conn.into_split();
    let (reliable_tx, mut reliable_rx) = mpsc::unbounded_channel::<NetMsg>();
    events
        .send(NetEvent::Connected {
            connection,
            udp_peer: SocketAddr::new(peer.ip(), client_udp_port),
            reliable_tx,
        })
        .context("server loop gone")?;

    tokio::spawn(async move {
        while let Some(msg) = reliable_rx.recv().await {
            let closing = matches!(msg, NetMsg::Disconnect { .. });
            if let Err(e) = writer.send(&msg).await {
                debug!(connection = ?connection, error = %e, "Reliable send failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reason = loop {
        match reader.recv().await {
            Ok(msg) => {
                if events.send(NetEvent::Message { connection, msg }).is_err() {
                    return Ok(());
                }
            }
            Err(e) => break format!("{e:#}"),
        }
    };
    let _ = events.send(NetEvent::Disconnected { connection, reason });
    Ok(())
}

/// Helper for tests: a server on an ephemeral localhost port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, ServerConfig)> {
    let cfg = ServerConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).to_string(),
        tick_hz,
        ..ServerConfig::default()
    };
    let server = GameServer::bind(cfg).await?;
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}
