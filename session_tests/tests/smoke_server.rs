use std::time::Duration;

use session_client::GameClient;
use session_server::{server::bind_ephemeral, GameServer};
use session_shared::{
    config::{ClientConfig, ServerConfig},
    net::{NetMsg, ReliableConn, PROTOCOL_VERSION},
};
use session_tests::init_tracing;
use tokio::{net::TcpStream, time::Instant};

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(64).await?;
    server.run_for_ticks(3).await?;
    assert_eq!(server.session().tick_count(), 3);
    Ok(())
}

#[tokio::test]
async fn default_scene_is_loaded_at_startup() -> anyhow::Result<()> {
    let server = GameServer::bind(ServerConfig {
        server_addr: "127.0.0.1:0".to_string(),
        default_scene: "arena".to_string(),
        ..ServerConfig::default()
    })
    .await?;
    assert_eq!(server.session().scene_name(), Some("arena"));
    assert_eq!(server.session().generation(), 1);
    Ok(())
}

#[tokio::test]
async fn wrong_protocol_is_refused() -> anyhow::Result<()> {
    init_tracing();
    let (_server, cfg) = bind_ephemeral(64).await?;
    let stream = TcpStream::connect(cfg.server_addr.as_str()).await?;
    let mut conn = ReliableConn::new(stream);
    conn.send(&NetMsg::Hello {
        protocol: PROTOCOL_VERSION + 1,
    })
    .await?;
    let reply = tokio::time::timeout(Duration::from_secs(5), conn.recv()).await??;
    assert!(matches!(reply, NetMsg::Disconnect { .. }));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_that_never_acknowledges_is_evicted() -> anyhow::Result<()> {
    init_tracing();
    let mut server = GameServer::bind(ServerConfig {
        server_addr: "127.0.0.1:0".to_string(),
        default_scene: "arena".to_string(),
        load_timeout_secs: Some(1),
        ..ServerConfig::default()
    })
    .await?;
    let mut client = GameClient::connect(&ClientConfig {
        server_addr: server.local_addr().to_string(),
        ..ClientConfig::default()
    })
    .await?;
    client.set_auto_ack(false);

    let deadline = Instant::now() + Duration::from_secs(5);
    while client.is_connected() {
        anyhow::ensure!(Instant::now() < deadline, "peer was never evicted");
        server.step().await?;
        client.poll(Duration::from_millis(10)).await?;
    }
    assert_eq!(
        client.session().disconnect_reason(),
        Some("scene load timed out")
    );
    assert!(server.session().registry().is_empty());
    Ok(())
}
