//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p session_server -- [--config server.json] [--addr 127.0.0.1:40000]
//!                                  [--tick-hz 64] [--scene arena]
//!
//! Command line flags override values from the config file.
//!
//! Console commands:
//!   map <scene>                - Move every peer to a new scene
//!   status                     - Show session status
//!   startmatch / endmatch      - Force a match transition
//!   damage <entity> <amount>   - Apply damage
//!   heal <entity> <amount>     - Restore health
//!   kill <entity> [reason]     - Kill outright
//!   say <text>                 - Print a message on every client
//!   kick <connection>          - Disconnect a peer
//!   quit                       - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use session_server::GameServer;
use session_shared::config::ServerConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<ServerConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => ServerConfig::load(&args[i + 1])?,
        _ => ServerConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().context("parse --tick-hz")?;
                i += 2;
            }
            "--scene" if i + 1 < args.len() => {
                cfg.default_scene = args[i + 1].clone();
                i += 2;
            }
            "--config" => i += 2,
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        addr = %cfg.server_addr,
        tick_hz = cfg.tick_hz,
        scene = %cfg.default_scene,
        "Starting server"
    );

    let mut server = GameServer::bind(cfg).await.context("create server")?;
    info!(local = %server.local_addr(), "Server listening");

    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'map <scene>' to load a scene, 'status' for info, 'quit' to exit.");
    println!();

    server.run().await
}
