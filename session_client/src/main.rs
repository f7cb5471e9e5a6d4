//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p session_client -- [--config client.json] [--addr 127.0.0.1:40000] [--name Player]
//!
//! The client connects, acknowledges every scene load, and logs what happens
//! to the entities it sees.
//!
//! Console commands:
//!   status      - Show client status and known entities
//!   ack         - Acknowledge a pending scene load (when auto-ack is off)
//!   autoack     - Toggle automatic scene acknowledgement
//!   quit        - Disconnect and exit

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use session_client::GameClient;
use session_shared::{config::ClientConfig, health::ReplicaEvent};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<ClientConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => ClientConfig::load(&args[i + 1])?,
        _ => ClientConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
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
    info!(server = %cfg.server_addr, player = %cfg.player_name, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;
    client.session_mut().subscribe(|event| match event {
        ReplicaEvent::LocalPlayerHurt { entity } => info!(entity = %entity, "You were hurt"),
        ReplicaEvent::LocalPlayerDied { entity, cause } => {
            info!(entity = %entity, cause = ?cause, "You died")
        }
        ReplicaEvent::Died { entity, cause } => info!(entity = %entity, cause = ?cause, "Entity died"),
        _ => {}
    });

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

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

    println!("Client connected. Type 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = cfg.tick_interval();
    loop {
        while let Ok(line) = console_rx.try_recv() {
            match client.exec_console(&line).await {
                Ok(output) => {
                    for line in output {
                        println!("{line}");
                    }
                }
                Err(e) => println!("Error: {e:#}"),
            }
        }

        client.poll(tick_interval).await?;

        if !client.is_connected() {
            let reason = client.session().disconnect_reason().unwrap_or("unknown");
            println!("Disconnected from server: {reason}");
            break;
        }
    }

    Ok(())
}
