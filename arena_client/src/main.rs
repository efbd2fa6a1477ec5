//! Console client.
//!
//! Usage:
//!   cargo run -p arena_client --bin client -- [--mode local-client] [--addr 127.0.0.1:40000]
//!       [--join-code CODE] [--config session.json]
//!
//! Modes: `local-host`, `local-client`, `relay-host`. The binary only has the
//! in-process loopback relay, so `relay-host` prints a join code that other
//! processes cannot resolve; they join with `--mode local-client --addr`.
//! `relay-client` is refused here since no host shares this process.
//!
//! Console commands:
//!   ready             - Ready up in the lobby
//!   loaded            - Report the gameplay scene as loaded
//!   color <index>     - Pick an appearance
//!   move <dx> <dy>    - Set avatar movement
//!   shoot <dx> <dy>   - Fire from the avatar
//!   respawn           - Return to the spawn point
//!   status            - Show mirrored session state
//!   quit              - Exit

use std::env;
use std::io::{BufRead, Write};

use anyhow::{bail, Context};
use arena_client::{client::exec_console, launch, ClientEvent};
use arena_shared::{
    config::SessionConfig,
    relay::{JoinCode, LoopbackRelay, NetworkMode},
};
use tokio::sync::mpsc;
use tracing::info;

struct Args {
    mode: NetworkMode,
    config: Option<String>,
    addr: Option<String>,
    join_code: Option<JoinCode>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut out = Args {
        mode: NetworkMode::LocalClient,
        config: None,
        addr: None,
        join_code: None,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--mode" if i + 1 < args.len() => {
                out.mode = NetworkMode::parse(&args[i + 1])
                    .with_context(|| format!("unknown mode '{}'", args[i + 1]))?;
                i += 2;
            }
            "--config" if i + 1 < args.len() => {
                out.config = Some(args[i + 1].clone());
                i += 2;
            }
            "--addr" if i + 1 < args.len() => {
                out.addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--join-code" if i + 1 < args.len() => {
                out.join_code = Some(JoinCode::new(args[i + 1].clone()));
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(out)
}

/// Modes this binary can run on its own.
fn check_mode(mode: NetworkMode) -> anyhow::Result<()> {
    if mode == NetworkMode::RelayClient {
        bail!("relay-client needs a relay shared with the host; use --mode local-client --addr HOST:PORT");
    }
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<SessionConfig> {
    let mut cfg = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
            SessionConfig::from_json_str(&text).with_context(|| format!("parse config {path}"))?
        }
        None => SessionConfig::default(),
    };
    if let Some(addr) = &args.addr {
        cfg.server_addr = addr.clone();
    }
    Ok(cfg)
}

fn describe(event: &ClientEvent) -> Option<String> {
    match event {
        ClientEvent::PlayerJoined(p) => Some(format!("Player {:?} joined", p.client_id)),
        ClientEvent::PlayerLeft(id) => Some(format!("Player {id:?} left")),
        ClientEvent::PhaseChanged(phase) => Some(format!("Phase: {phase:?}")),
        ClientEvent::StartGameplay => Some("Gameplay started".to_string()),
        ClientEvent::Impact { position } => Some(format!("Impact at ({:.1}, {:.1})", position.x, position.y)),
        ClientEvent::TransportFailure(reason) => Some(format!("Session failed: {reason}")),
        ClientEvent::Disconnected(reason) => Some(format!("Disconnected: {reason}")),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    check_mode(args.mode)?;
    let cfg = load_config(&args)?;
    info!(mode = ?args.mode, server = %cfg.server_addr, "Starting client");

    let relay = LoopbackRelay::new();
    let launched = launch(args.mode, cfg, &relay, args.join_code.as_ref())
        .await
        .context("launch")?;
    let mut client = launched.client;
    if let Some(code) = launched.host.as_ref().and_then(|h| h.join_code.as_ref()) {
        println!("Join code: {code}");
    }

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

    println!("Connected as {:?}. Type 'status' for info, 'quit' to exit.", client.client_id());

    loop {
        tokio::select! {
            line = console_rx.recv() => {
                let Some(line) = line else { break };
                if matches!(line.as_str(), "quit" | "exit") {
                    client.disconnect().await?;
                    break;
                }
                match exec_console(&mut client, &line).await {
                    Ok(output) => output.iter().for_each(|l| println!("{l}")),
                    Err(e) => println!("Error: {e}"),
                }
            }
            received = client.recv() => {
                let connected = received?;
                for event in client.drain_events() {
                    if let Some(text) = describe(&event) {
                        println!("{text}");
                    }
                    // No scene to load in a console client.
                    if event == ClientEvent::SceneTransition {
                        client.scene_loaded().await?;
                    }
                }
                if !connected {
                    break;
                }
            }
        }
    }

    if let Some(host) = launched.host {
        host.stop().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_client_is_refused_standalone() {
        let err = check_mode(NetworkMode::RelayClient).unwrap_err();
        assert!(err.to_string().contains("local-client"));

        for mode in [NetworkMode::LocalHost, NetworkMode::LocalClient, NetworkMode::RelayHost] {
            assert!(check_mode(mode).is_ok());
        }
    }
}
