//! Dedicated session server.
//!
//! Usage:
//!   cargo run -p arena_server --bin server -- [--addr 127.0.0.1:40000] [--tick-hz 64] [--config session.json]
//!
//! Console commands:
//!   status  - Show phase, players and entities
//!   quit    - Shut down

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use arena_server::SessionServer;
use arena_shared::config::SessionConfig;
use tokio::sync::mpsc;
use tracing::info;

struct Args {
    config: Option<String>,
    addr: Option<String>,
    tick_hz: Option<u32>,
}

fn parse_args() -> Args {
    let mut out = Args {
        config: None,
        addr: None,
        tick_hz: None,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                out.config = Some(args[i + 1].clone());
                i += 2;
            }
            "--addr" if i + 1 < args.len() => {
                out.addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                out.tick_hz = args[i + 1].parse().ok();
                i += 2;
            }
            _ => i += 1,
        }
    }
    out
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
    if let Some(tick_hz) = args.tick_hz {
        cfg.tick_hz = tick_hz;
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

    let cfg = load_config(&parse_args())?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, max_players = cfg.max_players, "Starting server");

    let mut server = SessionServer::bind(cfg).await.context("bind server")?;
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

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.shutdown();
        }
    });

    println!("Server ready. Type 'status' for info, 'quit' to exit.");
    server.run().await
}
