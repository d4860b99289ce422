//! `afd-demcd`: confirmation correlator daemon (§4.G).
//!
//! Ticks the correlator every [`afd_core::correlator::TICK_INTERVAL`],
//! matching inbound confirmation lines read from stdin (`DE_MAIL_PRIVAT_ID
//! file_name ack|nack` per line) against the persistent queue.

use std::io::{BufRead, IsTerminal};
use std::time::{SystemTime, UNIX_EPOCH};

use afd_core::config::{AfdConfig, AFD_WORK_DIR_VAR};
use afd_core::correlator::{Correlator, TICK_INTERVAL};
use afd_core::db::AfdDb;
use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "afd-demcd")]
struct Args {
    /// Overrides `$AFD_WORK_DIR`.
    work_dir: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let work_dir = match args.work_dir {
        Some(dir) => dir,
        None => std::env::var(AFD_WORK_DIR_VAR).context("AFD_WORK_DIR is not set and no work directory was given")?,
    };
    let config = AfdConfig::new(work_dir.into());

    let db = AfdDb::new(&config.status_db_path()).await.context("failed to open status database")?;
    let correlator = Correlator::new(db.pool().clone());

    info!("demcd correlator starting");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<(String, bool)>();
    if !std::io::stdin().is_terminal() {
        std::thread::spawn(move || {
            for line in std::io::stdin().lock().lines().map_while(Result::ok) {
                if let Some((file_name, ack)) = parse_confirmation_line(&line) {
                    if tx.send((file_name, ack)).is_err() {
                        break;
                    }
                } else {
                    warn!(line, "unparseable confirmation line");
                }
            }
        });
    }

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    loop {
        ticker.tick().await;
        let mut inbound = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            inbound.push(entry);
        }
        correlator.tick(&inbound, now()).await.context("correlator tick failed")?;
    }
}

/// Parses `"<de_mail_privat_id> <file_name> ack|nack"` into a match target.
fn parse_confirmation_line(line: &str) -> Option<(String, bool)> {
    let mut parts = line.split_whitespace();
    let _de_mail_privat_id = parts.next()?;
    let file_name = parts.next()?.to_string();
    let verdict = parts.next()?;
    match verdict {
        "ack" => Some((file_name, true)),
        "nack" => Some((file_name, false)),
        _ => None,
    }
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
