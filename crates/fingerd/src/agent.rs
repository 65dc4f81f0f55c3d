// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The workstation agent role.
//!
//! Connects to the aggregator and pushes one update cycle per period:
//! `!!! UPDATE`, one line per live login, then a blank line committing
//! the cycle. Logins come from the host's user-accounting database; idle
//! is how long the login's terminal device has gone untouched.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use anyhow::Context;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::config::Config;
use crate::store::now_secs;
use crate::update::{format_login, LoginRecord};

/// Enumerates the host's current logins.
pub trait SessionSource {
    fn sessions(&self) -> anyhow::Result<Vec<LoginRecord>>;
}

/// Reads the system utmp database.
pub struct UtmpSource {
    path: PathBuf,
}

impl UtmpSource {
    pub fn new() -> Self {
        Self { path: PathBuf::from("/var/run/utmp") }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for UtmpSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSource for UtmpSource {
    fn sessions(&self) -> anyhow::Result<Vec<LoginRecord>> {
        let entries = utmp_rs::parse_from_path(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let now = now_secs();
        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry {
                utmp_rs::UtmpEntry::UserProcess { user, line, host, time, .. } => {
                    let idle_time = tty_idle(&line, now);
                    Some(LoginRecord {
                        user,
                        line,
                        login_time: time.unix_timestamp(),
                        idle_time,
                        host,
                    })
                }
                _ => None,
            })
            .collect())
    }
}

/// Idle seconds for a terminal line, from the device's access time.
/// Negative means unknown.
fn tty_idle(line: &str, now: i64) -> i64 {
    let accessed = std::fs::metadata(Path::new("/dev").join(line)).and_then(|m| m.accessed());
    match accessed {
        Ok(atime) => match atime.duration_since(UNIX_EPOCH) {
            Ok(since) => now - since.as_secs() as i64,
            Err(_) => -1,
        },
        Err(_) => -1,
    }
}

/// Run the agent until the connection drops.
pub async fn run(config: Config, source: Box<dyn SessionSource>) -> anyhow::Result<()> {
    let host = config.server_addr.clone().unwrap_or_else(|| "localhost".to_owned());
    let mut stream = TcpStream::connect((host.as_str(), config.port))
        .await
        .with_context(|| format!("connecting to {host}:{}", config.port))?;
    info!(%host, port = config.port, "reporting logins");

    let period = std::time::Duration::from_secs(config.timeout_update.max(1));
    loop {
        match source.sessions() {
            Ok(records) => {
                push_cycle(&mut stream, &records, config.max_msg_size)
                    .await
                    .context("pushing update cycle")?;
            }
            Err(err) => warn!(%err, "could not enumerate sessions, skipping cycle"),
        }
        tokio::time::sleep(period).await;
    }
}

/// Write one framed update cycle. Records longer than `max_msg_size` are
/// skipped rather than sent truncated.
pub async fn push_cycle<W: AsyncWrite + Unpin>(
    writer: &mut W,
    records: &[LoginRecord],
    max_msg_size: usize,
) -> std::io::Result<()> {
    writer.write_all(b"!!! UPDATE\n").await?;
    for rec in records {
        let line = format_login(rec);
        if line.len() > max_msg_size {
            warn!(user = %rec.user, "skipping oversized login record");
            continue;
        }
        writer.write_all(line.as_bytes()).await?;
    }
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
#[path = "agent_tests.rs"]
mod tests;
