// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot persistence.
//!
//! The dump is three blank-line-separated sections: every hostname, every
//! username, then one block per machine holding its login records (live
//! first, then past) in the same line format the agents speak. The writer
//! is atomic: it renders to `<path>.tmp` and renames over the dump.
//! Recovery is all-or-nothing: a missing or unreadable file yields empty
//! state, a corrupt one is a hard error.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::linebuf;
use crate::store::{clip, now_secs, Session, Store, HOSTNAME_MAX, USERNAME_MAX};
use crate::update::{format_login, parse_login, LoginRecord};

/// A corrupt snapshot. Fatal at startup; the daemon exits with status 2
/// rather than run on half a world.
#[derive(Debug)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

impl ParseError {
    fn new(line: usize, message: impl Into<String>) -> Self {
        Self { line, message: message.into() }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dump parse error at line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Write a full snapshot of `store` to `path`, atomically.
pub fn save(store: &Store, path: &Path) -> anyhow::Result<()> {
    let mut out = String::new();

    for machine in store.machines() {
        out.push_str(&machine.hostname);
        out.push('\n');
    }
    out.push('\n');

    for user in store.users() {
        out.push_str(&user.username);
        out.push('\n');
    }
    out.push('\n');

    for machine in store.machines() {
        out.push_str(&machine.hostname);
        out.push('\n');
        for &id in machine.logins().iter().chain(machine.past_logins()) {
            if let Some(session) = store.session(id) {
                out.push_str(&format_login(&session_record(session)));
            }
        }
        out.push('\n');
    }
    out.push('\n');

    let tmp = tmp_path(path);
    std::fs::write(&tmp, &out)
        .with_context(|| format!("writing snapshot to {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming snapshot over {}", path.display()))?;
    Ok(())
}

/// Rebuild `store` from the snapshot at `path`.
///
/// Returns `Ok(false)` when there is nothing to read (first start, or the
/// file is unreadable); that is an empty world, not an error.
pub fn load(store: &mut Store, path: &Path) -> Result<bool, ParseError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::InvalidData => {
            return Err(ParseError::new(0, "snapshot is not text"));
        }
        Err(err) => {
            tracing::info!(path = %path.display(), %err, "no snapshot, starting empty");
            return Ok(false);
        }
    };

    enum Reading {
        Machines,
        Users,
        MachineName,
        Logins,
    }

    let now = now_secs();
    let mut state = Reading::Machines;
    let mut current = String::new();

    for (idx, line) in contents.lines().enumerate() {
        let lineno = idx + 1;
        if line.len() > linebuf::LINE_MAX {
            return Err(ParseError::new(lineno, "line too long"));
        }
        if line.is_empty() {
            state = match state {
                Reading::Machines => Reading::Users,
                Reading::Users | Reading::Logins => Reading::MachineName,
                Reading::MachineName => Reading::MachineName,
            };
            continue;
        }
        match state {
            Reading::Machines => {
                store.find_or_add_machine(clip(line, HOSTNAME_MAX), now);
            }
            Reading::Users => {
                store.find_or_add_user(clip(line, USERNAME_MAX));
            }
            Reading::MachineName => {
                if store.machine(line).is_none() {
                    return Err(ParseError::new(lineno, format!("unknown machine {line:?}")));
                }
                current = line.to_owned();
                state = Reading::Logins;
            }
            Reading::Logins => {
                let Some(rec) = parse_login(line) else {
                    return Err(ParseError::new(lineno, "bad login record"));
                };
                store.add_session(&current, &rec, now);
            }
        }
    }

    store.fix_after_load();
    Ok(true)
}

fn session_record(session: &Session) -> LoginRecord {
    LoginRecord {
        user: session.user.clone(),
        line: session.line.clone(),
        login_time: session.login_time,
        idle_time: session.idle_time,
        host: session.host.clone(),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

#[cfg(test)]
#[path = "dump_tests.rs"]
mod tests;
