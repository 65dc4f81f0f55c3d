// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The agent-to-aggregator record grammar.
//!
//! Agents stream newline-framed records over a long-lived connection:
//! login lines describing who is on, and `!!!` control lines framing the
//! cycle. `!!! END` (or a bare blank line, which legacy agents send)
//! commits the cycle; `!!! BYE` is a graceful disconnect.

use crate::store::{clip, HOSTNAME_MAX, TTY_MAX, USERNAME_MAX};

/// One reported login: `USER SP LINE SP LOGIN_TIME SP IDLE_TIME SP HOST SP`.
///
/// Times are decimal epoch seconds; a negative idle means the agent could
/// not tell. The trailing space terminates the host field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRecord {
    pub user: String,
    pub line: String,
    pub login_time: i64,
    pub idle_time: i64,
    pub host: String,
}

/// One parsed update-stream record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Commit the cycle: sweep whatever was not re-reported.
    End,
    /// Graceful disconnect: sweep everything and drop the connection.
    Bye,
    /// An informational control line (`!!! UPDATE` or an unknown `!` line).
    Note,
    /// A login report.
    Login(LoginRecord),
    /// A line that parses as nothing; skipped, connection keeps going.
    Malformed,
}

/// Classify one non-blank line from an agent.
pub fn parse_record(line: &str) -> Record {
    if line.starts_with('!') {
        if line.starts_with("!!! END") {
            return Record::End;
        }
        if line.starts_with("!!! BYE") {
            return Record::Bye;
        }
        return Record::Note;
    }
    match parse_login(line) {
        Some(rec) => Record::Login(rec),
        None => Record::Malformed,
    }
}

/// Parse a login line. Fields are clipped to their entity caps; a missing
/// field terminator or a non-numeric time rejects the whole line.
pub fn parse_login(line: &str) -> Option<LoginRecord> {
    let mut rest = line;
    let user = next_field(&mut rest)?;
    let tty = next_field(&mut rest)?;
    let login_time = next_field(&mut rest)?.parse().ok()?;
    let idle_time = next_field(&mut rest)?.parse().ok()?;
    let host = next_field(&mut rest)?;
    Some(LoginRecord {
        user: clip(user, USERNAME_MAX).to_owned(),
        line: clip(tty, TTY_MAX).to_owned(),
        login_time,
        idle_time,
        host: clip(host, HOSTNAME_MAX).to_owned(),
    })
}

/// Render a login record in wire format, terminator included.
pub fn format_login(rec: &LoginRecord) -> String {
    format!(
        "{} {} {} {} {} \n",
        rec.user, rec.line, rec.login_time, rec.idle_time, rec.host
    )
}

fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let (field, tail) = rest.split_once(' ')?;
    *rest = tail;
    Some(field)
}

#[cfg(test)]
#[path = "update_tests.rs"]
mod tests;
