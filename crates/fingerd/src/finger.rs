// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! RFC-1288-style query handling: parse one CRLF-terminated request,
//! scan the store, render the response.
//!
//! Forwarding requests (more than one `@`) are recognized and refused;
//! this service never relays.

use crate::store::{SessionId, Store, User};

/// Reply sent for a forwarding request, with no terminator, before close.
pub const FORWARD_DENIED: &str = "Finger forwarding service denied";

/// A structured finger query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Username or fullname token to match; empty lists everyone.
    pub user: String,
    /// Restrict to one machine; empty means all.
    pub host: String,
    /// `/W` was given. Parsed, renders identically for now.
    pub verbose: bool,
    /// The request named a relay chain and must be refused.
    pub forward: bool,
}

/// A request is complete once the buffer ends in CRLF.
pub fn complete_request(buf: &[u8]) -> bool {
    buf.len() >= 2 && buf[buf.len() - 2] == b'\r' && buf[buf.len() - 1] == b'\n'
}

/// Parse `[ "/W" SP* ] [ user ] [ "@" host ] CRLF`.
///
/// Anything unparseable degrades to the empty request (list everything);
/// only a second `@` makes the request a refused forwarding request.
pub fn parse_request(raw: &str) -> Request {
    let mut request = Request::default();

    if raw.matches('@').count() >= 2 {
        request.forward = true;
        return request;
    }

    let body = match raw.find('\r') {
        Some(end) => &raw[..end],
        None => raw,
    };

    let (body, host) = match body.split_once('@') {
        Some((user_part, host)) => (user_part, host),
        None => (body, ""),
    };
    request.host = host.to_owned();

    let mut user = body.trim_start_matches(' ');
    if let Some(rest) = user.strip_prefix("/W") {
        request.verbose = true;
        user = rest.trim_start_matches(' ');
    }
    request.user = user.trim_end_matches(' ').to_owned();

    request
}

/// Whether a query name selects this user: exact username match, or an
/// exact match against one whitespace/hyphen-delimited fullname token.
fn user_matches(user: &User, name: &str) -> bool {
    if user.username == name {
        return true;
    }
    let Some(ref fullname) = user.fullname else {
        return false;
    };
    fullname
        .split(|c: char| c.is_whitespace() || c == '-')
        .any(|token| !token.is_empty() && token == name)
}

/// Build the full response body for one request.
pub fn respond(store: &Store, request: &Request, now: i64) -> String {
    if request.forward {
        return FORWARD_DENIED.to_owned();
    }

    let mut ids: Vec<SessionId> = Vec::new();
    if !request.user.is_empty() {
        for user in store.users().filter(|u| user_matches(u, &request.user)) {
            for &id in user.logins() {
                let keep = request.host.is_empty()
                    || store.session(id).is_some_and(|s| s.machine == request.host);
                if keep {
                    ids.push(id);
                }
            }
        }
    } else if !request.host.is_empty() {
        if let Some(machine) = store.machine(&request.host) {
            ids.extend_from_slice(machine.logins());
        }
    } else {
        for machine in store.machines() {
            ids.extend_from_slice(machine.logins());
        }
    }

    ids.sort_by(|&a, &b| {
        let name = |id| store.session(id).map(|s| s.user.as_str()).unwrap_or("");
        name(a).cmp(&name(b))
    });

    let mut response = String::new();
    for id in ids {
        let Some(session) = store.session(id) else { continue };
        response.push_str(&format!(
            "{:<15} {:<15} {:>8} {:>6} {:>6} {}\n",
            session.user,
            session.machine,
            session.line,
            format_timediff(now - session.login_time),
            format_timediff(session.idle_time),
            session.host,
        ));
    }
    response.push_str("\r\n");
    response
}

/// Compact age rendering used by the session lines.
pub fn format_timediff(diff: i64) -> String {
    if diff < 0 {
        "n/a".to_owned()
    } else if diff < 60 {
        format!("{diff}s")
    } else if diff < 60 * 60 {
        format!("{}m{}s", diff / 60, diff % 60)
    } else if diff < 60 * 60 * 24 {
        format!("{}h{}m", diff / (60 * 60), (diff % (60 * 60)) / 60)
    } else {
        format!("{}d{}h", diff / (60 * 60 * 24), (diff % (60 * 60 * 24)) / (60 * 60))
    }
}

#[cfg(test)]
#[path = "finger_tests.rs"]
mod tests;
