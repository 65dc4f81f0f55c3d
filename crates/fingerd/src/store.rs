// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory presence graph: machines, users, and login sessions.
//!
//! Sessions live in a slab arena and are referenced from two sides at
//! once: the owning machine and the owning user each keep a live list
//! and a past list. A session is always on the same shelf on both sides.
//! `link_live`, `link_past` and `unlink` are the only operations that
//! touch the lists.

use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use slab::Slab;

use crate::resolve::UserDirectory;
use crate::update::LoginRecord;

/// Hostname cap, bytes (host part of an FQDN).
pub const HOSTNAME_MAX: usize = 255;
/// Username cap, bytes.
pub const USERNAME_MAX: usize = 32;
/// Terminal-line cap, bytes.
pub const TTY_MAX: usize = 32;

/// Stable arena index of a session.
pub type SessionId = usize;

/// Current wall clock in epoch seconds.
pub fn now_secs() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Clip a field to its byte cap without splitting a character.
pub fn clip(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// One (user, machine, terminal, origin, login_time) tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: String,
    pub machine: String,
    pub line: String,
    pub host: String,
    pub login_time: i64,
    /// Non-negative while live (negative from an agent means "unknown");
    /// forced to -1 when the session moves to the past shelf.
    pub idle_time: i64,
    /// Per-cycle mark consumed by the END sweep.
    checked: bool,
}

/// A reporting workstation.
#[derive(Debug)]
pub struct Machine {
    pub hostname: String,
    /// Wall clock of the last committed update cycle.
    pub last_activity: i64,
    /// Owning agent connection, when one is attached.
    pub connection_id: Option<u64>,
    logins: Vec<SessionId>,
    past_logins: Vec<SessionId>,
}

impl Machine {
    pub fn logins(&self) -> &[SessionId] {
        &self.logins
    }

    pub fn past_logins(&self) -> &[SessionId] {
        &self.past_logins
    }
}

/// A person seen logged in somewhere.
#[derive(Debug)]
pub struct User {
    pub username: String,
    pub fullname: Option<String>,
    pub add_info: Option<String>,
    /// Smallest idle ever reported across this user's live logins.
    pub least_idle: i64,
    logins: Vec<SessionId>,
    past_logins: Vec<SessionId>,
}

impl User {
    pub fn logins(&self) -> &[SessionId] {
        &self.logins
    }

    pub fn past_logins(&self) -> &[SessionId] {
        &self.past_logins
    }
}

/// The aggregator's whole world.
pub struct Store {
    machines: IndexMap<String, Machine>,
    users: IndexMap<String, User>,
    sessions: Slab<Session>,
    directory: Box<dyn UserDirectory>,
}

impl Store {
    pub fn new(directory: Box<dyn UserDirectory>) -> Self {
        Self {
            machines: IndexMap::new(),
            users: IndexMap::new(),
            sessions: Slab::new(),
            directory,
        }
    }

    // -- Lookup ---------------------------------------------------------------

    pub fn machine(&self, hostname: &str) -> Option<&Machine> {
        self.machines.get(hostname)
    }

    pub fn user(&self, username: &str) -> Option<&User> {
        self.users.get(username)
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // -- Creation -------------------------------------------------------------

    /// Look a machine up, creating it with `last_activity = now` when it is
    /// new.
    pub fn find_or_add_machine(&mut self, hostname: &str, now: i64) -> &mut Machine {
        self.machines.entry(hostname.to_owned()).or_insert_with(|| Machine {
            hostname: hostname.to_owned(),
            last_activity: now,
            connection_id: None,
            logins: Vec::new(),
            past_logins: Vec::new(),
        })
    }

    /// Look a user up, resolving gecos details from the directory the first
    /// time the name is seen.
    pub fn find_or_add_user(&mut self, username: &str) -> &mut User {
        let directory = &self.directory;
        self.users.entry(username.to_owned()).or_insert_with(|| {
            let info = directory.lookup(username).unwrap_or_default();
            User {
                username: username.to_owned(),
                fullname: info.fullname,
                add_info: info.add_info,
                least_idle: i64::MAX,
                logins: Vec::new(),
                past_logins: Vec::new(),
            }
        })
    }

    /// Allocate a session for `rec` and link it at the head of both live
    /// lists.
    pub fn add_session(&mut self, hostname: &str, rec: &LoginRecord, now: i64) -> SessionId {
        self.find_or_add_machine(hostname, now);
        self.find_or_add_user(&rec.user);
        let id = self.sessions.insert(Session {
            user: rec.user.clone(),
            machine: hostname.to_owned(),
            line: rec.line.clone(),
            host: rec.host.clone(),
            login_time: rec.login_time,
            idle_time: rec.idle_time,
            checked: true,
        });
        self.link_live(id);
        id
    }

    // -- Update cycle ---------------------------------------------------------

    /// Fold one reported login into the machine's live list.
    ///
    /// A live session matches iff username, login time, terminal line and
    /// origin host are all equal; a match refreshes the idle time and the
    /// user's `least_idle`, anything else allocates a new session.
    pub fn update_login(&mut self, hostname: &str, rec: &LoginRecord, now: i64) {
        let matched = self.machines.get(hostname).and_then(|machine| {
            machine.logins.iter().copied().find(|&id| {
                self.sessions.get(id).is_some_and(|s| {
                    s.user == rec.user
                        && s.login_time == rec.login_time
                        && s.line == rec.line
                        && s.host == rec.host
                })
            })
        });

        match matched {
            Some(id) => {
                let username = match self.sessions.get_mut(id) {
                    Some(session) => {
                        session.idle_time = rec.idle_time;
                        session.checked = true;
                        session.user.clone()
                    }
                    None => return,
                };
                if let Some(user) = self.users.get_mut(&username) {
                    user.least_idle = user.least_idle.min(rec.idle_time);
                }
            }
            None => {
                self.add_session(hostname, rec, now);
            }
        }
    }

    /// The END sweep: every live session not re-reported this cycle (or
    /// every one, with `all`) moves to the past shelf with `idle_time = -1`;
    /// survivors get their mark cleared for the next cycle.
    pub fn delete_logins(&mut self, hostname: &str, all: bool) {
        let ids: Vec<SessionId> = match self.machines.get(hostname) {
            Some(machine) => machine.logins.clone(),
            None => return,
        };
        for id in ids {
            let swept = match self.sessions.get_mut(id) {
                Some(session) if all || !session.checked => {
                    session.idle_time = -1;
                    true
                }
                Some(session) => {
                    session.checked = false;
                    false
                }
                None => false,
            };
            if swept {
                self.unlink(id);
                self.link_past(id);
            }
        }
    }

    /// Commit one update cycle: sweep unreported sessions and refresh the
    /// machine's activity stamp.
    pub fn commit_cycle(&mut self, hostname: &str, now: i64) {
        self.delete_logins(hostname, false);
        if let Some(machine) = self.machines.get_mut(hostname) {
            machine.last_activity = now;
        }
    }

    // -- Connection ownership -------------------------------------------------

    pub fn attach_connection(&mut self, hostname: &str, conn: u64, now: i64) {
        self.find_or_add_machine(hostname, now).connection_id = Some(conn);
    }

    pub fn detach_connection(&mut self, hostname: &str, conn: u64) {
        if let Some(machine) = self.machines.get_mut(hostname) {
            if machine.connection_id == Some(conn) {
                machine.connection_id = None;
            }
        }
    }

    // -- Housekeeping ---------------------------------------------------------

    /// Sweep machines that have not committed a cycle within `lifetime`
    /// seconds. Returns the agent connections that should be closed.
    pub fn idle_out(&mut self, now: i64, lifetime: i64) -> Vec<u64> {
        let stale: Vec<(String, Option<u64>)> = self
            .machines
            .values_mut()
            .filter(|m| now - m.last_activity > lifetime)
            .map(|m| (m.hostname.clone(), m.connection_id.take()))
            .collect();

        let mut conns = Vec::new();
        for (hostname, conn) in stale {
            self.delete_logins(&hostname, true);
            conns.extend(conn);
        }
        conns
    }

    /// Drop past sessions beyond the archive window, then machines and
    /// users that have nothing left and have aged out themselves.
    pub fn purge(&mut self, now: i64, archive_time: i64) {
        let expired: Vec<SessionId> = self
            .machines
            .values()
            .flat_map(|m| m.past_logins.iter().copied())
            .filter(|&id| {
                self.sessions.get(id).is_some_and(|s| now - s.login_time > archive_time)
            })
            .collect();
        for id in expired {
            self.remove_session(id);
        }

        self.machines.retain(|_, m| {
            !(m.logins.is_empty()
                && m.past_logins.is_empty()
                && now - m.last_activity > archive_time)
        });
        self.users.retain(|_, u| {
            !(u.logins.is_empty() && u.past_logins.is_empty() && u.least_idle > archive_time)
        });
    }

    /// Trim every machine's and every user's combined session count to
    /// `num_records`, oldest logins first.
    pub fn cut(&mut self, num_records: usize) {
        let hostnames: Vec<String> = self.machines.keys().cloned().collect();
        for hostname in hostnames {
            let ids = match self.machines.get(&hostname) {
                Some(m) => combined(&m.logins, &m.past_logins),
                None => continue,
            };
            self.trim(ids, num_records);
        }

        let usernames: Vec<String> = self.users.keys().cloned().collect();
        for username in usernames {
            let ids = match self.users.get(&username) {
                Some(u) => combined(&u.logins, &u.past_logins),
                None => continue,
            };
            self.trim(ids, num_records);
        }
    }

    fn trim(&mut self, mut ids: Vec<SessionId>, num_records: usize) {
        if ids.len() <= num_records {
            return;
        }
        let sessions = &self.sessions;
        ids.sort_by_key(|&id| {
            std::cmp::Reverse(sessions.get(id).map_or(i64::MIN, |s| s.login_time))
        });
        for id in ids.split_off(num_records) {
            self.remove_session(id);
        }
    }

    /// Unlink a session from both owners and free it.
    pub fn remove_session(&mut self, id: SessionId) {
        self.unlink(id);
        if self.sessions.contains(id) {
            self.sessions.remove(id);
        }
    }

    // -- Snapshot recovery ----------------------------------------------------

    /// Recovery links everything as live; afterwards each entity's combined
    /// list is ordered (live first, then newest login first) and split into
    /// the two shelves at the live/past boundary.
    pub fn fix_after_load(&mut self) {
        let hostnames: Vec<String> = self.machines.keys().cloned().collect();
        for hostname in hostnames {
            let ids = match self.machines.get_mut(&hostname) {
                Some(m) => {
                    let mut v = std::mem::take(&mut m.logins);
                    v.extend(std::mem::take(&mut m.past_logins));
                    v
                }
                None => continue,
            };
            let (live, past) = self.order_and_split(ids);
            if let Some(m) = self.machines.get_mut(&hostname) {
                m.logins = live;
                m.past_logins = past;
            }
        }

        let usernames: Vec<String> = self.users.keys().cloned().collect();
        for username in usernames {
            let ids = match self.users.get_mut(&username) {
                Some(u) => {
                    let mut v = std::mem::take(&mut u.logins);
                    v.extend(std::mem::take(&mut u.past_logins));
                    v
                }
                None => continue,
            };
            let (live, past) = self.order_and_split(ids);
            if let Some(u) = self.users.get_mut(&username) {
                u.logins = live;
                u.past_logins = past;
            }
        }
    }

    fn order_and_split(&self, mut ids: Vec<SessionId>) -> (Vec<SessionId>, Vec<SessionId>) {
        let sessions = &self.sessions;
        ids.sort_by_key(|&id| {
            let (past, time) =
                sessions.get(id).map_or((true, i64::MIN), |s| (s.idle_time < 0, s.login_time));
            (past, std::cmp::Reverse(time))
        });
        let split =
            ids.partition_point(|&id| sessions.get(id).is_some_and(|s| s.idle_time >= 0));
        let past = ids.split_off(split);
        (ids, past)
    }

    // -- List surgery ---------------------------------------------------------

    fn link_live(&mut self, id: SessionId) {
        let Some((machine, user)) = self.owners(id) else { return };
        if let Some(m) = self.machines.get_mut(&machine) {
            m.logins.insert(0, id);
        }
        if let Some(u) = self.users.get_mut(&user) {
            u.logins.insert(0, id);
        }
    }

    fn link_past(&mut self, id: SessionId) {
        let Some((machine, user)) = self.owners(id) else { return };
        if let Some(m) = self.machines.get_mut(&machine) {
            m.past_logins.insert(0, id);
        }
        if let Some(u) = self.users.get_mut(&user) {
            u.past_logins.insert(0, id);
        }
    }

    fn unlink(&mut self, id: SessionId) {
        let Some((machine, user)) = self.owners(id) else { return };
        if let Some(m) = self.machines.get_mut(&machine) {
            m.logins.retain(|&x| x != id);
            m.past_logins.retain(|&x| x != id);
        }
        if let Some(u) = self.users.get_mut(&user) {
            u.logins.retain(|&x| x != id);
            u.past_logins.retain(|&x| x != id);
        }
    }

    fn owners(&self, id: SessionId) -> Option<(String, String)> {
        self.sessions.get(id).map(|s| (s.machine.clone(), s.user.clone()))
    }
}

fn combined(live: &[SessionId], past: &[SessionId]) -> Vec<SessionId> {
    let mut ids = live.to_vec();
    ids.extend_from_slice(past);
    ids
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
