// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Line-oriented `KEY VALUE` configuration.
//!
//! Unknown keys are ignored and malformed lines keep the previous value;
//! a reload starts from the running values, not from defaults.

use std::path::{Path, PathBuf};

/// Runtime configuration for both roles.
#[derive(Debug, Clone)]
pub struct Config {
    /// Update listen port (server) or push target port (agent).
    pub port: u16,
    /// Finger query listen port.
    pub finger_port: u16,
    /// Aggregator address the agent connects to.
    pub server_addr: Option<String>,
    /// Snapshot path.
    pub dump_file: PathBuf,
    /// Cap on one outgoing agent record.
    pub max_msg_size: usize,
    /// Cap on simultaneous descriptors, listeners included.
    pub max_clients: usize,
    /// Agent push period, seconds.
    pub timeout_update: u64,
    /// Snapshot period, seconds.
    pub timeout_dump: u64,
    /// Old-record purge period, seconds.
    pub timeout_clear: u64,
    /// Record-cap trim period, seconds.
    pub timeout_cut: u64,
    /// Machine idle-out threshold, seconds.
    pub client_lifetime: i64,
    /// Combined live+past session cap per machine and per user.
    pub num_records: usize,
    /// Retention window for past records, seconds.
    pub archive_time: i64,
    /// Run the agent role.
    pub is_client: bool,
    /// Run the aggregator role. Wins over `is_client`.
    pub is_server: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 79,
            finger_port: 0,
            server_addr: None,
            dump_file: PathBuf::from("serverdump"),
            max_msg_size: 2000,
            max_clients: 128,
            timeout_update: 10,
            timeout_dump: 60 * 5,
            timeout_clear: 60 * 60 * 12,
            timeout_cut: 60 * 60,
            client_lifetime: 60 * 15,
            num_records: 100,
            archive_time: 60 * 60 * 24,
            is_client: false,
            is_server: false,
        }
    }
}

impl Config {
    /// Read `path` over the current values. A missing or unreadable file
    /// leaves everything untouched; so does every malformed line.
    pub fn apply_file(&mut self, path: &Path) {
        let Ok(contents) = std::fs::read_to_string(path) else {
            tracing::debug!(path = %path.display(), "no config file, keeping current values");
            return;
        };
        for line in contents.lines() {
            self.apply_line(line);
        }
    }

    fn apply_line(&mut self, line: &str) {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        let Some(sep) = line.find([' ', '\t']) else {
            return;
        };
        let key = &line[..sep];
        let value = line[sep..].trim_start_matches([' ', '\t']);
        if value.is_empty() {
            return;
        }

        match key {
            "PORT" => set_num(&mut self.port, value),
            "FINGER_PORT" => set_num(&mut self.finger_port, value),
            "SERVER_ADDR" => self.server_addr = Some(value.to_owned()),
            "DUMP_FILE" => self.dump_file = PathBuf::from(value),
            "MAX_MSG_SIZE" => set_num(&mut self.max_msg_size, value),
            "MAX_CLIENTS" => set_num(&mut self.max_clients, value),
            "TIMEOUT_UPDATE" => set_num(&mut self.timeout_update, value),
            "TIMEOUT_DUMP" => set_num(&mut self.timeout_dump, value),
            "CLIENT_LIFETIME" => set_num(&mut self.client_lifetime, value),
            "NUM_RECORDS" => set_num(&mut self.num_records, value),
            "ARCHIVE_TIME" => set_num(&mut self.archive_time, value),
            "IS_CLIENT" => set_flag(&mut self.is_client, value),
            "IS_SERVER" => set_flag(&mut self.is_server, value),
            _ => {}
        }
    }
}

fn set_num<T: std::str::FromStr>(slot: &mut T, value: &str) {
    if let Ok(parsed) = value.parse() {
        *slot = parsed;
    }
}

fn set_flag(slot: &mut bool, value: &str) {
    if let Ok(parsed) = value.parse::<i64>() {
        *slot = parsed != 0;
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
