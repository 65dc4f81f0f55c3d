// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Timed maintenance: snapshot, idle-out, purge, cut.
//!
//! Four deadlines, each rearmed relative to now after firing with its
//! period re-read from config, so a SIGHUP reload takes effect at the
//! next rearm.

use std::rc::Rc;

use tokio::time::{sleep_until, Duration, Instant};
use tracing::{info, warn};

use crate::dump;
use crate::server::Shared;
use crate::store::now_secs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Snapshot,
    IdleOut,
    Purge,
    Cut,
}

pub(crate) async fn run(shared: Rc<Shared>) {
    let mut deadlines = [
        (Instant::now() + period(&shared, Task::Snapshot), Task::Snapshot),
        (Instant::now() + period(&shared, Task::IdleOut), Task::IdleOut),
        (Instant::now() + period(&shared, Task::Purge), Task::Purge),
        (Instant::now() + period(&shared, Task::Cut), Task::Cut),
    ];

    loop {
        let earliest = deadlines.iter().map(|&(when, _)| when).min().unwrap_or_else(Instant::now);
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = sleep_until(earliest) => {}
        }
        let now = Instant::now();
        for slot in &mut deadlines {
            if slot.0 <= now {
                fire(&shared, slot.1);
                slot.0 = Instant::now() + period(&shared, slot.1);
            }
        }
    }
}

fn period(shared: &Shared, task: Task) -> Duration {
    let config = shared.config.borrow();
    let secs = match task {
        Task::Snapshot => config.timeout_dump,
        Task::IdleOut => config.client_lifetime.max(0) as u64,
        Task::Purge => config.timeout_clear,
        Task::Cut => config.timeout_cut,
    };
    Duration::from_secs(secs.max(1))
}

fn fire(shared: &Shared, task: Task) {
    let now = now_secs();
    match task {
        Task::Snapshot => {
            let path = shared.config.borrow().dump_file.clone();
            if let Err(err) = dump::save(&shared.store.borrow(), &path) {
                warn!(%err, "periodic snapshot failed");
            }
        }
        Task::IdleOut => {
            let lifetime = shared.config.borrow().client_lifetime;
            let stale = shared.store.borrow_mut().idle_out(now, lifetime);
            for conn in stale {
                info!(conn, "closing idled-out agent connection");
                shared.conns.borrow().cancel_agent(conn);
            }
        }
        Task::Purge => {
            let archive_time = shared.config.borrow().archive_time;
            shared.store.borrow_mut().purge(now, archive_time);
        }
        Task::Cut => {
            let num_records = shared.config.borrow().num_records;
            shared.store.borrow_mut().cut(num_records);
        }
    }
}
