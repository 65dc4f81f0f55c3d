// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot persistence across a full stop/start of the aggregator.

use std::time::Duration;

use fingerd_specs::{finger_query, finger_until, send_update_from, wait_for_file, Harness};

const QUERIES: [&str; 8] = [
    "\r\n",
    "alice\r\n",
    "bob\r\n",
    "carol\r\n",
    "@lab1\r\n",
    "@lab2\r\n",
    "alice@lab2\r\n",
    "bob@lab1\r\n",
];

#[tokio::test]
async fn snapshot_survives_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let dump = dir.path().join("dump");

    let mut before = Vec::new();
    {
        let server = Harness::new()
            .machine([127, 0, 0, 1], "lab1.example.com")
            .machine([127, 0, 0, 2], "lab2.example.com")
            .dump_file(dump.clone())
            .snapshot_every(1)
            .start()?;
        send_update_from(
            Some([127, 0, 0, 1]),
            server.update_addr,
            "alice pts/0 1700000000 300 :0.0 \nbob pts/1 1700000100 120 gate \n!!! END\n",
        )
        .await?;
        send_update_from(
            Some([127, 0, 0, 2]),
            server.update_addr,
            "alice pts/2 1700000200 60 :0.1 \ncarol tty1 1700000300 30 console \n!!! END\n",
        )
        .await?;
        finger_until(server.finger_addr, "\r\n", |r| {
            r.lines().filter(|l| !l.is_empty()).count() == 4
        })
        .await?;

        assert!(wait_for_file(&dump, Duration::from_secs(5)).await, "no snapshot appeared");
        // Let one more period pass so the snapshot includes all four
        // sessions, not just whatever had arrived at the first tick.
        tokio::time::sleep(Duration::from_millis(1500)).await;

        for query in QUERIES {
            before.push(finger_query(server.finger_addr, query).await?);
        }
    }

    let server = Harness::new()
        .machine([127, 0, 0, 1], "lab1.example.com")
        .machine([127, 0, 0, 2], "lab2.example.com")
        .dump_file(dump)
        .start()?;
    for (query, expected) in QUERIES.iter().zip(&before) {
        let after = finger_query(server.finger_addr, query).await?;
        assert_eq!(&after, expected, "query {query:?} diverged after restart");
    }
    Ok(())
}
