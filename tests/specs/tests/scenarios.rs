// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end protocol scenarios against a live aggregator.

use fingerd_specs::{
    finger_query, finger_until, send_update, send_update_from, Harness,
};

#[tokio::test]
async fn single_login_single_finger() -> anyhow::Result<()> {
    let server = Harness::new().machine([127, 0, 0, 1], "lab1.example.com").start()?;
    send_update(server.update_addr, "alice pts/0 1700000000 5 :0.0 \n!!! END\n").await?;

    let response =
        finger_until(server.finger_addr, "alice\r\n", |r| r.contains("alice")).await?;
    let Some(line) = response.lines().next() else {
        anyhow::bail!("empty response: {response:?}");
    };
    assert!(
        line.starts_with("alice           lab1            "),
        "unexpected columns: {line:?}"
    );
    assert!(line.contains("pts/0"));
    assert!(line.contains("5s"));
    assert!(line.ends_with(":0.0"));
    assert!(response.ends_with("\r\n"));
    Ok(())
}

#[tokio::test]
async fn empty_cycle_logs_the_user_out() -> anyhow::Result<()> {
    let server = Harness::new().machine([127, 0, 0, 1], "lab1.example.com").start()?;
    send_update(server.update_addr, "alice pts/0 1700000000 5 :0.0 \n!!! END\n").await?;
    finger_until(server.finger_addr, "alice\r\n", |r| r.contains("alice")).await?;

    // Next cycle reports nobody.
    send_update(server.update_addr, "!!! END\n").await?;
    let response = finger_until(server.finger_addr, "alice\r\n", |r| r == "\r\n").await?;
    assert_eq!(response, "\r\n");
    Ok(())
}

#[tokio::test]
async fn bye_retires_every_session() -> anyhow::Result<()> {
    let server = Harness::new().machine([127, 0, 0, 1], "lab1.example.com").start()?;
    send_update(
        server.update_addr,
        "alice pts/0 1700000000 5 :0.0 \nbob pts/1 1700000000 9 gate \n!!! END\n",
    )
    .await?;
    finger_until(server.finger_addr, "\r\n", |r| r.contains("alice") && r.contains("bob"))
        .await?;

    send_update(server.update_addr, "!!! BYE\n").await?;
    let response = finger_until(server.finger_addr, "\r\n", |r| r == "\r\n").await?;
    assert_eq!(response, "\r\n");
    Ok(())
}

#[tokio::test]
async fn host_filter_selects_one_machine() -> anyhow::Result<()> {
    let server = Harness::new()
        .machine([127, 0, 0, 1], "lab1.example.com")
        .machine([127, 0, 0, 2], "lab2.example.com")
        .start()?;
    send_update_from(
        Some([127, 0, 0, 1]),
        server.update_addr,
        "bob pts/0 1700000000 5 :0.0 \n!!! END\n",
    )
    .await?;
    send_update_from(
        Some([127, 0, 0, 2]),
        server.update_addr,
        "bob pts/1 1700000000 7 :0.0 \n!!! END\n",
    )
    .await?;

    let response =
        finger_until(server.finger_addr, "bob@lab2\r\n", |r| r.contains("lab2")).await?;
    let lines: Vec<&str> = response.lines().filter(|l| !l.is_empty()).collect();
    assert_eq!(lines.len(), 1, "expected one session line: {response:?}");
    assert!(lines[0].contains("lab2"));
    assert!(!lines[0].contains("lab1"));

    // Unfiltered, bob shows up on both machines.
    let both = finger_until(server.finger_addr, "bob\r\n", |r| {
        r.contains("lab1") && r.contains("lab2")
    })
    .await?;
    assert_eq!(both.lines().filter(|l| !l.is_empty()).count(), 2);
    Ok(())
}

#[tokio::test]
async fn fullname_tokens_match_whole_words_only() -> anyhow::Result<()> {
    let server = Harness::new()
        .machine([127, 0, 0, 1], "lab1.example.com")
        .person("jdoe", "John Doe")
        .start()?;
    send_update(server.update_addr, "jdoe pts/0 1700000000 3 :0.0 \n!!! END\n").await?;
    finger_until(server.finger_addr, "jdoe\r\n", |r| r.contains("jdoe")).await?;

    for query in ["John\r\n", "Doe\r\n"] {
        let response = finger_query(server.finger_addr, query).await?;
        assert!(response.contains("jdoe"), "query {query:?} should match: {response:?}");
    }
    let response = finger_query(server.finger_addr, "Jo\r\n").await?;
    assert_eq!(response, "\r\n");
    Ok(())
}

#[tokio::test]
async fn forwarding_requests_are_refused() -> anyhow::Result<()> {
    let server = Harness::new().start()?;
    let response = finger_query(server.finger_addr, "user@host@relay\r\n").await?;
    assert_eq!(response, "Finger forwarding service denied");
    Ok(())
}

#[tokio::test]
async fn malformed_lines_do_not_kill_the_connection() -> anyhow::Result<()> {
    let server = Harness::new().machine([127, 0, 0, 1], "lab1.example.com").start()?;
    send_update(
        server.update_addr,
        "complete garbage\nalice pts/0 1700000000 5 :0.0 \n!!! END\n",
    )
    .await?;
    let response =
        finger_until(server.finger_addr, "alice\r\n", |r| r.contains("alice")).await?;
    assert!(response.contains("alice"));
    Ok(())
}
