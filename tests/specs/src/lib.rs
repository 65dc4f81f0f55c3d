// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end aggregator scenarios.
//!
//! Runs a real [`fingerd::server::Server`] on its own current-thread
//! runtime with an injected peer resolver and user directory, then talks
//! to it over TCP like agents and finger clients would. Multi-machine
//! scenarios connect from distinct loopback addresses.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

use fingerd::config::Config;
use fingerd::resolve::{GecosInfo, StaticDirectory, StaticResolver};
use fingerd::server::{Server, ServerDeps};

/// Builder for a test aggregator.
pub struct Harness {
    resolver: HashMap<IpAddr, String>,
    directory: HashMap<String, GecosInfo>,
    config: Config,
    dump_file: Option<PathBuf>,
}

impl Harness {
    pub fn new() -> Self {
        let mut config = Config::default();
        config.is_server = true;
        config.port = 0;
        config.finger_port = 0;
        Self {
            resolver: HashMap::new(),
            directory: HashMap::new(),
            config,
            dump_file: None,
        }
    }

    /// Declare what a loopback source address reverse-resolves to.
    pub fn machine(mut self, ip: [u8; 4], fqdn: &str) -> Self {
        self.resolver.insert(IpAddr::from(ip), fqdn.to_owned());
        self
    }

    /// Declare a password-database entry.
    pub fn person(mut self, username: &str, fullname: &str) -> Self {
        self.directory.insert(
            username.to_owned(),
            GecosInfo { fullname: Some(fullname.to_owned()), add_info: None },
        );
        self
    }

    /// Persist to a caller-owned path (so a later harness can restart on
    /// the same snapshot).
    pub fn dump_file(mut self, path: PathBuf) -> Self {
        self.dump_file = Some(path);
        self
    }

    /// Snapshot period, for persistence scenarios.
    pub fn snapshot_every(mut self, secs: u64) -> Self {
        self.config.timeout_dump = secs;
        self
    }

    /// Start the server on ephemeral ports.
    pub fn start(self) -> anyhow::Result<TestServer> {
        let Harness { resolver, directory, mut config, dump_file } = self;

        let own_dir = match &dump_file {
            Some(_) => None,
            None => Some(tempfile::tempdir()?),
        };
        config.dump_file = match (&dump_file, &own_dir) {
            (Some(path), _) => path.clone(),
            (None, Some(dir)) => dir.path().join("dump"),
            (None, None) => PathBuf::from("dump"),
        };

        let (tx, rx) = std::sync::mpsc::channel();
        let thread = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = tx.send(Err(anyhow::Error::from(err)));
                    return;
                }
            };
            runtime.block_on(async move {
                let deps = ServerDeps {
                    resolver: Rc::new(StaticResolver::new(resolver)),
                    directory: Box::new(StaticDirectory::new(directory)),
                };
                let server = match Server::bind(config, PathBuf::from("config"), deps).await {
                    Ok(server) => server,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                let ready = server
                    .update_addr()
                    .and_then(|u| server.finger_addr().map(|f| (u, f, server.shutdown_token())));
                match ready {
                    Ok(info) => {
                        let _ = tx.send(Ok(info));
                        let _ = server.run().await;
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err));
                    }
                }
            });
        });

        let (update_addr, finger_addr, shutdown) =
            rx.recv().context("server thread died before reporting")??;
        // The listeners bind the wildcard address; clients dial loopback.
        let loopback =
            |addr: SocketAddr| SocketAddr::new(IpAddr::from([127, 0, 0, 1]), addr.port());
        Ok(TestServer {
            update_addr: loopback(update_addr),
            finger_addr: loopback(finger_addr),
            shutdown,
            thread: Some(thread),
            _own_dir: own_dir,
        })
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// A running aggregator, stopped and joined on drop.
pub struct TestServer {
    pub update_addr: SocketAddr,
    pub finger_addr: SocketAddr,
    shutdown: CancellationToken,
    thread: Option<std::thread::JoinHandle<()>>,
    _own_dir: Option<tempfile::TempDir>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Stream an update payload from the default loopback address.
pub async fn send_update(server: SocketAddr, payload: &str) -> anyhow::Result<()> {
    send_update_from(None, server, payload).await
}

/// Stream an update payload, optionally binding a specific loopback
/// source address so the server sees a particular machine.
pub async fn send_update_from(
    local: Option<[u8; 4]>,
    server: SocketAddr,
    payload: &str,
) -> anyhow::Result<()> {
    let socket = TcpSocket::new_v4()?;
    if let Some(ip) = local {
        socket.bind(SocketAddr::new(IpAddr::from(ip), 0))?;
    }
    let mut stream = socket.connect(server).await?;
    stream.write_all(payload.as_bytes()).await?;
    stream.flush().await?;
    // Give the loop a beat to apply before the close races the read.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

/// One finger round trip: send the query, read to EOF.
pub async fn finger_query(server: SocketAddr, query: &str) -> anyhow::Result<String> {
    let mut stream = TcpStream::connect(server).await?;
    stream.write_all(query.as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(String::from_utf8_lossy(&response).into_owned())
}

/// Poll a finger query until the response satisfies `pred`. After two
/// seconds, return the last answer and let the caller's assert fail.
pub async fn finger_until(
    server: SocketAddr,
    query: &str,
    pred: impl Fn(&str) -> bool,
) -> anyhow::Result<String> {
    for _ in 0..40 {
        let response = finger_query(server, query).await?;
        if pred(&response) {
            return Ok(response);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    finger_query(server, query).await
}

/// Wait for a file to appear (snapshot timers run on wall clock).
pub async fn wait_for_file(path: &std::path::Path, within: Duration) -> bool {
    let deadline = std::time::Instant::now() + within;
    while std::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    path.exists()
}
