// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The aggregator event loop.
//!
//! Single process, single thread: a current-thread runtime drives two
//! accept loops, one task per connection, the housekeeper, and the signal
//! watchers, all sharing the store through `Rc<RefCell<..>>`. Every store
//! mutation happens on this thread, so each `!!! END` commits a machine's
//! cycle atomically with respect to queries.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::LocalSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dump;
use crate::finger;
use crate::housekeeper;
use crate::linebuf::{Fetched, LineBuffer, BUFFER_SIZE};
use crate::resolve::{short_hostname, DnsResolver, PeerResolver, SystemDirectory, UserDirectory};
use crate::store::{clip, now_secs, Store, HOSTNAME_MAX};
use crate::update::{parse_record, Record};

/// The two always-listening sockets count against `max_clients`, as slots
/// in the connection table always have.
const LISTENERS: usize = 2;

/// Pluggable system lookups, injectable for tests.
pub struct ServerDeps {
    pub resolver: Rc<dyn PeerResolver>,
    pub directory: Box<dyn UserDirectory>,
}

impl ServerDeps {
    /// Reverse DNS and the local password database.
    pub fn system() -> Self {
        Self { resolver: Rc::new(DnsResolver), directory: Box::new(SystemDirectory) }
    }
}

/// State shared by every task on the loop thread.
pub(crate) struct Shared {
    pub(crate) store: RefCell<Store>,
    pub(crate) config: RefCell<Config>,
    pub(crate) conns: RefCell<ConnTable>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) config_path: PathBuf,
}

/// Connection bookkeeping: a descriptor count for the cap and a
/// cancellation token per agent connection so the housekeeper can close
/// idled-out machines.
#[derive(Default)]
pub(crate) struct ConnTable {
    next_id: u64,
    active: usize,
    agents: HashMap<u64, CancellationToken>,
}

impl ConnTable {
    fn open(&mut self) -> u64 {
        self.next_id += 1;
        self.active += 1;
        self.next_id
    }

    fn register_agent(&mut self, id: u64, cancel: CancellationToken) {
        self.agents.insert(id, cancel);
    }

    fn close(&mut self, id: u64) {
        self.active = self.active.saturating_sub(1);
        self.agents.remove(&id);
    }

    pub(crate) fn cancel_agent(&self, id: u64) {
        if let Some(cancel) = self.agents.get(&id) {
            cancel.cancel();
        }
    }

    fn active(&self) -> usize {
        self.active
    }
}

/// A bound but not yet running aggregator.
pub struct Server {
    update_listener: TcpListener,
    finger_listener: TcpListener,
    resolver: Rc<dyn PeerResolver>,
    shared: Rc<Shared>,
}

impl Server {
    /// Restore the snapshot and bind both listening sockets.
    ///
    /// A corrupt snapshot surfaces as [`dump::ParseError`] inside the
    /// returned error; any bind failure is fatal to startup.
    pub async fn bind(
        config: Config,
        config_path: PathBuf,
        deps: ServerDeps,
    ) -> anyhow::Result<Self> {
        let mut store = Store::new(deps.directory);
        if dump::load(&mut store, &config.dump_file)? {
            info!(
                machines = store.machines().count(),
                users = store.users().count(),
                sessions = store.session_count(),
                "snapshot restored"
            );
        }

        let update_listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .with_context(|| format!("binding update port {}", config.port))?;
        let finger_listener = TcpListener::bind(("0.0.0.0", config.finger_port))
            .await
            .with_context(|| format!("binding finger port {}", config.finger_port))?;

        let shared = Rc::new(Shared {
            store: RefCell::new(store),
            config: RefCell::new(config),
            conns: RefCell::new(ConnTable::default()),
            shutdown: CancellationToken::new(),
            config_path,
        });

        Ok(Self { update_listener, finger_listener, resolver: deps.resolver, shared })
    }

    pub fn update_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.update_listener.local_addr()?)
    }

    pub fn finger_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.finger_listener.local_addr()?)
    }

    /// Token that ends [`Server::run`] when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Serve until the shutdown token fires.
    pub async fn run(self) -> anyhow::Result<()> {
        let local = LocalSet::new();
        local.run_until(self.serve()).await
    }

    async fn serve(self) -> anyhow::Result<()> {
        let Self { update_listener, finger_listener, resolver, shared } = self;

        if let Err(err) = spawn_signal_watchers(&shared) {
            // No signals in this environment (containers without a
            // reactor-backed signal driver); keep serving.
            warn!(%err, "signal handling unavailable");
        }
        tokio::task::spawn_local(housekeeper::run(Rc::clone(&shared)));

        info!(
            update = %update_listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            finger = %finger_listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "fingerd listening"
        );

        tokio::task::spawn_local(accept_agents(update_listener, Rc::clone(&shared), resolver));
        tokio::task::spawn_local(accept_fingers(finger_listener, Rc::clone(&shared)));

        shared.shutdown.cancelled().await;
        Ok(())
    }
}

// -- Accept loops -------------------------------------------------------------

async fn accept_agents(
    listener: TcpListener,
    shared: Rc<Shared>,
    resolver: Rc<dyn PeerResolver>,
) {
    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "accept failed on update port");
                continue;
            }
        };
        if at_capacity(&shared) {
            warn!(%peer, "refusing agent connection, table full");
            continue;
        }

        // The reporting machine is whoever the peer address resolves to,
        // not whatever the payload claims.
        let hostname = resolver.hostname(peer.ip()).unwrap_or_else(|| peer.ip().to_string());
        let hostname = clip(short_hostname(&hostname), HOSTNAME_MAX).to_owned();

        let cancel = shared.shutdown.child_token();
        let conn = {
            let mut conns = shared.conns.borrow_mut();
            let conn = conns.open();
            conns.register_agent(conn, cancel.clone());
            conn
        };
        shared.store.borrow_mut().attach_connection(&hostname, conn, now_secs());
        debug!(%peer, %hostname, conn, "agent connected");
        tokio::task::spawn_local(serve_agent(Rc::clone(&shared), stream, hostname, conn, cancel));
    }
}

async fn accept_fingers(listener: TcpListener, shared: Rc<Shared>) {
    loop {
        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "accept failed on finger port");
                continue;
            }
        };
        if at_capacity(&shared) {
            warn!(%peer, "refusing finger connection, table full");
            continue;
        }
        let conn = shared.conns.borrow_mut().open();
        let cancel = shared.shutdown.child_token();
        tokio::task::spawn_local(serve_finger(Rc::clone(&shared), stream, conn, cancel));
    }
}

fn at_capacity(shared: &Shared) -> bool {
    let max_clients = shared.config.borrow().max_clients;
    shared.conns.borrow().active() + LISTENERS >= max_clients
}

// -- Per-connection protocol drivers ------------------------------------------

/// Long-lived agent connection: line-framed updates until BYE, EOF, or a
/// read error.
async fn serve_agent(
    shared: Rc<Shared>,
    mut stream: TcpStream,
    hostname: String,
    conn: u64,
    cancel: CancellationToken,
) {
    let mut buf = LineBuffer::new();
    let mut chunk = [0u8; 1024];

    'conn: loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = stream.read(&mut chunk) => read,
        };
        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(%hostname, %err, "agent read failed");
                break;
            }
        };
        buf.extend(&chunk[..n]);

        loop {
            match buf.fetch_line() {
                Fetched::WantMore => break,
                Fetched::Blank => {
                    shared.store.borrow_mut().commit_cycle(&hostname, now_secs());
                }
                Fetched::TooLong => {
                    debug!(%hostname, "skipping overlong update line");
                }
                Fetched::Line(line) => match parse_record(&line) {
                    Record::End => {
                        shared.store.borrow_mut().commit_cycle(&hostname, now_secs());
                    }
                    Record::Bye => {
                        shared.store.borrow_mut().delete_logins(&hostname, true);
                        break 'conn;
                    }
                    Record::Note => {}
                    Record::Login(rec) => {
                        shared.store.borrow_mut().update_login(&hostname, &rec, now_secs());
                    }
                    Record::Malformed => {
                        debug!(%hostname, %line, "skipping malformed update line");
                    }
                },
            }
        }

        buf.compact();
        if buf.stuck() {
            warn!(%hostname, "update stream overflow, dropping connection");
            break;
        }
    }

    shared.store.borrow_mut().detach_connection(&hostname, conn);
    shared.conns.borrow_mut().close(conn);
    debug!(%hostname, conn, "agent disconnected");
}

/// One-shot finger connection: read a CRLF-terminated request, write the
/// rendered response, close.
async fn serve_finger(
    shared: Rc<Shared>,
    mut stream: TcpStream,
    conn: u64,
    cancel: CancellationToken,
) {
    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];

    let complete = loop {
        if finger::complete_request(&request) {
            break true;
        }
        if request.len() >= BUFFER_SIZE {
            debug!("oversized finger request dropped");
            break false;
        }
        let read = tokio::select! {
            _ = cancel.cancelled() => break false,
            read = stream.read(&mut chunk) => read,
        };
        match read {
            Ok(0) => break false,
            Ok(n) => request.extend_from_slice(&chunk[..n]),
            Err(err) => {
                debug!(%err, "finger read failed");
                break false;
            }
        }
    };

    if complete {
        let raw = String::from_utf8_lossy(&request);
        let parsed = finger::parse_request(&raw);
        let response = finger::respond(&shared.store.borrow(), &parsed, now_secs());
        if let Err(err) = stream.write_all(response.as_bytes()).await {
            debug!(%err, "finger write failed");
        }
        let _ = stream.shutdown().await;
    }

    shared.conns.borrow_mut().close(conn);
}

// -- Signals ------------------------------------------------------------------

fn spawn_signal_watchers(shared: &Rc<Shared>) -> anyhow::Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let reload = Rc::clone(shared);
    tokio::task::spawn_local(async move {
        loop {
            tokio::select! {
                _ = reload.shutdown.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }
            let path = reload.config_path.clone();
            reload.config.borrow_mut().apply_file(&path);
            info!(path = %path.display(), "configuration reloaded");
        }
    });

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let quit = Rc::clone(shared);
    tokio::task::spawn_local(async move {
        tokio::select! {
            _ = quit.shutdown.cancelled() => return,
            _ = terminate.recv() => {}
            _ = interrupt.recv() => {}
        }
        info!("shutting down");
        let path = quit.config.borrow().dump_file.clone();
        if let Err(err) = dump::save(&quit.store.borrow(), &path) {
            warn!(%err, "final snapshot failed");
        }
        quit.shutdown.cancel();
    });

    Ok(())
}
