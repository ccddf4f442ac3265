//! Remote observer transport.
//!
//! A relay thread accepts TCP clients and speaks newline-delimited JSON. New
//! clients first receive a snapshot of the last known console and device
//! state, then every event the host publishes. Lines from clients are parsed
//! into [`Command`]s and queued for the dispatch loop, which applies them
//! between bus ticks. Bad input is logged and dropped; it never closes a
//! connection. A client that stops reading is disconnected once its unsent
//! output passes [`RelayConfig::max_backlog`].

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as cb;
use log::{debug, info, warn};
use pdp8_core::protocol::{Command, Event};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

mod client;
mod mirror;

pub use client::{MAX_BACKLOG, MAX_LINE};
pub use mirror::StateMirror;

use client::{Client, ReadState};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    /// Unsent bytes a client may fall behind by before it is disconnected.
    pub max_backlog: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8808)),
            max_backlog: MAX_BACKLOG,
        }
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("cannot listen on {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("cannot start relay thread: {0}")]
    Spawn(io::Error),
}

/// Host-side end of a running relay.
pub struct RelayHandle {
    local_addr: SocketAddr,
    commands: cb::Receiver<Command>,
    events: cb::Sender<Event>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn try_recv_command(&self) -> Option<Command> {
        self.commands.try_recv().ok()
    }

    /// Queues an event for every connected client and the snapshot mirror.
    pub fn publish(&self, event: Event) {
        if let Err(cb::SendError(event)) = self.events.send(event) {
            warn!("Relay: thread has exited, dropping {} event", event.tag());
        }
    }

    pub fn shutdown(mut self) {
        self.stop_thread();
    }

    fn stop_thread(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

pub fn spawn_relay(config: &RelayConfig) -> Result<RelayHandle, RelayError> {
    let listener = bind_listener(config.bind).map_err(|source| RelayError::Bind {
        addr: config.bind,
        source,
    })?;
    let local_addr = listener.local_addr().map_err(|source| RelayError::Bind {
        addr: config.bind,
        source,
    })?;

    let (command_tx, command_rx) = cb::unbounded();
    let (event_tx, event_rx) = cb::unbounded();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let max_backlog = config.max_backlog;

    let thread = thread::Builder::new()
        .name("pdp8-relay".to_string())
        .spawn(move || relay_thread_main(listener, max_backlog, command_tx, event_rx, stop_flag))
        .map_err(RelayError::Spawn)?;

    info!("Relay: listening on {local_addr}");
    Ok(RelayHandle {
        local_addr,
        commands: command_rx,
        events: event_tx,
        stop,
        thread: Some(thread),
    })
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true).ok();
    socket.bind(&addr.into())?;
    socket.listen(16)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn relay_thread_main(
    listener: TcpListener,
    max_backlog: usize,
    command_tx: cb::Sender<Command>,
    event_rx: cb::Receiver<Event>,
    stop: Arc<AtomicBool>,
) {
    let mut clients: Vec<Client> = Vec::new();
    let mut mirror = StateMirror::default();

    while !stop.load(Ordering::Acquire) {
        // Fold pending events into the mirror before greeting new clients so
        // a snapshot is never older than the stream that follows it.
        let mut outgoing = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            mirror.record(&event);
            match serde_json::to_string(&event) {
                Ok(line) => outgoing.push(line),
                Err(e) => warn!("Relay: cannot encode {} event: {e}", event.tag()),
            }
        }
        for client in &mut clients {
            for line in &outgoing {
                client.queue_line(line);
            }
        }

        loop {
            match listener.accept() {
                Ok((stream, addr)) => match Client::new(stream, addr, max_backlog) {
                    Ok(mut client) => {
                        info!("Relay: client connected from {addr}");
                        for event in mirror.snapshot() {
                            if let Ok(line) = serde_json::to_string(&event) {
                                client.queue_line(&line);
                            }
                        }
                        clients.push(client);
                    }
                    Err(e) => warn!("Relay: cannot set up client {addr}: {e}"),
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Relay: listener accept error: {e}");
                    break;
                }
            }
        }

        clients.retain_mut(|client| {
            let alive = match client.poll_read() {
                Ok(ReadState::Alive) => true,
                Ok(ReadState::Disconnected) => false,
                Err(e) => {
                    warn!("Relay: read error from {}: {e}", client.addr);
                    false
                }
            };
            for line in client.drain_lines() {
                match Command::parse(&line) {
                    Ok(command) => {
                        debug!("Relay: {} -> {}", client.addr, command.name());
                        if command_tx.send(command).is_err() {
                            debug!("Relay: host stopped taking commands");
                        }
                    }
                    Err(e) => warn!("Relay: dropped command from {}: {e}", client.addr),
                }
            }
            if !alive {
                info!("Relay: client {} disconnected", client.addr);
                return false;
            }
            if let Err(e) = client.flush() {
                warn!("Relay: write error to {}: {e}", client.addr);
                return false;
            }
            if client.overflowed() {
                warn!(
                    "Relay: {} fell more than {max_backlog} bytes behind, disconnecting",
                    client.addr
                );
                return false;
            }
            true
        });

        thread::sleep(POLL_INTERVAL);
    }
    info!("Relay: shutting down");
}
