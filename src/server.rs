//! TCP server - acceptor and per-connection loop
//!
//! One tokio task per client connection, each strictly sequential:
//! read a request, dispatch it through the round-tripper, write the
//! response, repeat. A broadcast channel fans the shutdown signal out to
//! every handler; an mpsc channel whose senders are dropped by finishing
//! handlers tells the acceptor when the last connection has drained.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::time;
use tracing::{debug, error, info};

use crate::keyspace::Keyspace;
use crate::round_tripper::RoundTripper;
use crate::traits::RecordBackend;
use crate::wire::{Connection, Inbound, Response};

/// Cap on concurrently served connections; the acceptor parks beyond it
const MAX_CONNECTIONS: usize = 1024;

/// How long an idle connection may still deliver one request after the
/// shutdown signal; that request is answered with `SERVER_ERROR`
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Serve the bridge until the shutdown future completes
///
/// Accepts connections from `listener`, serving each against a clone of
/// `backend`. When `shutdown` completes (typically a signal future) the
/// acceptor stops immediately and active connections are drained.
///
/// # Errors
///
/// Returns an error when accepting fails beyond the retry budget; active
/// connections are still drained first.
pub async fn run<B>(
    listener: TcpListener,
    backend: B,
    keyspace: Keyspace,
    shutdown: impl Future,
) -> anyhow::Result<()>
where
    B: RecordBackend + Clone + Send + Sync + 'static,
{
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    let mut acceptor = Acceptor {
        listener,
        backend,
        keyspace,
        limit_connections: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        notify_shutdown,
        shutdown_complete_tx,
    };

    let mut outcome = Ok(());
    tokio::select! {
        res = acceptor.run() => {
            if let Err(err) = res {
                error!(cause = %err, "accept failed");
                outcome = Err(err);
            }
        }
        () = async { shutdown.await; } => {
            info!("shutting down");
        }
    }

    // Dropping the broadcast sender wakes every handler's shutdown
    // listener; dropping our mpsc sender leaves the handlers' clones as
    // the only ones keeping the channel open.
    let Acceptor {
        notify_shutdown,
        shutdown_complete_tx,
        ..
    } = acceptor;
    drop(notify_shutdown);
    drop(shutdown_complete_tx);

    // Resolves once the last handler drops its sender clone.
    let _ = shutdown_complete_rx.recv().await;
    info!("all connections drained");
    outcome
}

struct Acceptor<B: Clone> {
    listener: TcpListener,
    backend: B,
    keyspace: Keyspace,
    limit_connections: Arc<Semaphore>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl<B: RecordBackend + Clone + Send + Sync + 'static> Acceptor<B> {
    async fn run(&mut self) -> anyhow::Result<()> {
        info!(backend = self.backend.name(), "accepting inbound connections");
        loop {
            let permit = self.limit_connections.clone().acquire_owned().await?;
            let (socket, peer) = self.accept().await?;

            let mut handler = Handler {
                round_tripper: RoundTripper::new(self.backend.clone(), self.keyspace.clone()),
                connection: Connection::new(socket),
                peer,
                shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
                _shutdown_complete: self.shutdown_complete_tx.clone(),
            };

            tokio::spawn(async move {
                info!(peer = %peer, "connected");
                if let Err(err) = handler.run().await {
                    error!(peer = %peer, cause = %err, "connection error");
                }
                info!(peer = %peer, "disconnected");
                drop(permit);
            });
        }
    }

    /// Accept with exponential backoff on transient failures
    async fn accept(&mut self) -> anyhow::Result<(TcpStream, SocketAddr)> {
        let mut backoff = 1;
        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => {
                    if backoff > 64 {
                        return Err(err.into());
                    }
                }
            }
            time::sleep(Duration::from_secs(backoff)).await;
            backoff *= 2;
        }
    }
}

/// Per-connection state
struct Handler<B: RecordBackend + Clone> {
    round_tripper: RoundTripper<B>,
    connection: Connection<TcpStream>,
    peer: SocketAddr,
    shutdown: Shutdown,
    _shutdown_complete: mpsc::Sender<()>,
}

impl<B: RecordBackend + Clone> Handler<B> {
    /// Serve one connection until EOF, `quit`, fatal I/O error, or shutdown
    async fn run(&mut self) -> std::io::Result<()> {
        while !self.shutdown.is_shutdown() {
            let inbound = tokio::select! {
                res = self.connection.read_request() => res?,
                () = self.shutdown.recv() => {
                    self.refuse_during_grace().await;
                    return Ok(());
                }
            };

            let Some(inbound) = inbound else {
                // Peer closed the socket at a request boundary.
                return Ok(());
            };

            match inbound {
                Inbound::Malformed(err) => {
                    debug!(peer = %self.peer, cause = %err, "malformed request");
                    self.connection
                        .write_response(&Response::client_error(err.to_string()))
                        .await?;
                }
                Inbound::Request(request) => {
                    debug!(peer = %self.peer, command = ?request.command, "dispatching");
                    let reply = self.round_tripper.round_trip(request).await;
                    if let Some(response) = reply.response {
                        self.connection.write_response(&response).await?;
                    }
                    if reply.close {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// After the shutdown signal, give the peer one grace window: a request
    /// that was already on the wire is answered with a server error so the
    /// client knows why the connection is going away.
    async fn refuse_during_grace(&mut self) {
        if let Ok(Ok(Some(_))) =
            time::timeout(SHUTDOWN_GRACE, self.connection.read_request()).await
        {
            let _ = self
                .connection
                .write_response(&Response::server_error("shutting down"))
                .await;
        }
    }
}

/// Listens for the broadcast shutdown signal, remembering receipt
struct Shutdown {
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    fn new(notify: broadcast::Receiver<()>) -> Self {
        Self {
            is_shutdown: false,
            notify,
        }
    }

    fn is_shutdown(&self) -> bool {
        self.is_shutdown
    }

    async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // Both a sent value and a dropped sender mean shutdown.
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
