// SPDX-FileCopyrightText:  Copyright © 2022 The Fern Authors <team@fernproxy.io>
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit, Semaphore};

use fern_pgwire::{Connection, Engine};
use fern_pgwire_interfaces::{ConnectionProperties, ServerContext};

use crate::shutdown::Shutdown;

/// Concurrent connections served when `server.max_connections` is unset.
///
/// Past the limit, further clients wait in the OS backlog.
pub(crate) const DEFAULT_MAX_CONNECTIONS: usize = 128;

/// Delays between attempts when `accept` keeps failing, in seconds.
const ACCEPT_RETRY_DELAYS: [u64; 7] = [1, 2, 4, 8, 16, 32, 64];

/// Accept loop state, owned by [`run`].
#[derive(Debug)]
struct Acceptor {
    listener: TcpListener,
    engine: Arc<Engine>,
    /// Dropped to ask every connection task to stop.
    stop_tx: broadcast::Sender<()>,
    permits: Arc<Semaphore>,
    /// Cloned into each connection task, so that `done_rx` closes once all are gone.
    done_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<()>,
}

/// State moved into the task serving one client.
#[derive(Debug)]
struct ConnectionTask {
    socket: TcpStream,
    client_addr: SocketAddr,
    engine: Arc<Engine>,
    shutdown: Shutdown,
    _permit: OwnedSemaphorePermit,
    _done: mpsc::Sender<()>,
}

impl ConnectionTask {
    /// Serves the client until it leaves, or until shutdown drops the
    /// connection along with its session.
    async fn serve(self) {
        let ConnectionTask {
            socket,
            client_addr,
            engine,
            mut shutdown,
            ..
        } = self;

        let connection = Connection::new(socket, ConnectionProperties::new(Some(client_addr)), engine);
        tokio::select! {
            result = connection.run() => {
                if let Err(err) = result {
                    log::error!("connection from {} failed: {}", client_addr, err);
                }
            }
            _ = shutdown.recv() => {
                log::debug!("dropping connection from {} on shutdown", client_addr);
            }
        }
        log::info!("connection from {} closed", client_addr);
    }
}

impl Acceptor {
    /// Accepts clients for as long as permits are available, spawning
    /// one task per connection.
    ///
    /// # Errors
    ///
    /// Fails once `accept` has kept failing through every retry delay.
    async fn run(&mut self) -> std::io::Result<()> {
        log::info!("accepting connections on {}", self.listener.local_addr()?);
        loop {
            // Only fails once closed, which the acceptor never does.
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                return Ok(());
            };
            log::trace!("{} connection slots left", self.permits.available_permits());

            let (socket, client_addr) = self.accept().await?;
            log::info!("connection from {}", client_addr);

            let task = ConnectionTask {
                socket,
                client_addr,
                engine: Arc::clone(&self.engine),
                shutdown: Shutdown::new(self.stop_tx.subscribe()),
                _permit: permit,
                _done: self.done_tx.clone(),
            };
            tokio::spawn(task.serve());
        }
    }

    /// Accepts the next client, retrying with growing delays on failure.
    ///
    /// Errors such as running out of file descriptors usually clear up on
    /// their own, so giving up only happens after the last delay.
    async fn accept(&mut self) -> std::io::Result<(TcpStream, SocketAddr)> {
        let mut delays = ACCEPT_RETRY_DELAYS.iter();
        loop {
            let err = match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(err) => err,
            };
            let Some(&delay) = delays.next() else {
                return Err(err);
            };
            log::warn!("accept failed, retrying in {}s: {}", delay, err);
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
    }
}

/// Reads `server.max_connections`, ignoring values below 1.
fn max_connections(context: &ServerContext) -> usize {
    match context.config.get::<i64>("server.max_connections") {
        Ok(limit) if limit > 0 => usize::try_from(limit).unwrap_or(DEFAULT_MAX_CONNECTIONS),
        Ok(limit) => {
            log::warn!("ignoring server.max_connections = {}", limit);
            DEFAULT_MAX_CONNECTIONS
        }
        Err(_) => DEFAULT_MAX_CONNECTIONS,
    }
}

/// Serves clients of `listener` with `engine` until `shutdown` completes.
///
/// On shutdown, open connections are dropped and this function returns
/// once every connection task has finished.
pub async fn run(
    listener: TcpListener,
    engine: Arc<Engine>,
    shutdown: impl Future,
    context: &ServerContext,
) {
    let limit = max_connections(context);
    log::debug!("serving up to {} concurrent connections", limit);

    let (stop_tx, _) = broadcast::channel(1);
    let (done_tx, done_rx) = mpsc::channel(1);
    let mut acceptor = Acceptor {
        listener,
        engine,
        stop_tx,
        permits: Arc::new(Semaphore::new(limit)),
        done_tx,
        done_rx,
    };

    tokio::select! {
        result = acceptor.run() => {
            if let Err(err) = result {
                log::error!("giving up accepting connections: {}", err);
            }
        }
        _ = shutdown => log::info!("shutting down"),
    }

    let Acceptor {
        stop_tx,
        done_tx,
        mut done_rx,
        ..
    } = acceptor;
    drop(stop_tx);
    drop(done_tx);

    // Yields `None` once every connection task dropped its sender.
    let _ = done_rx.recv().await;
}
