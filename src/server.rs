//! TCP listener for getput connections.
//!
//! Accepts connections one at a time and spawns a worker task per client.
//! Worker handles go straight to the reaper; the listener never waits on a
//! worker.

use crate::config::Config;
use crate::reaper::{Reaper, ReaperStats, ReaperTask, WorkerRecord};
use crate::worker;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Server instance
pub struct Server {
    listener: TcpListener,
    reaper: Reaper,
    reaper_task: ReaperTask,
    worker_limit: Option<Arc<Semaphore>>,
    shutdown_grace: Duration,
    next_worker_id: u64,
}

impl Server {
    /// Bind the listening socket and start the reaper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: &Config) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let listen = config.listen_addr();
        let addr = listen.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no address for {listen}"),
            )
        })?;

        let listener = create_listener(addr, config.backlog).map_err(|e| {
            io::Error::new(e.kind(), format!("failed to listen on {addr}: {e}"))
        })?;
        let listener = TcpListener::from_std(listener)?;

        let (reaper, reaper_task) = Reaper::start();

        Ok(Server {
            listener,
            reaper,
            reaper_task,
            worker_limit: config
                .max_workers
                .map(|max| Arc::new(Semaphore::new(max))),
            shutdown_grace: config.shutdown_grace,
            next_worker_id: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// After shutdown no new clients are accepted. Workers still running
    /// get the configured grace period to finish, then they are cancelled.
    pub async fn run<F>(mut self, shutdown: F) -> io::Result<ReaperStats>
    where
        F: Future<Output = ()>,
    {
        info!(address = %self.local_addr()?, "Server listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_worker(stream, peer),
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
            }
        }

        let Server {
            listener,
            reaper,
            reaper_task,
            shutdown_grace,
            ..
        } = self;
        drop(listener);
        drop(reaper);

        let stats = reaper_task
            .drain(shutdown_grace)
            .await
            .map_err(io::Error::other)?;
        info!(
            reaped = stats.reaped,
            failed = stats.failed,
            panicked = stats.panicked,
            "Server stopped"
        );
        Ok(stats)
    }

    fn spawn_worker(&mut self, stream: TcpStream, peer: SocketAddr) {
        let permit = match &self.worker_limit {
            Some(limit) => match Arc::clone(limit).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(peer = %peer, "No worker capacity, greeting and dropping client");
                    worker::greet_and_drop(stream, peer);
                    return;
                }
            },
            None => None,
        };

        self.next_worker_id += 1;
        let id = self.next_worker_id;
        debug!(worker = id, peer = %peer, "New connection");

        let span = info_span!("worker", id, peer = %peer);
        let handle = tokio::spawn(
            async move {
                let _permit = permit;
                worker::serve(stream).await
            }
            .instrument(span),
        );

        self.reaper.track(WorkerRecord::new(id, peer, handle));
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind at once.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
