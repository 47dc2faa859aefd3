//! Connection worker lifecycle.

use crate::protocol::GREETING;
use crate::session::Session;
use std::io::{self, Write};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Serve one client from greeting to teardown.
///
/// The connection is shut down on every exit path before it is dropped.
pub async fn serve<S>(mut stream: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(GREETING).await?;

    let mut session = Session::new(stream);
    let result = session.run().await;
    let commands = session.commands();

    let mut stream = session.into_inner();
    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "Shutdown failed");
    }

    debug!(commands, "Session ended");
    result
}

/// Fallback when no worker could be spawned: greet, then hang up.
///
/// Runs on the listener, so the greeting is a single non-blocking write;
/// if the socket cannot take it right away it is skipped.
pub fn greet_and_drop(stream: TcpStream, peer: SocketAddr) {
    let result = stream
        .into_std()
        .and_then(|mut stream| stream.write_all(GREETING));

    if let Err(e) = result {
        warn!(peer = %peer, error = %e, "Could not greet rejected client");
    }
}
