//! Protocol session: the per-connection command loop.
//!
//! The session reads the connection in fixed-size chunks into a buffer and
//! consumes it one line at a time. Upload bodies are taken from the same
//! buffer, so a client that pipelines a command and its body in one write
//! loses nothing.

use crate::protocol::{self, Command, Status};
use crate::transfer::{self, CHUNK_SIZE};
use bytes::{Bytes, BytesMut};
use std::io;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Longest command line buffered before it is handled as-is.
const MAX_LINE: usize = CHUNK_SIZE;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the next command line.
    AwaitingCommand,
    /// Peer closed, read failed, or BYE received.
    Terminated,
}

/// Command loop over one client connection.
pub struct Session<S> {
    stream: S,
    buffer: BytesMut,
    state: SessionState,
    commands: u64,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(CHUNK_SIZE),
            state: SessionState::AwaitingCommand,
            commands: 0,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of non-empty command lines handled so far.
    pub fn commands(&self) -> u64 {
        self.commands
    }

    /// Give back the connection, e.g. to shut it down.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Run until the session terminates.
    ///
    /// A failed read ends the session quietly; a failed write is returned
    /// since the connection is unusable at that point.
    pub async fn run(&mut self) -> io::Result<()> {
        while self.state == SessionState::AwaitingCommand {
            let line = match self.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    trace!("Connection closed by client");
                    self.state = SessionState::Terminated;
                    break;
                }
                Err(e) => {
                    debug!(error = %e, "Read failed, ending session");
                    self.state = SessionState::Terminated;
                    break;
                }
            };

            self.state = self.dispatch(&line).await?;
        }
        Ok(())
    }

    /// Take the next line out of the buffer, reading more when needed.
    ///
    /// A line ends at LF. An over-long line, or trailing bytes when the peer
    /// closes, are handed out unterminated. `None` means the peer closed with
    /// nothing left to handle.
    async fn next_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(end) = protocol::find_line_end(&self.buffer) {
                return Ok(Some(self.buffer.split_to(end).freeze()));
            }
            if self.buffer.len() >= MAX_LINE {
                return Ok(Some(self.buffer.split().freeze()));
            }

            self.buffer.reserve(CHUNK_SIZE);
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.buffer.split().freeze()));
            }
        }
    }

    /// Handle one line and return the state to move to.
    async fn dispatch(&mut self, line: &[u8]) -> io::Result<SessionState> {
        let command = match protocol::parse(line) {
            Some(command) => command,
            None => return Ok(SessionState::AwaitingCommand),
        };
        self.commands += 1;
        trace!(?command, "Processing command");

        match command {
            Command::Bye => {
                debug!("Client said BYE");
                return Ok(SessionState::Terminated);
            }
            Command::Get(None) => self.respond(Status::GetError).await?,
            Command::Get(Some(filename)) => {
                let status = transfer::get(&mut self.stream, Path::new(&filename)).await?;
                debug!(file = %filename, status = status.code(), "GET");
            }
            Command::Put(None) => self.respond(Status::PutError).await?,
            Command::Put(Some(filename)) => {
                let status =
                    transfer::put(&mut self.stream, &mut self.buffer, Path::new(&filename))
                        .await?;
                debug!(file = %filename, status = status.code(), "PUT");
            }
            Command::Unknown(verb) => {
                debug!(%verb, "Unknown command");
                self.respond(Status::CommandError).await?;
            }
        }

        Ok(SessionState::AwaitingCommand)
    }

    async fn respond(&mut self, status: Status) -> io::Result<()> {
        self.stream.write_all(status.line()).await
    }
}
