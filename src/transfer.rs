//! GET and PUT handlers.
//!
//! Both work directly against the local filesystem with whatever path the
//! client named; no sandboxing is applied. Files are closed on every exit
//! path by going out of scope.

use crate::protocol::{Status, TerminatorScanner, TERMINATOR};
use bytes::BytesMut;
use std::io;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

/// Size of each read from a file or from the connection.
pub const CHUNK_SIZE: usize = 1024;

/// Send `path` to the client.
///
/// On success the client sees `SERVER 200 OK`, a blank line, the raw file
/// bytes, and the two-newline terminator. A file that cannot be opened is
/// answered with `SERVER 404 Not Found` alone.
pub async fn get<S>(stream: &mut S, path: &Path) -> io::Result<Status>
where
    S: AsyncWrite + Unpin,
{
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "GET open failed");
            stream.write_all(Status::NotFound.line()).await?;
            return Ok(Status::NotFound);
        }
    };

    stream.write_all(Status::Ok.line()).await?;
    stream.write_all(b"\n").await?;

    let mut buffer = BytesMut::with_capacity(CHUNK_SIZE);
    let mut sent: u64 = 0;

    loop {
        buffer.clear();
        match file.read_buf(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                stream.write_all(&buffer[..n]).await?;
                sent += n as u64;
            }
            Err(e) => {
                // The status line is already out; end the body where it stands.
                warn!(path = %path.display(), error = %e, "GET read failed mid-transfer");
                break;
            }
        }
    }

    stream.write_all(TERMINATOR).await?;
    stream.flush().await?;

    debug!(path = %path.display(), bytes = sent, "GET complete");
    Ok(Status::Ok)
}

/// Receive an upload into `path`.
///
/// `pending` holds bytes the session already read past the command line;
/// they are the start of the body. Reception stops right after the first
/// `\n\n` (which is written to the file too) or when the peer goes away.
/// Anything read past the terminator is left in `pending`.
///
/// If the file cannot be opened the client gets `SERVER 501 Put Error` and
/// nothing is consumed, so the body that follows will be parsed as commands.
pub async fn put<S>(stream: &mut S, pending: &mut BytesMut, path: &Path) -> io::Result<Status>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .await;

    let file = match file {
        Ok(file) => file,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "PUT open failed");
            stream.write_all(Status::PutError.line()).await?;
            return Ok(Status::PutError);
        }
    };

    let mut sink = UploadSink::new(file);
    let mut scanner = TerminatorScanner::new();

    loop {
        if !pending.is_empty() {
            let body_len = scanner.scan(&pending[..]).unwrap_or(pending.len());
            let body = pending.split_to(body_len);
            sink.write(&body).await;

            if scanner.is_complete() {
                break;
            }
        }

        pending.reserve(CHUNK_SIZE);
        match stream.read_buf(pending).await {
            Ok(0) => {
                debug!(path = %path.display(), "Peer closed before upload terminator");
                break;
            }
            Ok(n) => trace!(bytes = n, "Upload chunk"),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Upload read failed");
                break;
            }
        }
    }

    let (written, failed) = sink.finish().await;

    let status = if failed {
        Status::PutError
    } else {
        Status::Created
    };
    stream.write_all(status.line()).await?;

    debug!(
        path = %path.display(),
        bytes = written,
        complete = scanner.is_complete(),
        status = status.code(),
        "PUT finished"
    );
    Ok(status)
}

/// Upload destination that remembers the first write failure.
///
/// After a failure the body is still drained from the connection so the
/// session stays in step, but nothing more is written.
struct UploadSink {
    file: File,
    written: u64,
    failed: bool,
}

impl UploadSink {
    fn new(file: File) -> Self {
        Self {
            file,
            written: 0,
            failed: false,
        }
    }

    async fn write(&mut self, data: &[u8]) {
        if self.failed || data.is_empty() {
            return;
        }
        match self.file.write_all(data).await {
            Ok(()) => self.written += data.len() as u64,
            Err(e) => {
                warn!(error = %e, "Upload write failed, discarding rest of body");
                self.failed = true;
            }
        }
    }

    /// Flush and close the file; returns bytes written and whether any write failed.
    async fn finish(mut self) -> (u64, bool) {
        let mut failed = self.failed;
        if let Err(e) = self.file.flush().await {
            warn!(error = %e, "Upload flush failed");
            failed = true;
        }
        (self.written, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_get_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello\nworld").unwrap();

        let mut stream = Builder::new()
            .write(b"SERVER 200 OK\n\n")
            .write(b"hello\nworld")
            .write(b"\n\n")
            .build();

        let status = get(&mut stream, &path).await.unwrap();
        assert_eq!(status, Status::Ok);
    }

    #[tokio::test]
    async fn test_get_binary_file_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let content: Vec<u8> = (0..=255u8).cycle().take(3 * CHUNK_SIZE + 7).collect();
        std::fs::write(&path, &content).unwrap();

        let mut expected = b"SERVER 200 OK\n\n".to_vec();
        expected.extend_from_slice(&content);
        expected.extend_from_slice(b"\n\n");

        let mut stream = Builder::new().write(&expected).build();
        assert_eq!(get(&mut stream, &path).await.unwrap(), Status::Ok);
    }

    #[tokio::test]
    async fn test_get_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.txt");

        let mut stream = Builder::new().write(b"SERVER 404 Not Found\n").build();

        let status = get(&mut stream, &path).await.unwrap();
        assert_eq!(status, Status::NotFound);
    }

    #[tokio::test]
    async fn test_put_body_from_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.txt");

        let mut stream = Builder::new()
            .read(b"first line\n")
            .read(b"second line\n\n")
            .write(b"SERVER 201 Created\n")
            .build();
        let mut pending = BytesMut::new();

        let status = put(&mut stream, &mut pending, &path).await.unwrap();
        assert_eq!(status, Status::Created);
        assert!(pending.is_empty());
        assert_eq!(
            std::fs::read(&path).unwrap(),
            b"first line\nsecond line\n\n"
        );
    }

    #[tokio::test]
    async fn test_put_body_already_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.txt");

        let mut stream = Builder::new().write(b"SERVER 201 Created\n").build();
        let mut pending = BytesMut::from(&b"abc\n\nGET next\n"[..]);

        let status = put(&mut stream, &mut pending, &path).await.unwrap();
        assert_eq!(status, Status::Created);
        assert_eq!(&pending[..], b"GET next\n");
        assert_eq!(std::fs::read(&path).unwrap(), b"abc\n\n");
    }

    #[tokio::test]
    async fn test_put_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.txt");
        std::fs::write(&path, b"a much longer previous version of the file").unwrap();

        let mut stream = Builder::new()
            .read(b"new\n\n")
            .write(b"SERVER 201 Created\n")
            .build();
        let mut pending = BytesMut::new();

        put(&mut stream, &mut pending, &path).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new\n\n");
    }

    #[tokio::test]
    async fn test_put_disconnect_keeps_partial_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.txt");

        let mut stream = Builder::new()
            .read(b"no terminator here\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .write(b"SERVER 201 Created\n")
            .build();
        let mut pending = BytesMut::new();

        let status = put(&mut stream, &mut pending, &path).await.unwrap();
        assert_eq!(status, Status::Created);
        assert_eq!(std::fs::read(&path).unwrap(), b"no terminator here\n");
    }

    #[tokio::test]
    async fn test_put_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("file.txt");

        let mut stream = Builder::new().write(b"SERVER 501 Put Error\n").build();
        let mut pending = BytesMut::from(&b"body\n\n"[..]);

        let status = put(&mut stream, &mut pending, &path).await.unwrap();
        assert_eq!(status, Status::PutError);
        // Nothing consumed: the body will be read as commands.
        assert_eq!(&pending[..], b"body\n\n");
    }
}
