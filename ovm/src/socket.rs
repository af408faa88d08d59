//! Local stream socket primitive.
//!
//! Thin wrapper over Unix domain stream sockets with the semantics the
//! console subsystem needs: binding unlinks any stale filesystem entry and
//! remembers the path for cleanup, sends either complete or fail, and an
//! empty receive means the peer closed. All progress is awaited through
//! kernel readiness notifications.

#![allow(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};

/// Errors raised by the local socket primitive.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SocketError {
    /// The socket has already been closed.
    #[error("socket is closed")]
    InvalidDescriptor,

    /// The path does not fit in `sockaddr_un.sun_path`.
    #[error("socket path exceeds the platform address limit")]
    AddressTooLong,

    /// The peer closed the connection mid-operation.
    #[error("peer disconnected")]
    Disconnected,

    /// An operation did not complete within its deadline.
    #[error("socket operation timed out")]
    Timeout,

    /// An underlying system call failed.
    #[error("socket error ({errno}): {message}")]
    SystemError {
        /// Raw OS errno, 0 when unavailable.
        errno: i32,
        /// Human-readable description from the OS.
        message: String,
    },
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        Self::SystemError {
            errno: e.raw_os_error().unwrap_or(0),
            message: e.to_string(),
        }
    }
}

/// Result alias for socket operations.
pub type Result<T> = std::result::Result<T, SocketError>;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 5;

/// Maximum length a socket path may have on this platform.
pub fn sun_path_limit() -> usize {
    // SAFETY: sockaddr_un is a plain C struct; an all-zero value is valid.
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_path.len()
}

/// socket(2) + bind(2) + listen(2) with an explicit backlog.
///
/// The std wrappers hardcode their backlog, so the three calls are made
/// directly. The caller has already checked the path against
/// [`sun_path_limit`].
fn bind_and_listen(path: &Path, backlog: i32) -> Result<std::os::unix::net::UnixListener> {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::os::unix::ffi::OsStrExt;

    // SAFETY: plain socket(2); the result is checked before use.
    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if raw < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: raw is a freshly created descriptor we own.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: an all-zero sockaddr_un is valid.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    #[allow(clippy::cast_possible_truncation)]
    let len = (std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;

    // SAFETY: addr is a valid sockaddr_un and len covers the used bytes.
    if unsafe { libc::bind(fd.as_raw_fd(), std::ptr::from_ref(&addr).cast(), len) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: fd is a bound socket.
    if unsafe { libc::listen(fd.as_raw_fd(), backlog) } != 0 {
        return Err(io::Error::last_os_error().into());
    }

    let listener = std::os::unix::net::UnixListener::from(fd);
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// A listening Unix stream socket bound to a filesystem path.
///
/// The bound path is unlinked when the listener is closed or dropped.
#[derive(Debug)]
pub struct LocalListener {
    /// Live listener; `None` once closed.
    inner: Option<UnixListener>,
    /// Path to unlink on close.
    path: PathBuf,
}

impl LocalListener {
    /// Binds to `path` and listens with the default backlog, removing any
    /// existing filesystem entry there first.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_backlog(path, DEFAULT_BACKLOG)
    }

    /// Binds to `path` and listens with an explicit backlog.
    ///
    /// Fails with [`SocketError::AddressTooLong`] before touching the
    /// filesystem when the path cannot fit in a socket address.
    pub fn bind_with_backlog(path: impl AsRef<Path>, backlog: i32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.as_os_str().len() >= sun_path_limit() {
            return Err(SocketError::AddressTooLong);
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let inner = UnixListener::from_std(bind_and_listen(&path, backlog)?)?;
        Ok(Self {
            inner: Some(inner),
            path,
        })
    }

    /// Path this listener is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for and returns the next inbound connection.
    pub async fn accept(&self) -> Result<LocalStream> {
        let inner = self.inner.as_ref().ok_or(SocketError::InvalidDescriptor)?;
        let (stream, _addr) = inner.accept().await?;
        Ok(LocalStream { inner: stream })
    }

    /// Closes the listener and unlinks the bound path. Idempotent.
    pub fn close(&mut self) {
        if self.inner.take().is_some() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.close();
    }
}

/// A connected Unix stream socket.
#[derive(Debug)]
pub struct LocalStream {
    /// Underlying non-blocking stream.
    inner: UnixStream,
}

impl LocalStream {
    /// Connects to the socket at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().len() >= sun_path_limit() {
            return Err(SocketError::AddressTooLong);
        }
        let inner = UnixStream::connect(path).await?;
        Ok(Self { inner })
    }

    /// Writes the complete buffer, failing with
    /// [`SocketError::Disconnected`] if the peer goes away mid-write.
    pub async fn send(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.inner.write(buf).await {
                Ok(0) => return Err(SocketError::Disconnected),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(SocketError::Disconnected);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Reads up to `max` bytes. An empty result means the peer closed.
    pub async fn receive(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = self.inner.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Consumes the stream into a lazy sequence of non-empty chunks,
    /// terminating on graceful close or error.
    pub fn into_chunks(self, max: usize) -> ChunkStream {
        ChunkStream {
            inner: self.inner,
            max,
        }
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        let (r, w) = self.inner.into_split();
        (ReadHalf { inner: r }, WriteHalf { inner: w })
    }
}

impl From<UnixStream> for LocalStream {
    fn from(inner: UnixStream) -> Self {
        Self { inner }
    }
}

/// Lazy, finite, non-restartable chunk sequence over a stream.
#[derive(Debug)]
pub struct ChunkStream {
    /// Stream being drained.
    inner: UnixStream,
    /// Per-chunk read ceiling.
    max: usize,
}

impl ChunkStream {
    /// Next non-empty chunk, or `None` on close or error.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; self.max];
        match self.inner.read(&mut buf).await {
            Ok(0) | Err(_) => None,
            Ok(n) => {
                buf.truncate(n);
                Some(buf)
            }
        }
    }
}

/// Owned read half of a [`LocalStream`].
#[derive(Debug)]
pub struct ReadHalf {
    /// Underlying half.
    inner: OwnedReadHalf,
}

impl ReadHalf {
    /// Reads up to `max` bytes. An empty result means the peer closed.
    pub async fn receive(&mut self, max: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = self.inner.read(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}

/// Owned write half of a [`LocalStream`].
#[derive(Debug)]
pub struct WriteHalf {
    /// Underlying half.
    inner: OwnedWriteHalf,
}

impl WriteHalf {
    /// Writes the complete buffer; see [`LocalStream::send`].
    pub async fn send(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.inner.write(buf).await {
                Ok(0) => return Err(SocketError::Disconnected),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    return Err(SocketError::Disconnected);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_rejects_overlong_path() {
        let long = format!("/tmp/{}", "x".repeat(sun_path_limit() + 8));
        match LocalListener::bind(&long) {
            Err(SocketError::AddressTooLong) => {}
            other => panic!("expected AddressTooLong, got {other:?}"),
        }
        assert!(!Path::new(&long).exists());
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.sock");
        std::fs::write(&path, b"stale").unwrap();
        let listener = LocalListener::bind(&path).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists(), "close must unlink the bound path");
    }

    #[tokio::test]
    async fn custom_backlog_still_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.sock");
        let listener = LocalListener::bind_with_backlog(&path, 1).unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let mut s = LocalStream::connect(&path).await.unwrap();
                s.send(b"hi").await.unwrap();
            }
        });

        let mut server = listener.accept().await.unwrap();
        assert_eq!(server.receive(8).await.unwrap(), b"hi");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn send_receive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let listener = LocalListener::bind(&path).unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let mut s = LocalStream::connect(&path).await.unwrap();
                s.send(b"hello").await.unwrap();
                s.receive(16).await.unwrap()
            }
        });

        let mut server = listener.accept().await.unwrap();
        let got = server.receive(16).await.unwrap();
        assert_eq!(got, b"hello");
        server.send(b"world").await.unwrap();
        assert_eq!(client.await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn empty_receive_means_closed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let listener = LocalListener::bind(&path).unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let s = LocalStream::connect(&path).await.unwrap();
                drop(s);
            }
        });

        let mut server = listener.accept().await.unwrap();
        client.await.unwrap();
        assert!(server.receive(16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunk_stream_terminates_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let listener = LocalListener::bind(&path).unwrap();

        let client = tokio::spawn({
            let path = path.clone();
            async move {
                let mut s = LocalStream::connect(&path).await.unwrap();
                s.send(b"abc").await.unwrap();
                s.send(b"def").await.unwrap();
            }
        });

        let server = listener.accept().await.unwrap();
        let mut chunks = server.into_chunks(4096);
        let mut all = Vec::new();
        while let Some(chunk) = chunks.next().await {
            assert!(!chunk.is_empty());
            all.extend(chunk);
        }
        client.await.unwrap();
        assert_eq!(all, b"abcdef");
    }

    #[tokio::test]
    async fn connect_to_absent_peer_is_system_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nobody.sock");
        match LocalStream::connect(&path).await {
            Err(SocketError::SystemError { errno, .. }) => assert_ne!(errno, 0),
            other => panic!("expected SystemError, got {other:?}"),
        }
    }
}
