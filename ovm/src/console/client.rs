//! Interactive console client: binds the controlling terminal to a VM's
//! console socket until the detach key (Ctrl-]) is pressed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, stdout};
use tokio::sync::Notify;
use tracing::debug;

use crate::socket::{LocalStream, ReadHalf, WriteHalf};
use crate::term::{self, TerminalError};

/// Detach key: Ctrl-] (0x1D). Never forwarded to the VM.
pub const DETACH_BYTE: u8 = 0x1d;

/// Errors raised when attaching to a console.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConsoleConnectionError {
    /// stdin is not a terminal.
    #[error("console attach requires a terminal")]
    NotATerminal,

    /// Connecting to the console socket failed.
    #[error("failed to connect to console: {0}")]
    ConnectionFailed(#[from] crate::socket::SocketError),

    /// Switching the terminal in or out of raw mode failed.
    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

/// Console attach session bound to one VM's console socket.
#[derive(Debug)]
pub struct ConsoleClient {
    /// Path of the console socket to attach to.
    socket_path: PathBuf,
}

impl ConsoleClient {
    /// Creates a client for the given console socket path.
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Runs the interactive session until detach.
    ///
    /// Requires a terminal on stdin. The terminal is switched to raw mode
    /// for the session and restored on every exit path; the socket is
    /// closed *before* restoration so the multiplexer sees the disconnect
    /// promptly, and `on_message` fires only after the terminal is back in
    /// cooked mode.
    pub async fn run(
        &self,
        mut on_message: impl FnMut(&str),
    ) -> Result<(), ConsoleConnectionError> {
        if !term::is_terminal() {
            return Err(ConsoleConnectionError::NotATerminal);
        }

        let stream = LocalStream::connect(&self.socket_path).await?;
        let raw = term::enable_raw_mode()?;

        let detached = Arc::new(Notify::new());
        let (socket_read, socket_write) = stream.into_split();

        // stdin → socket, watching for the detach key.
        let stdin_task = tokio::spawn(forward_input(
            tokio::io::stdin(),
            socket_write,
            Arc::clone(&detached),
        ));

        // socket → stdout.
        let output_task = tokio::spawn(forward_output(socket_read, Arc::clone(&detached)));

        detached.notified().await;
        debug!(socket = %self.socket_path.display(), "detaching from console");

        // Close the socket first: aborting both tasks drops both halves.
        stdin_task.abort();
        output_task.abort();
        let _ = stdin_task.await;
        let _ = output_task.await;

        raw.restore()?;

        on_message("Detached from VM console");
        on_message("VM continues running in the background");
        Ok(())
    }
}

/// Forwards input chunks to the socket until EOF or the detach key.
///
/// A chunk containing the detach byte signals detach and is dropped
/// whole, bytes before the key included.
async fn forward_input<R>(mut input: R, mut socket: WriteHalf, detached: Arc<Notify>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 1024];
    loop {
        match input.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let chunk = &buf[..n];
                if chunk.contains(&DETACH_BYTE) {
                    break;
                }
                if socket.send(chunk).await.is_err() {
                    break;
                }
            }
        }
    }
    detached.notify_one();
}

/// Writes socket output to stdout until the stream ends.
async fn forward_output(mut socket: ReadHalf, detached: Arc<Notify>) {
    let mut out = stdout();
    loop {
        match socket.receive(4096).await {
            Ok(chunk) if chunk.is_empty() => break,
            Ok(chunk) => {
                if out.write_all(&chunk).await.is_err() {
                    break;
                }
                let _ = out.flush().await;
            }
            Err(_) => break,
        }
    }
    detached.notify_one();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::socket::LocalListener;

    #[tokio::test]
    async fn detach_chunk_is_swallowed_and_signals_detach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.sock");
        let listener = LocalListener::bind(&path).unwrap();

        let client = LocalStream::connect(&path).await.unwrap();
        let mut server = listener.accept().await.unwrap();
        let (_client_read, client_write) = client.into_split();

        let (mut input_tx, input_rx) = tokio::io::duplex(256);
        let detached = Arc::new(Notify::new());
        let notified = Arc::clone(&detached);
        let task = tokio::spawn(forward_input(input_rx, client_write, detached));

        // A clean chunk is forwarded verbatim.
        input_tx.write_all(b"ls\r").await.unwrap();
        assert_eq!(server.receive(16).await.unwrap(), b"ls\r");

        // A chunk with Ctrl-] triggers detach; none of it reaches the VM.
        input_tx.write_all(b"ab\x1dcd").await.unwrap();
        notified.notified().await;
        task.await.unwrap();

        // The write half was dropped with the task: the peer sees EOF, not
        // the swallowed bytes.
        assert!(server.receive(16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn input_eof_signals_detach() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("console.sock");
        let listener = LocalListener::bind(&path).unwrap();

        let client = LocalStream::connect(&path).await.unwrap();
        let _server = listener.accept().await.unwrap();
        let (_client_read, client_write) = client.into_split();

        let (input_tx, input_rx) = tokio::io::duplex(16);
        let detached = Arc::new(Notify::new());
        let notified = Arc::clone(&detached);
        let task = tokio::spawn(forward_input(input_rx, client_write, detached));

        drop(input_tx);
        notified.notified().await;
        task.await.unwrap();
    }
}
