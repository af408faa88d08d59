//! Console multiplexer: one VM serial stream fanned out to N clients.
//!
//! VM output is appended to the replay buffer (stripped) and then broadcast
//! raw to every attached client; client input is forwarded to the VM serial
//! input in arrival order. Clients joining late receive the replay buffer
//! as their first bytes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::replay::ReplayBuffer;
use crate::socket::{LocalListener, ReadHalf, WriteHalf};

/// Read size for VM output and client input chunks.
const CHUNK_SIZE: usize = 4096;

/// Errors raised when starting the multiplexer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConsoleListenerError {
    /// `start` was called while the multiplexer was already running.
    #[error("console listener is already running")]
    AlreadyRunning,

    /// Binding the console socket failed.
    #[error("failed to bind console socket: {0}")]
    Bind(#[from] crate::socket::SocketError),
}

/// State shared between the accept loop, the VM output reader, and the
/// per-client readers.
struct Shared<W> {
    /// Recent stripped output for late joiners.
    replay: std::sync::Mutex<ReplayBuffer>,
    /// Write halves of all attached clients, by id.
    clients: tokio::sync::Mutex<HashMap<u64, WriteHalf>>,
    /// Per-client reader tasks, by id.
    readers: std::sync::Mutex<HashMap<u64, JoinHandle<()>>>,
    /// VM serial input; client chunks are written here in arrival order.
    vm_in: tokio::sync::Mutex<W>,
    /// Next client id.
    next_id: AtomicU64,
}

/// Tasks and shared state of a live multiplexer.
struct Running<W> {
    /// Accept loop; owns the bound socket, so dropping it unlinks the path.
    accept_task: JoinHandle<()>,
    /// VM output reader.
    vm_out_task: JoinHandle<()>,
    /// Shared fan-out state.
    shared: Arc<Shared<W>>,
    /// Bound socket path.
    socket_path: PathBuf,
}

/// Fan-out console listener bound to a VM's console socket.
///
/// `W` is the VM serial input sink (a pipe in the daemon, an in-memory
/// stream in tests).
pub struct ConsoleListener<W> {
    /// Running state; `None` when stopped.
    running: Option<Running<W>>,
}

impl<W> std::fmt::Debug for ConsoleListener<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleListener")
            .field("running", &self.running.is_some())
            .finish()
    }
}

impl<W> Default for ConsoleListener<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> ConsoleListener<W> {
    /// Creates a stopped listener.
    pub fn new() -> Self {
        Self { running: None }
    }

    /// `true` while the multiplexer is serving.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }
}

impl<W> ConsoleListener<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    /// Binds `socket_path` and starts serving.
    ///
    /// `vm_in` is the VM serial input (client → VM), `vm_out` the serial
    /// output (VM → clients). The listener owns both for its lifetime.
    pub fn start<R>(
        &mut self,
        socket_path: impl AsRef<Path>,
        vm_in: W,
        vm_out: R,
    ) -> Result<(), ConsoleListenerError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        if self.running.is_some() {
            return Err(ConsoleListenerError::AlreadyRunning);
        }

        let socket_path = socket_path.as_ref().to_path_buf();
        let listener = LocalListener::bind(&socket_path)?;

        let shared = Arc::new(Shared {
            replay: std::sync::Mutex::new(ReplayBuffer::default()),
            clients: tokio::sync::Mutex::new(HashMap::new()),
            readers: std::sync::Mutex::new(HashMap::new()),
            vm_in: tokio::sync::Mutex::new(vm_in),
            next_id: AtomicU64::new(0),
        });

        let accept_task = tokio::spawn(accept_loop(listener, Arc::clone(&shared)));
        let vm_out_task = tokio::spawn(pump_vm_output(vm_out, Arc::clone(&shared)));

        debug!(socket = %socket_path.display(), "console listener started");
        self.running = Some(Running {
            accept_task,
            vm_out_task,
            shared,
            socket_path,
        });
        Ok(())
    }

    /// Stops serving: cancels the accept loop and every per-client reader,
    /// closes all client sockets, unlinks the socket path, and detaches the
    /// VM output reader. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.accept_task.abort();
        running.vm_out_task.abort();

        let readers: Vec<JoinHandle<()>> = running
            .shared
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in &readers {
            task.abort();
        }

        let _ = running.accept_task.await;
        let _ = running.vm_out_task.await;
        for task in readers {
            let _ = task.await;
        }

        // Every task is gone; dropping the write halves closes the clients.
        running.shared.clients.lock().await.clear();
        let _ = std::fs::remove_file(&running.socket_path);
        debug!(socket = %running.socket_path.display(), "console listener stopped");
    }
}

impl<W> Drop for ConsoleListener<W> {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.accept_task.abort();
            running.vm_out_task.abort();
            for (_, task) in running
                .shared
                .readers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain()
            {
                task.abort();
            }
            let _ = std::fs::remove_file(&running.socket_path);
        }
    }
}

/// Reads VM serial output and fans it out.
///
/// Every chunk is appended to the replay buffer (stripped) before the
/// corresponding broadcast attempt.
async fn pump_vm_output<R, W>(mut vm_out: R, shared: Arc<Shared<W>>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match vm_out.read(&mut buf).await {
            Ok(0) => {
                trace!("vm serial output closed");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "vm serial output read failed");
                return;
            }
        };
        let chunk = &buf[..n];

        shared
            .replay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .append(chunk);

        broadcast(&shared, chunk).await;
    }
}

/// Sends a chunk to every attached client, dropping only the clients whose
/// send failed.
async fn broadcast<W>(shared: &Shared<W>, chunk: &[u8]) {
    let mut clients = shared.clients.lock().await;
    let mut dead = Vec::new();
    for (&id, writer) in clients.iter_mut() {
        if writer.send(chunk).await.is_err() {
            dead.push(id);
        }
    }
    for id in dead {
        clients.remove(&id);
        if let Some(task) = shared
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
        {
            task.abort();
        }
        debug!(client = id, "console client dropped (send failed)");
    }
}

/// Accepts clients until cancelled. Accept errors back off briefly and the
/// loop keeps serving.
async fn accept_loop<W>(listener: LocalListener, shared: Arc<Shared<W>>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let stream = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "console accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let (read, mut write) = stream.into_split();

        // Seed the newcomer with recent output in a single write; a failure
        // here closes the client before it is ever registered.
        let snapshot = shared
            .replay
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contents()
            .to_vec();
        if !snapshot.is_empty() && write.send(&snapshot).await.is_err() {
            continue;
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        shared.clients.lock().await.insert(id, write);

        let task = tokio::spawn(pump_client_input(id, read, Arc::clone(&shared)));
        shared
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, task);
        debug!(client = id, "console client attached");
    }
}

/// Forwards one client's input to the VM serial input until EOF or error,
/// then deregisters the client.
async fn pump_client_input<W>(id: u64, mut read: ReadHalf, shared: Arc<Shared<W>>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let chunk = match read.receive(CHUNK_SIZE).await {
            Ok(c) if c.is_empty() => break,
            Ok(c) => c,
            Err(_) => break,
        };
        let mut vm_in = shared.vm_in.lock().await;
        if vm_in.write_all(&chunk).await.is_err() {
            break;
        }
        let _ = vm_in.flush().await;
    }

    shared.clients.lock().await.remove(&id);
    shared
        .readers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&id);
    debug!(client = id, "console client detached");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::socket::LocalStream;
    use tokio::io::DuplexStream;

    struct Fixture {
        listener: ConsoleListener<DuplexStream>,
        vm_in_rx: DuplexStream,
        vm_out_tx: DuplexStream,
        socket_path: PathBuf,
        _dir: tempfile::TempDir,
    }

    /// Builds a running multiplexer wired to in-memory serial pipes.
    fn start_fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("console.sock");

        let (vm_in_tx, vm_in_rx) = tokio::io::duplex(64 * 1024);
        let (vm_out_tx, vm_out_rx) = tokio::io::duplex(64 * 1024);

        let mut listener = ConsoleListener::new();
        listener.start(&socket_path, vm_in_tx, vm_out_rx).unwrap();

        Fixture {
            listener,
            vm_in_rx,
            vm_out_tx,
            socket_path,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn start_twice_is_already_running() {
        let mut fx = start_fixture();
        let (w, _keep_w) = tokio::io::duplex(16);
        let (_keep_r, r) = tokio::io::duplex(16);
        assert!(matches!(
            fx.listener.start(&fx.socket_path, w, r),
            Err(ConsoleListenerError::AlreadyRunning)
        ));
        fx.listener.stop().await;
    }

    #[tokio::test]
    async fn output_reaches_all_clients() {
        let mut fx = start_fixture();

        let mut a = LocalStream::connect(&fx.socket_path).await.unwrap();
        let mut b = LocalStream::connect(&fx.socket_path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.vm_out_tx.write_all(b"boot ok\r\n").await.unwrap();

        assert_eq!(a.receive(64).await.unwrap(), b"boot ok\r\n");
        assert_eq!(b.receive(64).await.unwrap(), b"boot ok\r\n");
        fx.listener.stop().await;
    }

    #[tokio::test]
    async fn late_joiner_gets_stripped_replay_first() {
        let mut fx = start_fixture();

        fx.vm_out_tx
            .write_all(b"\x1b[32mlogin:\x1b[0m ")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut late = LocalStream::connect(&fx.socket_path).await.unwrap();
        assert_eq!(late.receive(64).await.unwrap(), b"login: ");

        // Live output follows the replay.
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.vm_out_tx.write_all(b"root").await.unwrap();
        assert_eq!(late.receive(64).await.unwrap(), b"root");
        fx.listener.stop().await;
    }

    #[tokio::test]
    async fn client_input_is_forwarded_to_vm() {
        let mut fx = start_fixture();

        let mut client = LocalStream::connect(&fx.socket_path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.send(b"ls -l\r").await.unwrap();

        let mut buf = vec![0u8; 16];
        let n = fx.vm_in_rx.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ls -l\r");
        fx.listener.stop().await;
    }

    #[tokio::test]
    async fn disconnected_client_does_not_disturb_others() {
        let mut fx = start_fixture();

        let gone = LocalStream::connect(&fx.socket_path).await.unwrap();
        let mut stay = LocalStream::connect(&fx.socket_path).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(gone);

        fx.vm_out_tx.write_all(b"one").await.unwrap();
        assert_eq!(stay.receive(16).await.unwrap(), b"one");
        fx.vm_out_tx.write_all(b"two").await.unwrap();
        assert_eq!(stay.receive(16).await.unwrap(), b"two");
        fx.listener.stop().await;
    }

    #[tokio::test]
    async fn stop_unlinks_socket_and_is_idempotent() {
        let mut fx = start_fixture();
        assert!(fx.socket_path.exists());

        fx.listener.stop().await;
        assert!(!fx.socket_path.exists());
        assert!(!fx.listener.is_running());
        fx.listener.stop().await;
    }

    #[tokio::test]
    async fn replay_is_capped() {
        let mut fx = start_fixture();

        // 3 × 4096 plain bytes; replay keeps only the trailing 8 KiB.
        for fill in [b'a', b'b', b'c'] {
            fx.vm_out_tx.write_all(&vec![fill; 4096]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut late = LocalStream::connect(&fx.socket_path).await.unwrap();
        let mut got = Vec::new();
        while got.len() < 8192 {
            let chunk = late.receive(8192).await.unwrap();
            assert!(!chunk.is_empty());
            got.extend(chunk);
        }
        assert_eq!(got.len(), 8192);
        assert!(got[..4096].iter().all(|&b| b == b'b'));
        assert!(got[4096..].iter().all(|&b| b == b'c'));
        fx.listener.stop().await;
    }
}
