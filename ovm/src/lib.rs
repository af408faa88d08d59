//! Linux VM manager runtime.
//!
//! `ovm` drives QEMU/KVM virtual machines from a per-VM daemon process:
//! it multiplexes the serial console across any number of attached
//! clients over a Unix socket, polls the in-guest agent for network
//! state over vsock, and keeps all rendezvous state (`vm.pid`,
//! `console.sock`, `network-info.json`) under `~/.vm/<name>/`.
//!
//! The `vm` binary in `ovm-cli` is the user-facing surface; this crate
//! holds everything behind it.

pub mod agent;
pub mod cloudinit;
pub mod config;
pub mod console;
pub mod daemon;
pub mod disk;
pub mod engine;
pub mod error;
pub mod logging;
pub mod rescue;
pub mod socket;
pub mod spawner;
pub mod store;
pub mod term;
pub mod units;

pub use agent::{GuestAgent, GuestAgentError, NetworkInfo, VsockEndpoint};
pub use config::{StartOptions, VmConfig};
pub use console::{ConsoleClient, ConsoleConnectionError, ConsoleListener, ConsoleListenerError};
pub use daemon::{DaemonError, DaemonOptions};
pub use engine::{EngineState, QemuConfig, QemuEngine, VmEngine};
pub use error::{DiskError, ManagerError, RunnerError};
pub use rescue::{RescueCache, RescueCacheError};
pub use socket::{LocalListener, LocalStream, SocketError};
pub use store::{RESCUE_VM_NAME, RuntimeInfo, VmStore};
pub use term::TerminalError;
