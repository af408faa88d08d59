//! VM engine interface and its QEMU/KVM implementation.
//!
//! The daemon consumes the hypervisor through [`VmEngine`]; the concrete
//! engine drives a `qemu-system-*` child process and controls it over QMP.

mod qemu;
mod qmp;

pub use qemu::{QemuConfig, QemuEngine};
pub use qmp::{QmpClient, QmpError};

use crate::agent::VsockEndpoint;
use crate::error::RunnerError;

/// Observable engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EngineState {
    /// Configured but not yet fully booted.
    Starting,
    /// Guest is executing.
    Running,
    /// Guest execution is paused.
    Paused,
    /// Guest stopped cleanly.
    Stopped,
    /// Guest stopped with a failure.
    Error,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Cooperative, single-owner surface over the host hypervisor.
#[allow(async_fn_in_trait)]
pub trait VmEngine {
    /// Boots the guest.
    async fn start(&mut self) -> Result<(), RunnerError>;

    /// Requests a graceful stop, polling for up to 60 s before forcing.
    async fn stop(&mut self) -> Result<(), RunnerError>;

    /// Terminates the guest immediately.
    async fn force_stop(&mut self) -> Result<(), RunnerError>;

    /// Pauses guest execution.
    async fn pause(&mut self) -> Result<(), RunnerError>;

    /// Resumes guest execution.
    async fn resume(&mut self) -> Result<(), RunnerError>;

    /// Blocks until the guest has stopped.
    async fn wait_until_stopped(&mut self);

    /// Current observable state.
    async fn state(&mut self) -> EngineState;

    /// Vsock endpoint for the guest agent, when one was configured.
    fn guest_agent_endpoint(&self) -> Option<VsockEndpoint>;
}
