//! CLI for the ovm Linux VM manager.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod rescue;
mod vm;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "vm", version, about = "Manage Linux virtual machines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new VM with a cloud-init provisioned disk.
    Create(vm::CreateArgs),

    /// Import an existing disk image as a VM.
    Import(vm::ImportArgs),

    /// Start a VM in the background (or attach with -i).
    Start(vm::StartArgs),

    /// Stop a running VM.
    Stop(vm::StopArgs),

    /// Attach the terminal to a VM's serial console.
    #[command(visible_alias = "console")]
    Attach(vm::AttachArgs),

    /// Open an SSH session to a VM.
    Ssh(vm::SshArgs),

    /// Print a VM's primary IPv4 address.
    #[command(hide = true)]
    Ip(vm::IpArgs),

    /// Show a VM's configuration and state.
    Info(vm::InfoArgs),

    /// List VMs.
    List(vm::ListArgs),

    /// Change a VM's CPU or memory allocation.
    Edit(vm::EditArgs),

    /// Grow a VM's disk.
    Resize(vm::ResizeArgs),

    /// Delete a VM and its data.
    Delete(vm::DeleteArgs),

    /// Boot the rescue system with a VM's disk attached.
    Rescue(rescue::RescueArgs),

    /// Run the VM daemon in the foreground (used internally).
    #[command(name = "run-daemon", hide = true)]
    RunDaemon(vm::RunDaemonArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for info/list.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        // The daemon installs its own file-backed logging.
        if !matches!(self.command, Command::RunDaemon(_)) {
            ovm::logging::init_cli();
        }

        match self.command {
            Command::Create(args) => vm::create(args).await,
            Command::Import(args) => vm::import(args).await,
            Command::Start(args) => vm::start(args).await,
            Command::Stop(args) => vm::stop(args).await,
            Command::Attach(args) => vm::attach(args).await,
            Command::Ssh(args) => vm::ssh(args),
            Command::Ip(args) => vm::ip(&args),
            Command::Info(args) => vm::info(&args),
            Command::List(args) => vm::list(&args),
            Command::Edit(args) => vm::edit(&args),
            Command::Resize(args) => vm::resize(&args),
            Command::Delete(args) => vm::delete(args).await,
            Command::Rescue(args) => rescue::rescue(args).await,
            Command::RunDaemon(args) => vm::run_daemon(args).await,
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "vm", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

/// Clap value parser for binary size strings (`4G`, `512MiB`, …).
pub(crate) fn parse_size_arg(s: &str) -> Result<u64, String> {
    ovm::units::parse_size(s).ok_or_else(|| format!("invalid size '{s}' (use e.g. 512M, 4G)"))
}
