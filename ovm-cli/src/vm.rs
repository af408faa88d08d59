//! VM lifecycle commands: create, import, start, stop, attach, ssh, info,
//! list, edit, resize, delete, run-daemon.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ovm::config::VmConfig;
use ovm::console::{ConsoleClient, ConsoleConnectionError};
use ovm::store::{RESCUE_VM_NAME, VmStore};
use ovm::{DaemonOptions, RunnerError, cloudinit, disk, spawner, units};

use crate::{OutputFormat, parse_size_arg};

/// Arguments for `vm create`.
#[derive(clap::Args)]
pub struct CreateArgs {
    /// VM name.
    pub name: String,

    /// Install ISO to attach on first boot.
    #[arg(long)]
    pub iso: Option<PathBuf>,

    /// Disk size (e.g. 64G).
    #[arg(long, default_value = "64G", value_parser = parse_size_arg)]
    pub disk_size: u64,

    /// Number of virtual CPUs.
    #[arg(long, default_value_t = 2)]
    pub cpus: u32,

    /// Memory size (e.g. 4G).
    #[arg(long, default_value = "4G", value_parser = parse_size_arg)]
    pub memory: u64,

    /// Start the VM and attach the console right away.
    #[arg(long)]
    pub interactive: bool,
}

/// Arguments for `vm import`.
#[derive(clap::Args)]
pub struct ImportArgs {
    /// VM name.
    pub name: String,

    /// Existing raw disk image to import.
    #[arg(long)]
    pub disk: PathBuf,

    /// Copy the image into the VM directory instead of linking it.
    #[arg(long)]
    pub copy: bool,

    /// Number of virtual CPUs.
    #[arg(long, default_value_t = 2)]
    pub cpus: u32,

    /// Memory size (e.g. 4G).
    #[arg(long, default_value = "4G", value_parser = parse_size_arg)]
    pub memory: u64,

    /// Grow the copied image to this size (requires --copy).
    #[arg(long, value_parser = parse_size_arg)]
    pub size: Option<u64>,
}

/// Arguments for `vm start`.
#[derive(clap::Args)]
pub struct StartArgs {
    /// VM name.
    pub name: String,

    /// Attach the console once the VM is up.
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Attach the configured install ISO.
    #[arg(long)]
    pub iso: bool,
}

/// Arguments for `vm stop`.
#[derive(clap::Args)]
pub struct StopArgs {
    /// VM name.
    pub name: String,

    /// Kill the daemon instead of asking for a graceful shutdown.
    #[arg(short = 'f', long)]
    pub force: bool,
}

/// Arguments for `vm attach`.
#[derive(clap::Args)]
pub struct AttachArgs {
    /// VM name.
    pub name: String,
}

/// Arguments for `vm ssh`.
#[derive(clap::Args)]
pub struct SshArgs {
    /// VM name.
    pub name: String,

    /// Remote user.
    #[arg(short = 'l', long = "login")]
    pub login: Option<String>,

    /// Remote port.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Extra arguments passed to ssh.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Arguments for `vm ip`.
#[derive(clap::Args)]
pub struct IpArgs {
    /// VM name.
    pub name: String,
}

/// Arguments for `vm info`.
#[derive(clap::Args)]
pub struct InfoArgs {
    /// VM name.
    pub name: String,

    /// Output format.
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments for `vm list`.
#[derive(clap::Args)]
pub struct ListArgs {
    /// Output format.
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,
}

/// Arguments for `vm edit`.
#[derive(clap::Args)]
pub struct EditArgs {
    /// VM name.
    pub name: String,

    /// New CPU count.
    #[arg(long)]
    pub cpus: Option<u32>,

    /// New memory size (e.g. 8G).
    #[arg(long, value_parser = parse_size_arg)]
    pub memory: Option<u64>,
}

/// Arguments for `vm resize`.
#[derive(clap::Args)]
pub struct ResizeArgs {
    /// VM name.
    pub name: String,

    /// New disk size (must be larger than the current size).
    #[arg(long, value_parser = parse_size_arg)]
    pub size: u64,
}

/// Arguments for `vm delete`.
#[derive(clap::Args)]
pub struct DeleteArgs {
    /// VM name.
    pub name: String,

    /// Stop the VM first if it is running.
    #[arg(short = 'f', long)]
    pub force: bool,
}

/// Arguments for the hidden `vm run-daemon`.
#[derive(clap::Args)]
pub struct RunDaemonArgs {
    /// VM name.
    pub name: String,

    /// Attach the configured install ISO.
    #[arg(long)]
    pub iso: bool,

    /// Boot in rescue mode.
    #[arg(long)]
    pub rescue: bool,

    /// Disk of the VM being rescued.
    #[arg(long, requires = "rescue")]
    pub target_disk: Option<PathBuf>,
}

/// Opens the default VM store.
pub fn open_store() -> Result<VmStore> {
    Ok(VmStore::open()?)
}

/// Refuses names that collide with the reserved rescue VM.
fn reject_reserved(name: &str) -> Result<()> {
    if name == RESCUE_VM_NAME {
        bail!("the name '{RESCUE_VM_NAME}' is reserved for the rescue system");
    }
    Ok(())
}

pub async fn create(args: CreateArgs) -> Result<()> {
    reject_reserved(&args.name)?;
    let store = open_store()?;

    let mut config = VmConfig::new(&args.name, args.cpus, args.memory, args.disk_size);
    if let Some(iso) = &args.iso {
        let iso = iso
            .canonicalize()
            .with_context(|| format!("ISO '{}' not found", iso.display()))?;
        config.iso_path = Some(iso);
    }
    config.validate()?;
    store.create_vm(&config)?;

    // Anything failing past this point must not leave a half-built VM.
    if let Err(e) = populate_new_vm(&store, &config).await {
        let _ = store.delete_vm(&args.name);
        return Err(e);
    }

    println!("Created VM '{}'", args.name);
    if args.interactive {
        let attach_iso = config.iso_path.is_some();
        return start_and_attach(&store, &args.name, attach_iso).await;
    }
    Ok(())
}

/// Creates the disk, seed ISO, and ssh_config for a freshly created VM.
async fn populate_new_vm(store: &VmStore, config: &VmConfig) -> Result<()> {
    disk::create_image(&store.disk_path(config), config.disk_size)?;
    cloudinit::create_seed_iso(store, &config.name).await?;
    cloudinit::write_ssh_config(store, &config.name)?;
    Ok(())
}

pub async fn import(args: ImportArgs) -> Result<()> {
    reject_reserved(&args.name)?;
    if args.size.is_some() && !args.copy {
        bail!("--size only makes sense with --copy (the original image is never resized)");
    }
    let store = open_store()?;

    let source_size = std::fs::metadata(&args.disk)
        .with_context(|| format!("disk image '{}' not found", args.disk.display()))?
        .len();

    let mut config = VmConfig::new(&args.name, args.cpus, args.memory, source_size);
    config.validate()?;
    store.create_vm(&config)?;

    let result = async {
        let dest = store.disk_path(&config);
        if args.copy {
            disk::copy_image(&args.disk, &dest)?;
            if let Some(size) = args.size {
                disk::resize_image(&dest, size)?;
                config.disk_size = size;
                store.save_config(&config)?;
            }
        } else {
            disk::link_image(&args.disk, &dest)?;
        }
        cloudinit::write_ssh_config(&store, &config.name)?;
        anyhow::Ok(())
    }
    .await;

    if let Err(e) = result {
        let _ = store.delete_vm(&args.name);
        return Err(e);
    }
    println!("Imported '{}' as VM '{}'", args.disk.display(), args.name);
    Ok(())
}

pub async fn start(args: StartArgs) -> Result<()> {
    let store = open_store()?;
    let config = store.load_config(&args.name)?;
    if store.running_pid(&args.name).is_some() {
        return Err(RunnerError::AlreadyRunning(args.name).into());
    }
    if args.iso && config.iso_path.is_none() {
        bail!("VM '{}' has no ISO configured", args.name);
    }

    if args.interactive {
        return start_and_attach(&store, &args.name, args.iso).await;
    }

    let command = spawner::daemon_command(&args.name, args.iso, None)?;
    let pid = spawner::spawn_background(&store, &args.name, command).await?;
    println!("Started VM '{}' (pid {pid})", args.name);
    Ok(())
}

/// Boots the daemon, waits for the console socket, and attaches.
async fn start_and_attach(store: &VmStore, name: &str, attach_iso: bool) -> Result<()> {
    let command = spawner::daemon_command(name, attach_iso, None)?;
    spawner::spawn_and_wait_for_socket(
        store,
        name,
        command,
        spawner::SOCKET_WAIT_TIMEOUT,
        true,
    )
    .await?;
    attach_console(store, name).await
}

pub async fn stop(args: StopArgs) -> Result<()> {
    let store = open_store()?;
    store.load_config(&args.name)?;
    let Some(pid) = store.running_pid(&args.name) else {
        bail!("VM '{}' is not running", args.name);
    };

    if args.force {
        spawner::kill_daemon(pid);
        spawner::wait_for_death(pid, Duration::from_secs(5)).await;
        // SIGKILL skips the daemon's own cleanup.
        store.remove_runtime_info(&args.name);
        let _ = std::fs::remove_file(store.console_socket_path(&args.name));
        store.remove_network_info(&args.name);
        println!("Killed VM '{}'", args.name);
        return Ok(());
    }

    spawner::terminate_daemon(pid)?;
    if spawner::wait_for_death(pid, Duration::from_secs(30)).await {
        println!("Stopped VM '{}'", args.name);
    } else {
        println!(
            "VM '{}' is still shutting down; use 'vm stop {} --force' to force-stop",
            args.name, args.name
        );
    }
    Ok(())
}

pub async fn attach(args: AttachArgs) -> Result<()> {
    let store = open_store()?;
    store.load_config(&args.name)?;
    if store.running_pid(&args.name).is_none() {
        bail!("VM '{}' is not running", args.name);
    }
    attach_console(&store, &args.name).await
}

/// Runs an interactive console session against a VM's socket.
pub(crate) async fn attach_console(store: &VmStore, name: &str) -> Result<()> {
    let socket = store.console_socket_path(name);
    let client = ConsoleClient::new(&socket);
    eprintln!("Attached to VM '{name}' (Ctrl-] to detach)");
    match client.run(|msg| eprintln!("{msg}")).await {
        Ok(()) => Ok(()),
        Err(ConsoleConnectionError::ConnectionFailed(_)) => Err(RunnerError::ConfigurationError(
            "VM may still be starting up".into(),
        )
        .into()),
        Err(e) => Err(e.into()),
    }
}

pub fn ssh(args: SshArgs) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let store = open_store()?;
    store.load_config(&args.name)?;
    let ip = primary_ip(&store, &args.name)?;

    // Fill the Host stanza's Hostname with the last known guest address,
    // then connect through the alias so the config does the resolution.
    let ssh_config = cloudinit::refresh_ssh_config(&store, &args.name, &ip)?;

    let mut command = std::process::Command::new("ssh");
    command.arg("-F").arg(&ssh_config);
    if let Some(login) = &args.login {
        command.arg("-l").arg(login);
    }
    if let Some(port) = args.port {
        command.arg("-p").arg(port.to_string());
    }
    command.arg(&args.name).args(&args.args);

    // Replaces this process on success.
    let err = command.exec();
    Err(anyhow::Error::from(err).context("failed to run ssh"))
}

pub fn ip(args: &IpArgs) -> Result<()> {
    use std::io::Write;

    let store = open_store()?;
    store.load_config(&args.name)?;
    let ip = primary_ip(&store, &args.name)?;
    // Bare address, no trailing newline: made for command substitution.
    print!("{ip}");
    std::io::stdout().flush()?;
    Ok(())
}

/// Last known primary IPv4 of a VM.
fn primary_ip(store: &VmStore, name: &str) -> Result<String> {
    let info = store
        .load_network_info(name)
        .with_context(|| format!("no network info for VM '{name}' yet; is it running?"))?;
    let ip = info
        .primary_ipv4()
        .with_context(|| format!("VM '{name}' has not reported an IPv4 address yet"))?;
    Ok(ip.to_owned())
}

/// Builds the JSON description shared by `info` and `list`.
fn describe(store: &VmStore, config: &VmConfig) -> serde_json::Value {
    let status = if store.running_pid(&config.name).is_some() {
        "running"
    } else {
        "stopped"
    };
    let ip = store
        .load_network_info(&config.name)
        .and_then(|i| i.primary_ipv4().map(str::to_owned));
    serde_json::json!({
        "name": config.name,
        "status": status,
        "cpu_count": config.cpu_count,
        "memory_size": config.memory_size,
        "disk_size": config.disk_size,
        "mac_address": config.mac_address,
        "ip_address": ip,
        "created_at": config.created_at,
        "modified_at": config.modified_at,
    })
}

pub fn info(args: &InfoArgs) -> Result<()> {
    let store = open_store()?;
    let config = store.load_config(&args.name)?;
    let value = describe(&store, &config);

    if matches!(args.format, OutputFormat::Json) {
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("name:     {}", config.name);
    println!("status:   {}", value["status"].as_str().unwrap_or("unknown"));
    println!("cpus:     {}", config.cpu_count);
    println!("memory:   {}", units::format_size(config.memory_size));
    println!("disk:     {}", units::format_size(config.disk_size));
    println!("mac:      {}", config.mac_address);
    if let Some(ip) = value["ip_address"].as_str() {
        println!("ip:       {ip}");
    }
    if let Some(iso) = &config.iso_path {
        println!("iso:      {}", iso.display());
    }
    println!("created:  {}", config.created_at.to_rfc3339());
    println!("modified: {}", config.modified_at.to_rfc3339());
    Ok(())
}

pub fn list(args: &ListArgs) -> Result<()> {
    let store = open_store()?;
    let names = store.list_vms()?;

    if matches!(args.format, OutputFormat::Json) {
        let items: Vec<_> = names
            .iter()
            .filter_map(|n| store.load_config(n).ok())
            .map(|c| describe(&store, &c))
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if names.is_empty() {
        println!("No VMs.");
        return Ok(());
    }
    println!(
        "{:<20} {:<9} {:>5} {:>8} {:>8}  IP",
        "NAME", "STATUS", "CPUS", "MEMORY", "DISK"
    );
    for name in &names {
        let Ok(config) = store.load_config(name) else {
            continue;
        };
        let value = describe(&store, &config);
        println!(
            "{:<20} {:<9} {:>5} {:>8} {:>8}  {}",
            config.name,
            value["status"].as_str().unwrap_or("unknown"),
            config.cpu_count,
            units::format_size(config.memory_size),
            units::format_size(config.disk_size),
            value["ip_address"].as_str().unwrap_or("-"),
        );
    }
    Ok(())
}

pub fn edit(args: &EditArgs) -> Result<()> {
    if args.cpus.is_none() && args.memory.is_none() {
        bail!("nothing to change; pass --cpus and/or --memory");
    }
    let store = open_store()?;
    let mut config = store.load_config(&args.name)?;
    if let Some(cpus) = args.cpus {
        config.cpu_count = cpus;
    }
    if let Some(memory) = args.memory {
        config.memory_size = memory;
    }
    config.validate()?;
    store.save_config(&config)?;

    if store.running_pid(&args.name).is_some() {
        println!("Updated VM '{}'; changes apply on the next start", args.name);
    } else {
        println!("Updated VM '{}'", args.name);
    }
    Ok(())
}

pub fn resize(args: &ResizeArgs) -> Result<()> {
    let store = open_store()?;
    let mut config = store.load_config(&args.name)?;
    if store.running_pid(&args.name).is_some() {
        bail!("cannot resize the disk of a running VM; stop '{}' first", args.name);
    }

    disk::resize_image(&store.disk_path(&config), args.size)?;
    config.disk_size = args.size;
    store.save_config(&config)?;
    println!(
        "Resized disk of VM '{}' to {}",
        args.name,
        units::format_size(args.size)
    );
    Ok(())
}

pub async fn delete(args: DeleteArgs) -> Result<()> {
    let store = open_store()?;
    store.load_config(&args.name)?;

    if args.force
        && let Some(pid) = store.running_pid(&args.name)
    {
        spawner::kill_daemon(pid);
        spawner::wait_for_death(pid, Duration::from_secs(5)).await;
        store.remove_runtime_info(&args.name);
    }

    store.delete_vm(&args.name)?;
    println!("Deleted VM '{}'", args.name);
    Ok(())
}

pub async fn run_daemon(args: RunDaemonArgs) -> Result<()> {
    let store = open_store()?;
    let options = DaemonOptions {
        attach_iso: args.iso,
        rescue: args.rescue,
        target_disk: args.target_disk,
    };
    ovm::daemon::run(&store, &args.name, &options).await?;
    Ok(())
}
