//! `vm rescue`: boot the rescue system with a target VM's disk attached.

use anyhow::{Result, bail};
use ovm::rescue::{RescueCache, prepare_rescue_vm};
use ovm::store::RESCUE_VM_NAME;
use ovm::spawner;

use crate::vm::open_store;

/// Arguments for `vm rescue`.
#[derive(clap::Args)]
pub struct RescueArgs {
    /// VM whose disk should be attached to the rescue system.
    pub name: String,

    /// Re-download the rescue image even if a cached copy exists.
    #[arg(long)]
    pub force_download: bool,

    /// Never touch the network; fail unless a cached image exists.
    #[arg(long)]
    pub offline: bool,
}

pub async fn rescue(args: RescueArgs) -> Result<()> {
    if args.name == RESCUE_VM_NAME {
        bail!("cannot rescue the rescue VM");
    }
    let store = open_store()?;
    let target = store.load_config(&args.name)?;

    // The target's disk gets attached read-write; a running guest on
    // either side would corrupt it.
    if store.running_pid(&args.name).is_some() {
        bail!("VM '{}' is running; stop it before rescuing", args.name);
    }
    if store.running_pid(RESCUE_VM_NAME).is_some() {
        bail!("a rescue session is already running");
    }

    let cache = RescueCache::new(&store);
    let image = cache.ensure_image(args.force_download, args.offline, |msg| {
        eprintln!("{msg}");
    })?;
    prepare_rescue_vm(&store, &image)?;

    let target_disk = store.disk_path(&target);
    let command = spawner::daemon_command(RESCUE_VM_NAME, false, Some(target_disk.as_path()))?;
    spawner::spawn_and_wait_for_socket(
        &store,
        RESCUE_VM_NAME,
        command,
        spawner::RESCUE_SOCKET_WAIT_TIMEOUT,
        true,
    )
    .await?;

    eprintln!(
        "Rescue system booted; '{}' is attached as the second disk",
        args.name
    );
    crate::vm::attach_console(&store, RESCUE_VM_NAME).await
}
