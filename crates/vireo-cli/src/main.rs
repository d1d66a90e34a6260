use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use vireo_kernel::rights::Rights;
use vireo_kernel::vmo::VmoFlags;
use vireo_runtime::Runtime;
use vireo_user::Client;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load an ELF binary and spawn it as a process.
    Spawn {
        /// Path to the ELF file.
        file: PathBuf,

        /// RAM given to the kernel, in bytes.
        #[arg(long, default_value_t = 64 * 1024 * 1024)]
        memory: u64,

        /// Scheduler ticks to run after spawning.
        #[arg(long, default_value_t = 8)]
        ticks: u64,
    },
    /// Boot a kernel and run a self-contained channel + VMO handoff, with
    /// no binary required.
    Demo {
        #[arg(long, default_value_t = 16 * 1024 * 1024)]
        memory: u64,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Spawn { file, memory, ticks } => cmd_spawn(&file, memory, ticks)?,
        Commands::Demo { memory } => cmd_demo(memory)?,
    }

    Ok(())
}

fn cmd_spawn(file: &PathBuf, memory: u64, ticks: u64) -> Result<()> {
    let mut runtime = Runtime::boot(memory)?;
    let pid = runtime.spawn_from_disk(file)?;
    println!("spawned {file:?} as pid {}", pid.val());

    runtime.run_ticks(ticks);
    info!("ran {ticks} scheduler ticks");
    println!("process {} threads: {:?}", pid.val(), runtime.kernel().processes.get(pid)?.threads);

    Ok(())
}

/// Exercises a channel handoff carrying a VMO handle end to end: two
/// endpoints, a write into the VMO, a send that moves the handle across,
/// and a read-back through the receiver's copy.
fn cmd_demo(memory: u64) -> Result<()> {
    let mut runtime = Runtime::boot(memory)?;
    let kernel = runtime.kernel_mut();
    let sender = Client::new(vireo_kernel::types::Pid::KERNEL);

    let channel_rights = Rights::READ | Rights::WRITE | Rights::TRANSFER;
    let (h0, h1) = sender.channel_create(kernel, channel_rights)?;
    println!("created channel: endpoints {h0} and {h1}");

    let vmo_rights = Rights::READ | Rights::WRITE | Rights::MAP | Rights::TRANSFER;
    let vmo = sender.vmo_create(kernel, 4096, VmoFlags::RESIZABLE, vmo_rights)?;
    sender.handle_write(kernel, vmo, b"hello from the other side".to_vec())?;
    println!("created a 4 KiB VMO and wrote a greeting into it");

    sender.channel_send(kernel, h0, b"transfer incoming".to_vec(), vec![vmo])?;
    let (data, handles) = sender.channel_recv(kernel, h1, 256)?;
    println!(
        "received {:?} plus {} transferred handle(s): {:?}",
        String::from_utf8_lossy(&data),
        handles.len(),
        handles
    );

    let received_vmo = handles[0];
    let readback = sender.handle_read(kernel, received_vmo, 25)?;
    println!("read back through the transferred handle: {:?}", String::from_utf8_lossy(&readback));

    sender.handle_close(kernel, received_vmo)?;
    sender.handle_close(kernel, h0)?;
    sender.handle_close(kernel, h1)?;
    println!("demo complete");

    Ok(())
}
