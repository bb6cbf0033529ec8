//! skdispatch: control plane for an sk_lookup socket-dispatch data plane.
//!
//! Programs the in-kernel classifier so inbound TCP/UDP traffic for a
//! configured (prefix, port) is steered to a server socket registered
//! under a human-readable label, without binding the server to every
//! address. State lives in pinned BPF maps under one directory per
//! network namespace; an exclusive lock on that directory serialises
//! control processes.

mod binding;
mod config;
mod destination;
mod dispatcher;
mod errors;
mod labels;
mod netns;
mod serve;
mod state;
mod sys;

use std::os::fd::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ipnet::IpNet;
use tracing::info;

use binding::{parse_prefix, Binding, Protocol};
use config::BindingsFile;
use dispatcher::Dispatcher;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "skdispatch",
    about = "Steer TCP/UDP traffic to labelled sockets with BPF sk_lookup",
    version
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Network namespace to operate on.
    #[arg(long, default_value = "/proc/self/ns/net", global = true)]
    netns: PathBuf,

    /// Root of the BPF filesystem holding pinned state.
    #[arg(long, default_value = "/sys/fs/bpf", global = true)]
    bpffs: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the dispatcher into the namespace.
    Load {
        /// Path to the compiled sk_lookup eBPF object.
        /// Build it with: cargo xtask build-ebpf
        #[arg(long, default_value = "sk-dispatch-ebpf")]
        program: PathBuf,
    },
    /// Remove the dispatcher and all of its state from the namespace.
    Unload,
    /// Bind a protocol, prefix and port to a label.
    Bind {
        label: String,
        protocol: Protocol,
        #[arg(value_parser = parse_prefix)]
        prefix: IpNet,
        port: u16,
    },
    /// Remove a previously created binding.
    Unbind {
        label: String,
        protocol: Protocol,
        #[arg(value_parser = parse_prefix)]
        prefix: IpNet,
        port: u16,
    },
    /// Show bindings and registered destinations.
    List,
    /// Replace all bindings with the contents of a JSON file.
    LoadBindings {
        /// File of the form {"bindings":[{"label":"foo","prefix":"127.0.0.1/32"}]}.
        file: PathBuf,
    },
    /// Register sockets received via socket activation under a label.
    Register { label: String },
    /// Serve command requests on a Unix socket.
    Serve {
        /// Pathname, or abstract address when prefixed with "@".
        address: String,
    },
    /// Show version information.
    Version,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    match &cli.command {
        Command::Load { program } => cmd_load(&cli, program),
        Command::Unload => cmd_unload(&cli),
        Command::Bind {
            label,
            protocol,
            prefix,
            port,
        } => cmd_bind(&cli, &Binding::new(label, *protocol, *prefix, *port)),
        Command::Unbind {
            label,
            protocol,
            prefix,
            port,
        } => cmd_unbind(&cli, &Binding::new(label, *protocol, *prefix, *port)),
        Command::List => cmd_list(&cli),
        Command::LoadBindings { file } => cmd_load_bindings(&cli, file),
        Command::Register { label } => cmd_register(&cli, label),
        Command::Serve { address } => serve::serve(address),
        Command::Version => {
            println!("skdispatch version {}", serve::VERSION);
            Ok(())
        }
    }
}

fn open_dispatcher(cli: &Cli) -> Result<Dispatcher> {
    Dispatcher::open(&cli.netns, &cli.bpffs)
        .with_context(|| format!("opening dispatcher for {}", cli.netns.display()))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_load(cli: &Cli, program: &Path) -> Result<()> {
    let bytes = std::fs::read(program).with_context(|| {
        format!(
            "reading eBPF program from {}. Build it with: cargo xtask build-ebpf",
            program.display()
        )
    })?;

    let dispatcher = Dispatcher::create(&cli.netns, &cli.bpffs, &bytes)
        .with_context(|| format!("loading dispatcher into {}", cli.netns.display()))?;

    info!(state = %dispatcher.state_path().display(), "dispatcher loaded");
    dispatcher.close();
    Ok(())
}

fn cmd_unload(cli: &Cli) -> Result<()> {
    let dispatcher = open_dispatcher(cli)?;
    dispatcher.unload().context("unloading dispatcher")?;
    info!("dispatcher unloaded");
    Ok(())
}

fn cmd_bind(cli: &Cli, binding: &Binding) -> Result<()> {
    let mut dispatcher = open_dispatcher(cli)?;
    dispatcher.add_binding(binding)?;
    info!(%binding, "added binding");
    Ok(())
}

fn cmd_unbind(cli: &Cli, binding: &Binding) -> Result<()> {
    let mut dispatcher = open_dispatcher(cli)?;
    dispatcher.remove_binding(binding)?;
    info!(%binding, "removed binding");
    Ok(())
}

fn cmd_list(cli: &Cli) -> Result<()> {
    let dispatcher = open_dispatcher(cli)?;

    println!("Bindings:");
    for binding in dispatcher.bindings()? {
        println!("  {binding}");
    }

    println!("Destinations:");
    for dest in dispatcher.destinations()? {
        println!(
            "  {} {} {} -> {}",
            dest.family, dest.protocol, dest.label, dest.cookie
        );
    }
    Ok(())
}

fn cmd_load_bindings(cli: &Cli, file: &Path) -> Result<()> {
    let bindings = BindingsFile::load(file)?.to_bindings();

    let mut dispatcher = open_dispatcher(cli)?;
    let (added, removed) = dispatcher.replace_bindings(&bindings)?;

    info!(
        added = added.len(),
        removed = removed.len(),
        "replaced bindings"
    );
    Ok(())
}

fn cmd_register(cli: &Cli, label: &str) -> Result<()> {
    let fds = socket_activation_fds()?;

    let mut dispatcher = open_dispatcher(cli)?;
    for fd in fds {
        let sock = unsafe { BorrowedFd::borrow_raw(fd) };
        let registration = dispatcher
            .register_socket(label, sock)
            .with_context(|| format!("registering fd {fd}"))?;
        info!("{registration}");
    }
    Ok(())
}

/// File descriptors handed over by the systemd socket-activation
/// protocol: LISTEN_FDS descriptors starting at 3, guarded by LISTEN_PID.
fn socket_activation_fds() -> Result<Vec<RawFd>> {
    if let Ok(pid) = std::env::var("LISTEN_PID") {
        if pid.parse() != Ok(std::process::id()) {
            bail!("LISTEN_PID={pid} does not match this process");
        }
    }

    let count: u32 = std::env::var("LISTEN_FDS")
        .context("LISTEN_FDS is not set: register needs sockets via socket activation")?
        .parse()
        .context("invalid LISTEN_FDS")?;
    if count == 0 {
        bail!("LISTEN_FDS is 0: no sockets to register");
    }

    Ok((0..count).map(|i| 3 + i as RawFd).collect())
}
