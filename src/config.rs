//! Command-line surface. The proxy core only ever sees the validated
//! `(bind_ip, port, worker_count)` triple this module produces.

use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::thread;

use clap::{Parser, Subcommand};

pub const DEFAULT_PORT: u16 = 9050;

#[derive(Debug, Parser)]
#[command(
    name = "hotsocks",
    version,
    about = "SOCKS5 proxy that routes outbound traffic through a chosen network interface"
)]
pub struct Cli {
    /// IPv4 address of the interface to listen and send on.
    /// Auto-selected from the available interfaces when omitted.
    #[arg(long)]
    pub ip: Option<Ipv4Addr>,

    /// Port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Number of worker processes (default: CPU count).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<WorkerCommand>,
}

#[derive(Debug, Subcommand)]
pub enum WorkerCommand {
    /// Run a single listener process. Spawned by the supervisor, not meant
    /// to be invoked by hand.
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        ip: Ipv4Addr,
        #[arg(long)]
        port: u16,
    },
}

impl Cli {
    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| {
                thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1)
            })
            .max(1)
    }
}
