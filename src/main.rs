/*
   hotsocks - multi-process SOCKS5 proxy pinned to one network interface.

   For machines with several active interfaces (WiFi + Ethernet), hotsocks
   listens on the chosen interface's IP and binds every outbound connection
   to that same IP, so proxied traffic leaves through that interface only.

   Features:
   - CONNECT with IPv4 and domain-name targets (RFC 1928 subset)
   - DNS fallback chain over public nameservers, cached per worker
   - N independent worker processes sharing the port via SO_REUSEPORT,
     supervised and respawned on crash
   - Per-worker connection and bandwidth statistics
*/

mod config;
mod dns;
mod iface;
mod logging;
mod proxy;
mod relay;
mod socks;
mod stats;
mod supervisor;

use std::process;

use clap::Parser;
use tracing::{error, info};

use config::{Cli, WorkerCommand};

fn main() {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.debug);

    match cli.command {
        Some(WorkerCommand::Worker { ip, port }) => {
            if let Err(e) = proxy::run_worker(ip, port) {
                error!("worker failed: {e}");
                process::exit(1);
            }
        }
        None => {
            let bind_ip = match cli.ip {
                Some(ip) => ip,
                None => match iface::select_interface() {
                    Ok(Some(selected)) => {
                        info!(
                            interface = %selected.name,
                            ip = %selected.ip,
                            "selected egress interface"
                        );
                        selected.ip
                    }
                    Ok(None) => {
                        error!("no suitable network interface found");
                        process::exit(1);
                    }
                    Err(e) => {
                        error!("interface scan failed: {e}");
                        process::exit(1);
                    }
                },
            };

            if let Err(e) = supervisor::run(bind_ip, cli.port, cli.worker_count()) {
                error!("error: {e}");
                process::exit(1);
            }
        }
    }
}
