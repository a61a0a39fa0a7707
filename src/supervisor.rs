//! Multi-process worker supervision.
//!
//! The supervisor spawns N copies of this binary in worker mode, all bound
//! to the same `(ip, port)` through port reuse, and keeps them alive: a
//! liveness poll reaps dead workers and respawns them (with exponential
//! backoff when they die young, so a permanently failing target is not
//! respawned in a tight loop). Shutdown escalates from SIGTERM to SIGKILL
//! after a bounded grace period.

use std::env;
use std::io;
use std::net::Ipv4Addr;
use std::process::{Child, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

/// Liveness poll interval.
const SUPERVISE_INTERVAL: Duration = Duration::from_secs(1);

/// Delay between worker launches at startup, avoiding a bind stampede.
const STARTUP_STAGGER: Duration = Duration::from_millis(100);

/// How long terminated workers get before being force-killed.
const GRACE_PERIOD: Duration = Duration::from_secs(3);

const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// A worker that survives this long is considered healthy; its next crash
/// respawns immediately.
const HEALTHY_UPTIME: Duration = Duration::from_secs(5);

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

struct WorkerSlot {
    child: Option<Child>,
    spawned_at: Instant,
    backoff: Duration,
    respawn_at: Instant,
}

/// Run the supervisor until a shutdown signal arrives. Only returns an
/// error when the initial spawns are impossible (e.g. the executable path
/// cannot be determined).
pub fn run(bind_ip: Ipv4Addr, port: u16, workers: usize) -> io::Result<()> {
    install_shutdown_flag();
    info!("starting {workers} workers on {bind_ip}:{port}");

    let mut slots = Vec::with_capacity(workers);
    for index in 0..workers {
        let child = spawn_worker(bind_ip, port)?;
        info!(worker = index, pid = child.id(), "worker started");
        slots.push(WorkerSlot {
            child: Some(child),
            spawned_at: Instant::now(),
            backoff: Duration::ZERO,
            respawn_at: Instant::now(),
        });
        thread::sleep(STARTUP_STAGGER);
    }

    while !SHUTDOWN.load(Ordering::SeqCst) {
        for (index, slot) in slots.iter_mut().enumerate() {
            supervise_slot(index, slot, bind_ip, port);
        }
        thread::sleep(SUPERVISE_INTERVAL);
    }

    info!("shutdown signal received");
    shutdown(slots);
    Ok(())
}

/// Reap a dead worker and schedule or perform its respawn.
fn supervise_slot(index: usize, slot: &mut WorkerSlot, bind_ip: Ipv4Addr, port: u16) {
    if let Some(child) = &mut slot.child {
        match child.try_wait() {
            Ok(None) => return, // alive
            Ok(Some(status)) => {
                let uptime = slot.spawned_at.elapsed();
                slot.backoff = next_backoff(slot.backoff, uptime);
                slot.respawn_at = Instant::now() + slot.backoff;
                slot.child = None;
                warn!(
                    worker = index,
                    %status,
                    uptime_secs = uptime.as_secs(),
                    backoff_ms = slot.backoff.as_millis() as u64,
                    "worker died, restarting"
                );
            }
            Err(e) => {
                error!(worker = index, "failed to poll worker: {e}");
                return;
            }
        }
    }

    if Instant::now() < slot.respawn_at {
        return;
    }
    match spawn_worker(bind_ip, port) {
        Ok(child) => {
            info!(worker = index, pid = child.id(), "worker respawned");
            slot.child = Some(child);
            slot.spawned_at = Instant::now();
        }
        Err(e) => {
            error!(worker = index, "failed to respawn worker: {e}");
            slot.backoff = next_backoff(slot.backoff, Duration::ZERO);
            slot.respawn_at = Instant::now() + slot.backoff;
        }
    }
}

/// Exponential backoff for workers that die young; healthy workers respawn
/// immediately.
fn next_backoff(previous: Duration, uptime: Duration) -> Duration {
    if uptime >= HEALTHY_UPTIME {
        Duration::ZERO
    } else if previous.is_zero() {
        BACKOFF_INITIAL
    } else {
        (previous * 2).min(BACKOFF_MAX)
    }
}

/// Re-execute this binary in worker mode, inheriting stdio so worker logs
/// land on the same stream.
fn spawn_worker(bind_ip: Ipv4Addr, port: u16) -> io::Result<Child> {
    Command::new(env::current_exe()?)
        .arg("worker")
        .arg("--ip")
        .arg(bind_ip.to_string())
        .arg("--port")
        .arg(port.to_string())
        .spawn()
}

/// Graceful stop: SIGTERM everyone, wait out the grace period, SIGKILL the
/// stragglers, and reap every child.
fn shutdown(mut slots: Vec<WorkerSlot>) {
    for slot in &slots {
        if let Some(child) = &slot.child {
            terminate(child);
        }
    }

    let deadline = Instant::now() + GRACE_PERIOD;
    loop {
        let mut remaining = 0;
        for slot in &mut slots {
            if let Some(child) = &mut slot.child {
                match child.try_wait() {
                    Ok(Some(_)) => slot.child = None,
                    Ok(None) => remaining += 1,
                    Err(_) => slot.child = None,
                }
            }
        }
        if remaining == 0 {
            break;
        }
        if Instant::now() >= deadline {
            for slot in &mut slots {
                if let Some(child) = &mut slot.child {
                    warn!(pid = child.id(), "worker ignored SIGTERM, killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    slot.child = None;
                }
            }
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    info!("all workers stopped");
}

fn terminate(child: &Child) {
    // Safety: plain kill(2) on a pid we own.
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
}

fn install_shutdown_flag() {
    extern "C" fn on_signal(_: libc::c_int) {
        SHUTDOWN.store(true, Ordering::SeqCst);
    }
    let handler = on_signal as extern "C" fn(libc::c_int);
    // Safety: the handler only touches an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}
