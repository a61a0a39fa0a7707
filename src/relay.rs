//! Bidirectional byte relay between a negotiated client/remote socket pair.
//!
//! Two blocking threads pump the two directions over cloned streams. Both
//! share one activity clock: the tunnel is torn down only when *neither*
//! direction has moved data within the idle window, when either peer closes,
//! or on the first I/O error. Teardown shuts down both sockets, which also
//! unblocks the opposite thread.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::stats::ProxyStats;

/// Relay buffer size.
pub const RELAY_CHUNK: usize = 32 * 1024;

/// Tear the tunnel down after this long with no data in either direction.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Read-timeout granularity at which idle and shutdown are re-checked.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayTotals {
    /// Bytes relayed client → remote.
    pub sent: u64,
    /// Bytes relayed remote → client.
    pub received: u64,
}

/// Relay until EOF, error, or idle timeout. Consumes both sockets; they are
/// shut down before returning. Returns the per-direction byte totals.
pub fn relay(
    client: TcpStream,
    remote: TcpStream,
    stats: &Arc<ProxyStats>,
    idle_timeout: Duration,
) -> io::Result<RelayTotals> {
    client.set_read_timeout(Some(POLL_INTERVAL))?;
    remote.set_read_timeout(Some(POLL_INTERVAL))?;

    let client_read = client.try_clone()?;
    let remote_write = remote.try_clone()?;

    let activity = Arc::new(Mutex::new(Instant::now()));
    let done = Arc::new(AtomicBool::new(false));

    let up_stats = Arc::clone(stats);
    let up_activity = Arc::clone(&activity);
    let up_done = Arc::clone(&done);
    let uplink = thread::spawn(move || {
        pump(
            client_read,
            remote_write,
            Direction::ClientToRemote,
            &up_stats,
            &up_activity,
            &up_done,
            idle_timeout,
        )
    });

    let received = pump(
        remote,
        client,
        Direction::RemoteToClient,
        stats,
        &activity,
        &done,
        idle_timeout,
    );
    let sent = uplink.join().unwrap_or(0);

    Ok(RelayTotals { sent, received })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    ClientToRemote,
    RemoteToClient,
}

fn pump(
    mut reader: TcpStream,
    mut writer: TcpStream,
    direction: Direction,
    stats: &Arc<ProxyStats>,
    activity: &Mutex<Instant>,
    done: &AtomicBool,
    idle_timeout: Duration,
) -> u64 {
    let mut buf = vec![0u8; RELAY_CHUNK];
    let mut total = 0u64;

    loop {
        if done.load(Ordering::Relaxed) {
            break;
        }
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                // write_all loops over partial writes.
                if writer.write_all(&buf[..n]).is_err() {
                    break;
                }
                total += n as u64;
                *activity.lock() = Instant::now();
                match direction {
                    Direction::ClientToRemote => stats.record_bytes(n as u64, 0),
                    Direction::RemoteToClient => stats.record_bytes(0, n as u64),
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                if activity.lock().elapsed() >= idle_timeout {
                    break;
                }
            }
            Err(e) => {
                debug!("relay error: {e}");
                break;
            }
        }
    }

    done.store(true, Ordering::Relaxed);
    let _ = reader.shutdown(Shutdown::Both);
    let _ = writer.shutdown(Shutdown::Both);
    total
}
