//! One-directional relay with idle close and cancellation.

use std::fmt;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Relay buffer size per direction.
pub const PUMP_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on the final flush when a pump exits.
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Relay direction, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to upstream server.
    ClientToServer,
    /// Upstream server to client.
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("C->S"),
            Direction::ServerToClient => f.write_str("S->C"),
        }
    }
}

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpOutcome {
    /// Source reached orderly EOF.
    Eof,
    /// No data arrived within the idle window.
    IdleClosed,
    /// Sibling pump finished or shutdown fired.
    Cancelled,
    ReadError(io::Error),
    WriteError(io::Error),
}

/// Outcome plus bytes relayed.
#[derive(Debug)]
pub struct PumpReport {
    pub outcome: PumpOutcome,
    pub bytes: u64,
}

/// Copy `src` into `dst` until EOF, error, idle timeout or cancellation.
///
/// Each chunk is written and flushed before the next read, so a slow
/// writer stalls the reader and memory stays at one buffer.
pub async fn pump<R, W>(
    src: &mut R,
    dst: &mut W,
    idle_close: Option<Duration>,
    cancel: &CancellationToken,
    direction: Direction,
) -> PumpReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut bytes = 0u64;

    let outcome = loop {
        let read = match idle_close {
            Some(idle) => match cancel.run_until_cancelled(timeout(idle, src.read(&mut buf))).await {
                None => break PumpOutcome::Cancelled,
                Some(Err(_)) => {
                    debug!(%direction, idle_secs = idle.as_secs(), "Idle close");
                    break PumpOutcome::IdleClosed;
                }
                Some(Ok(read)) => read,
            },
            None => match cancel.run_until_cancelled(src.read(&mut buf)).await {
                None => break PumpOutcome::Cancelled,
                Some(read) => read,
            },
        };

        let n = match read {
            Ok(0) => break PumpOutcome::Eof,
            Ok(n) => n,
            Err(e) => {
                warn!(%direction, error = %e, "Relay read error");
                break PumpOutcome::ReadError(e);
            }
        };

        let write = async {
            dst.write_all(&buf[..n]).await?;
            dst.flush().await
        };
        match cancel.run_until_cancelled(write).await {
            None => break PumpOutcome::Cancelled,
            Some(Err(e)) => {
                warn!(%direction, error = %e, "Relay write error");
                break PumpOutcome::WriteError(e);
            }
            Some(Ok(())) => bytes += n as u64,
        }
    };

    let _ = timeout(FINAL_FLUSH_TIMEOUT, dst.flush()).await;

    debug!(%direction, bytes, outcome = ?outcome, "Pump finished");
    PumpReport { outcome, bytes }
}
