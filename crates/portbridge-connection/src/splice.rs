//! Bidirectional socket splicing
//!
//! Joins two established TCP connections and moves bytes in both directions
//! until either side closes. The first direction to finish ends the splice:
//! both sockets are closed, which unblocks the opposite copier. Neither
//! direction is guaranteed to drain fully once the other has completed.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Byte counts recorded by a completed splice, one per direction.
///
/// The count for the direction that was still in flight when the splice
/// ended reflects the bytes delivered up to that point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceSummary {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// True for errors that only mean the peer went away: connection reset,
/// writes against a closed socket, or a short read at EOF.
pub fn is_benign_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

/// Splice sockets `a` and `b` together until either side closes.
///
/// Both sockets are consumed and are closed by the time this returns.
pub async fn splice(a: TcpStream, b: TcpStream) -> SpliceSummary {
    let a_to_b = Arc::new(AtomicU64::new(0));
    let b_to_a = Arc::new(AtomicU64::new(0));

    let (a_read, a_write) = a.into_split();
    let (b_read, b_write) = b.into_split();

    let mut forward = tokio::spawn(copy_counted(a_read, b_write, a_to_b.clone(), "forward"));
    let mut reverse = tokio::spawn(copy_counted(b_read, a_write, b_to_a.clone(), "reverse"));

    tokio::select! {
        _ = &mut forward => finish(reverse).await,
        _ = &mut reverse => finish(forward).await,
    }

    let summary = SpliceSummary {
        a_to_b: a_to_b.load(Ordering::Relaxed),
        b_to_a: b_to_a.load(Ordering::Relaxed),
    };

    debug!(
        bytes_forward = summary.a_to_b,
        bytes_reverse = summary.b_to_a,
        "splice complete"
    );

    summary
}

/// Stop the remaining copier. Aborting drops its socket halves, closing the
/// underlying connections and unblocking any pending read or write.
async fn finish(handle: JoinHandle<()>) {
    handle.abort();
    let _ = handle.await;
}

async fn copy_counted(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    counter: Arc<AtomicU64>,
    direction: &'static str,
) {
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    if !is_benign_close(&e) {
                        warn!(direction, error = %e, "splice write failed");
                    }
                    return;
                }
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                if !is_benign_close(&e) {
                    warn!(direction, error = %e, "splice read failed");
                }
                break;
            }
        }
    }

    // Propagate EOF so the far side sees the close.
    let _ = writer.shutdown().await;
    debug!(direction, "splice direction finished");
}
