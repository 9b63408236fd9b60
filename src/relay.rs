use anyhow::{Context, Result};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error};

use crate::keepalive::DeadlineWatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientToUpstream => f.write_str("client -> upstream"),
            Self::UpstreamToClient => f.write_str("upstream -> client"),
        }
    }
}

/// Copies `src` into `dst` until `src` reaches EOF or either side fails.
///
/// Each read fills at most `buffer` and is written out in full before the next
/// read. On EOF the write side of `dst` is shut down so the peer sees the end
/// of stream. On failure the session deadline is expired, which stops the
/// opposite direction at its next pending read or write. Returns the number of
/// bytes copied.
pub async fn copy_stream<R, W>(
    mut src: R,
    mut dst: W,
    mut buffer: Vec<u8>,
    mut deadline: DeadlineWatch,
    direction: Direction,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;

    let result: Result<()> = loop {
        let n = match deadline.run(src.read(&mut buffer)).await.and_then(|r| r) {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(e) => break Err(e).context("Failed to read data"),
        };

        if let Err(e) = deadline.run(dst.write_all(&buffer[..n])).await.and_then(|r| r) {
            break Err(e).with_context(|| format!("Failed to write {n} bytes"));
        }
        copied += n as u64;
    };

    match result {
        Ok(()) => {
            debug!(%direction, bytes = copied, "Stream ended");
            if let Err(e) = dst.shutdown().await {
                debug!(%direction, error = %e, "Failed to propagate half-close");
            }
            Ok(copied)
        }
        Err(e) => {
            error!(%direction, bytes = copied, error = %format_args!("{e:#}"), "Transfer failed");
            deadline.expire();
            Err(e.context(format!("Transfer failed ({direction})")))
        }
    }
}
