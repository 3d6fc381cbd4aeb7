use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

const BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by one relayed connection
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TunnelTotals {
    /// client → target
    pub bytes_out: u64,
    /// target → client
    pub bytes_in: u64,
}

/// Copy bytes both ways until both sides reach EOF, or either fails.
///
/// EOF in one direction half-closes the other peer's write side, and the
/// opposite direction keeps flowing. An error ends the tunnel at once; the
/// caller drops both streams right after, so the two ends close together.
pub async fn tunnel_connect<C, T>(client: C, target: T) -> TunnelTotals
where
    C: AsyncRead + AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut target_read, mut target_write) = tokio::io::split(target);
    let mut totals = TunnelTotals::default();

    let client_to_target = pump(&mut client_read, &mut target_write, &mut totals.bytes_out);
    let target_to_client = pump(&mut target_read, &mut client_write, &mut totals.bytes_in);

    if let Err(err) = tokio::try_join!(client_to_target, target_to_client) {
        trace!("tunnel closed early: {}", err);
    }

    totals
}

async fn pump<R, W>(src: &mut R, dst: &mut W, moved: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return dst.shutdown().await;
        }
        dst.write_all(&buf[..n]).await?;
        *moved += n as u64;
    }
}
