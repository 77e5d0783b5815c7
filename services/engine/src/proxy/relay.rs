//! Full-duplex byte relay between an inbound and an outbound stream.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const RELAY_BUFFER_SIZE: usize = 8192;

/// Bytes moved by a relay so far. Updated as data flows, so the totals are
/// still meaningful when the relay ends with an error.
#[derive(Debug, Default)]
pub struct RelayCounters {
    up: AtomicU64,
    down: AtomicU64,
}

impl RelayCounters {
    /// Bytes sent from the client toward the destination.
    pub fn up(&self) -> u64 {
        self.up.load(Ordering::Relaxed)
    }

    /// Bytes sent from the destination back to the client.
    pub fn down(&self) -> u64 {
        self.down.load(Ordering::Relaxed)
    }

    /// Count client bytes forwarded outside the relay loop.
    pub(super) fn add_up(&self, n: u64) {
        self.up.fetch_add(n, Ordering::Relaxed);
    }

    fn total(&self) -> u64 {
        self.up() + self.down()
    }
}

/// Copy bytes both ways until each side has sent EOF.
///
/// EOF on one side is forwarded as a write shutdown on the other, and the
/// opposite direction keeps flowing. An I/O error on either side ends both
/// directions at once. With `idle_timeout` set, the relay fails with
/// `TimedOut` once no byte has moved in either direction for between one
/// and two timeout periods.
pub async fn relay<A, B>(
    inbound: A,
    outbound: B,
    idle_timeout: Option<Duration>,
    counters: &RelayCounters,
) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut in_read, mut in_write) = tokio::io::split(inbound);
    let (mut out_read, mut out_write) = tokio::io::split(outbound);

    let transfer = async {
        tokio::try_join!(
            copy_half(&mut in_read, &mut out_write, &counters.up),
            copy_half(&mut out_read, &mut in_write, &counters.down),
        )
        .map(|_| ())
    };

    match idle_timeout {
        None => transfer.await,
        Some(idle) => tokio::select! {
            result = transfer => result,
            err = idle_watchdog(counters, idle) => Err(err),
        },
    }
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
    writer.shutdown().await
}

async fn idle_watchdog(counters: &RelayCounters, idle: Duration) -> io::Error {
    let mut last = counters.total();
    loop {
        tokio::time::sleep(idle).await;
        let now = counters.total();
        if now == last {
            return io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout");
        }
        last = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_relay_both_directions_with_half_close() {
        let (client, client_side) = duplex(64);
        let (server_side, server) = duplex(64);
        let counters = RelayCounters::default();

        let relay_fut = relay(client_side, server_side, None, &counters);

        let peers = async move {
            let (mut client_read, mut client_write) = tokio::io::split(client);
            let (mut server_read, mut server_write) = tokio::io::split(server);

            client_write.write_all(b"hello upstream").await.unwrap();
            client_write.shutdown().await.unwrap();

            let mut received = Vec::new();
            server_read.read_to_end(&mut received).await.unwrap();
            assert_eq!(received, b"hello upstream");

            // The reverse direction still flows after the client half-closed.
            server_write.write_all(b"reply").await.unwrap();
            server_write.shutdown().await.unwrap();

            let mut reply = Vec::new();
            client_read.read_to_end(&mut reply).await.unwrap();
            assert_eq!(reply, b"reply");
        };

        let (result, ()) = tokio::join!(relay_fut, peers);
        result.unwrap();
        assert_eq!(counters.up(), 14);
        assert_eq!(counters.down(), 5);
    }

    #[tokio::test]
    async fn test_relay_preserves_order() {
        let (mut client, client_side) = duplex(1024);
        let (server_side, mut server) = duplex(1024);
        let counters = RelayCounters::default();

        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let sender = async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
            // Keep the read half alive until the server closes.
            let mut rest = Vec::new();
            client.read_to_end(&mut rest).await.unwrap();
        };
        let receiver = async move {
            let mut received = Vec::new();
            server.read_to_end(&mut received).await.unwrap();
            server.shutdown().await.unwrap();
            received
        };

        let (result, (), received) = tokio::join!(
            relay(client_side, server_side, None, &counters),
            sender,
            receiver
        );
        result.unwrap();
        assert_eq!(received, expected);
        assert_eq!(counters.up(), 100_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let (_client, client_side) = duplex(64);
        let (server_side, _server) = duplex(64);
        let counters = RelayCounters::default();

        let err = relay(client_side, server_side, Some(Duration::from_secs(30)), &counters)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
