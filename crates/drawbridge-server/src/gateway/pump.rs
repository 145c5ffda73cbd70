//! Bidirectional byte pump.
//!
//! Two independent copy tasks, one per direction, with no priority between
//! them and no application-level flow control. EOF or a non-transient error
//! in either direction closes both endpoints; a bounded wait joins the
//! lagging direction before per-connection resources are released.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::debug;

/// How long the lagging direction gets to drain once the other ends.
const JOIN_GRACE: Duration = Duration::from_secs(5);

/// Pump bytes between `a` and `b` until either side ends. Returns the byte
/// counts moved `(a→b, b→a)`.
pub async fn run<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut a_to_b: JoinHandle<u64> = tokio::spawn(async move {
        let moved = tokio::io::copy(&mut a_read, &mut b_write).await.unwrap_or(0);
        let _ = b_write.shutdown().await;
        moved
    });
    let mut b_to_a: JoinHandle<u64> = tokio::spawn(async move {
        let moved = tokio::io::copy(&mut b_read, &mut a_write).await.unwrap_or(0);
        let _ = a_write.shutdown().await;
        moved
    });

    enum First {
        AToB(u64),
        BToA(u64),
    }

    let first = tokio::select! {
        up = &mut a_to_b => First::AToB(up.unwrap_or(0)),
        down = &mut b_to_a => First::BToA(down.unwrap_or(0)),
    };
    match first {
        First::AToB(up) => (up, join_within(b_to_a).await),
        First::BToA(down) => (join_within(a_to_b).await, down),
    }
}

async fn join_within(mut handle: JoinHandle<u64>) -> u64 {
    match tokio::time::timeout(JOIN_GRACE, &mut handle).await {
        Ok(result) => result.unwrap_or(0),
        Err(_) => {
            debug!("aborting lagging pump direction");
            handle.abort();
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bytes_flow_in_both_directions() {
        let (client_near, client_far) = tokio::io::duplex(1024);
        let (target_near, target_far) = tokio::io::duplex(1024);

        let pump = tokio::spawn(run(client_far, target_far));

        let (mut client, mut target) = (client_near, target_near);
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        target.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one endpoint ends the pump and propagates EOF.
        drop(client);
        let mut rest = Vec::new();
        target.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        drop(target);
        let (up, down) = pump.await.unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 4);
    }

    #[tokio::test]
    async fn large_transfers_are_byte_identical() {
        let (client_near, client_far) = tokio::io::duplex(4096);
        let (target_near, target_far) = tokio::io::duplex(4096);

        let pump = tokio::spawn(run(client_far, target_far));

        let payload: Vec<u8> = (0..128 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let mut client = client_near;
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            drop(client);
        });

        let mut target = target_near;
        let mut received = Vec::new();
        target.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        writer.await.unwrap();
        drop(target);
        let (up, _) = pump.await.unwrap();
        assert_eq!(up, expected.len() as u64);
    }
}
