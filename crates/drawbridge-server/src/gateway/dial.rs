//! Target dialing with bounded retries.

use std::time::Duration;

use drawbridge_core::{DrawbridgeError, DrawbridgeResult};
use rand::Rng;
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Total TCP connect attempts per `PS_CONN` frame.
const MAX_ATTEMPTS: u32 = 5;

const BASE_DELAY: Duration = Duration::from_millis(500);

/// Ceiling for the exponential delay.
const MAX_DELAY: Duration = Duration::from_secs(16);

/// Dial `host:port`, retrying up to 5 times with exponential delays. The
/// target is stateless from the gateway's point of view; exhaustion closes
/// the requesting client and nothing is marked unhealthy.
pub async fn dial_with_retries(host: &str, port: u16) -> DrawbridgeResult<TcpStream> {
    let addr = format!("{host}:{port}");
    for attempt in 0..MAX_ATTEMPTS {
        match TcpStream::connect(&addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                info!(addr = %addr, attempt = attempt + 1, error = %e, "target dial failed");
            }
        }
        if attempt + 1 < MAX_ATTEMPTS {
            tokio::time::sleep(retry_delay(attempt)).await;
        }
    }
    warn!(addr = %addr, attempts = MAX_ATTEMPTS, "target dial attempts exhausted");
    Err(DrawbridgeError::TargetUnreachable(addr))
}

/// Delay before the retry after 0-based `attempt`: `500ms · 2^attempt`
/// clamped at 16 s, plus uniform jitter up to 10% of the delay. The jitter
/// comes from the OS CSPRNG so simultaneous retriers against one failing
/// target do not realign.
fn retry_delay(attempt: u32) -> Duration {
    let base = BASE_DELAY
        .saturating_mul(1u32 << attempt.min(10))
        .min(MAX_DELAY);
    let jitter_cap = base.as_millis() as u64 / 10;
    let jitter = if jitter_cap == 0 {
        0
    } else {
        rand::rngs::OsRng.gen_range(0..=jitter_cap)
    };
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_follow_the_clamped_exponential_envelope() {
        let bases = [
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8),
            Duration::from_secs(16),
            Duration::from_secs(16), // clamped
        ];
        for (attempt, base) in bases.iter().enumerate() {
            for _ in 0..16 {
                let delay = retry_delay(attempt as u32);
                assert!(delay >= *base, "attempt {attempt}: {delay:?} < {base:?}");
                let cap = *base + base.mul_f64(0.1);
                assert!(delay <= cap, "attempt {attempt}: {delay:?} > {cap:?}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refused_target_exhausts_five_attempts() {
        // Bind then drop to get a port that refuses connections.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let started = tokio::time::Instant::now();
        let result = dial_with_retries("127.0.0.1", port).await;
        assert!(matches!(result, Err(DrawbridgeError::TargetUnreachable(_))));

        // Four inter-attempt sleeps: 0.5 + 1 + 2 + 4 seconds, plus at most
        // 10% jitter each. Paused time makes this exact enough to assert.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(7500), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(8250 + 500), "{elapsed:?}");
    }
}
