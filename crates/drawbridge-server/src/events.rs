//! Fire-and-forget event log sink.
//!
//! The dispatcher builds one [`Event`] per post-handshake frame and hands it
//! to an unbounded channel; a single drain task writes events through the
//! repository off the async runtime. The dispatcher never waits on the
//! store. Events are advisory: write failures are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use drawbridge_core::frame::RequestKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::repository::Repository;

/// A per-request event, keyed by the device that issued the frame.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event UUID.
    pub id: String,
    /// Device id from the handshake (Subject Serial Number of the peer leaf).
    pub device_id: String,
    /// Source IP of the client connection.
    pub source_ip: String,
    /// Which frame type was received.
    pub request: RequestKind,
    /// Target service id for `PS_CONN` frames.
    pub target_service: Option<u16>,
    /// RFC-3339 timestamp.
    pub timestamp: String,
}

impl Event {
    pub fn new(
        device_id: impl Into<String>,
        source_ip: impl Into<String>,
        request: RequestKind,
        target_service: Option<u16>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            source_ip: source_ip.into(),
            request,
            target_service,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

/// Handle for submitting events; clone freely into dispatcher tasks.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSink {
    /// Spawn the drain task and return the sink plus its join handle.
    ///
    /// The drain exits once every sink clone is dropped and the queue is
    /// empty; await the handle (with a bound) to flush on shutdown.
    pub fn spawn(repo: Arc<dyn Repository>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let repo = repo.clone();
                let result =
                    tokio::task::spawn_blocking(move || repo.append_event(&event)).await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "dropping event, store write failed"),
                    Err(e) => warn!(error = %e, "dropping event, store task failed"),
                }
            }
            debug!("event sink drained");
        });
        (Self { tx }, handle)
    }

    /// Submit an event. Never blocks; if the drain task is gone the event is
    /// silently dropped.
    pub fn record(&self, event: Event) {
        if self.tx.send(event).is_err() {
            debug!("event sink closed, dropping event");
        }
    }
}

/// Await the drain task for at most `grace`, dropping whatever remains.
pub async fn flush(handle: JoinHandle<()>, grace: Duration) {
    if tokio::time::timeout(grace, handle).await.is_err() {
        warn!("event sink did not flush within the grace window");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRepository;

    #[tokio::test]
    async fn events_reach_the_repository() {
        let repo = Arc::new(MemoryRepository::new());
        let (sink, handle) = EventSink::spawn(repo.clone());

        sink.record(Event::new("dev-1", "203.0.113.9", RequestKind::List, None));
        sink.record(Event::new(
            "dev-1",
            "203.0.113.9",
            RequestKind::Connect,
            Some(2),
        ));
        drop(sink);
        flush(handle, Duration::from_secs(1)).await;

        let events = repo.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].request, RequestKind::List);
        assert_eq!(events[1].target_service, Some(2));
        assert!(events[0].timestamp.contains('T'));
    }

    #[tokio::test]
    async fn store_failures_are_dropped_silently() {
        let repo = Arc::new(MemoryRepository::new());
        repo.fail_event_writes(true);
        let (sink, handle) = EventSink::spawn(repo.clone());

        sink.record(Event::new("dev-1", "203.0.113.9", RequestKind::List, None));
        drop(sink);
        flush(handle, Duration::from_secs(1)).await;

        assert!(repo.events().is_empty());
    }
}
