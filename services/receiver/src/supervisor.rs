//! Per-connection receive loop.
//!
//! Each accepted connection runs `frame codec -> validator -> store` until the
//! peer goes away, the transport fails, or the listener asks it to close.
//! Anything that goes wrong with a single image is logged and the loop moves
//! on to the next frame.

use crate::frame_codec::{FrameError, FrameReader};
use crate::message::ImageMessage;
use crate::store::ImageStore;
use crate::validator::validate;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How a connection's receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Closed locally during shutdown
    Closed,
    /// Peer disconnected or the transport failed
    Dropped,
}

/// Counters for a single connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub frames_received: u64,
    pub bytes_received: u64,
    pub images_persisted: u64,
    pub images_rejected: u64,
    pub frames_malformed: u64,
    pub persist_failures: u64,
}

/// Summary returned when a connection's loop exits.
#[derive(Debug, Clone)]
pub struct ConnectionReport {
    pub peer: SocketAddr,
    pub outcome: ConnectionOutcome,
    pub stats: ConnectionStats,
}

/// Drives the receive loop for connections, sharing one persistence backend.
pub struct ConnectionSupervisor {
    store: Arc<dyn ImageStore>,
    max_frame_bytes: Option<usize>,
}

impl ConnectionSupervisor {
    pub fn new(store: Arc<dyn ImageStore>, max_frame_bytes: Option<usize>) -> Self {
        Self {
            store,
            max_frame_bytes,
        }
    }

    /// Run the receive loop until the stream ends or `shutdown` fires.
    ///
    /// An image that is already being persisted is allowed to finish before
    /// the shutdown signal is observed.
    pub async fn run<S>(&self, stream: S, peer: SocketAddr, shutdown: CancellationToken) -> ConnectionReport
    where
        S: AsyncRead + Unpin,
    {
        info!(%peer, backend = self.store.kind(), "Connection established");
        metrics::counter!("receiver.connections.opened").increment(1);

        let mut reader = FrameReader::new(stream).with_max_frame_len(self.max_frame_bytes);
        let mut stats = ConnectionStats::default();

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break ConnectionOutcome::Closed,
                next = reader.next_message() => next,
            };

            match next {
                Ok(message) => {
                    stats.frames_received += 1;
                    metrics::counter!("receiver.frames.received").increment(1);
                    self.handle_message(message, peer, &mut stats).await;
                }
                Err(e) if !e.is_fatal() => {
                    stats.frames_received += 1;
                    stats.frames_malformed += 1;
                    metrics::counter!("receiver.frames.malformed").increment(1);
                    warn!(%peer, error = %e, "Skipping malformed frame");
                }
                Err(FrameError::Disconnected) => {
                    debug!(%peer, "Peer closed the connection");
                    break ConnectionOutcome::Dropped;
                }
                Err(e) => {
                    warn!(%peer, error = %e, "Connection dropped");
                    break ConnectionOutcome::Dropped;
                }
            }
        };

        stats.bytes_received = reader.bytes_read();
        metrics::counter!("receiver.connections.closed").increment(1);

        info!(
            %peer,
            outcome = ?outcome,
            frames_received = stats.frames_received,
            images_persisted = stats.images_persisted,
            images_rejected = stats.images_rejected,
            frames_malformed = stats.frames_malformed,
            persist_failures = stats.persist_failures,
            "Connection finished"
        );

        ConnectionReport {
            peer,
            outcome,
            stats,
        }
    }

    async fn handle_message(&self, message: ImageMessage, peer: SocketAddr, stats: &mut ConnectionStats) {
        let image = match validate(message) {
            Ok(image) => image,
            Err(rejection) => {
                stats.images_rejected += 1;
                metrics::counter!("receiver.images.rejected").increment(1);
                warn!(%peer, reason = %rejection, "Image rejected");
                return;
            }
        };

        match self.store.persist(&image).await {
            Ok(stored) => {
                stats.images_persisted += 1;
                metrics::counter!("receiver.images.stored").increment(1);
                info!(
                    %peer,
                    location = %stored,
                    size_bytes = image.payload.len(),
                    capture_s = image.capture_seconds,
                    capture_us = image.capture_micros,
                    "Image stored"
                );
            }
            Err(e) => {
                stats.persist_failures += 1;
                metrics::counter!("receiver.images.failed").increment(1);
                error!(%peer, backend = self.store.kind(), error = %e, "Image dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_codec::{encode_frame, encode_raw_frame};
    use crate::message::ImageMetadata;
    use crate::store::{StoreError, StoredImage};
    use crate::validator::CapturedImage;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio_test::io::Builder;

    /// Records persisted payloads and fails whenever the payload says so.
    #[derive(Default)]
    struct RecordingStore {
        persisted: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl ImageStore for RecordingStore {
        fn kind(&self) -> &'static str {
            "recording"
        }

        async fn persist(&self, image: &CapturedImage) -> Result<StoredImage, StoreError> {
            if image.payload.as_ref() == b"fail" {
                return Err(StoreError::PathConflict("conflict".into()));
            }
            let mut persisted = self.persisted.lock().unwrap();
            persisted.push(image.payload.to_vec());
            Ok(StoredImage::Row {
                image_id: persisted.len() as i64,
            })
        }
    }

    fn frame(time_s: i64, payload: Option<&[u8]>) -> Vec<u8> {
        encode_frame(&ImageMessage {
            metadata: Some(ImageMetadata {
                time_s,
                time_us: 0,
                width: 4,
                height: 4,
            }),
            data: payload.map(<[u8]>::to_vec),
        })
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_loop_continues_past_bad_images() {
        let store = Arc::new(RecordingStore::default());
        let supervisor = ConnectionSupervisor::new(store.clone(), None);

        let stream = Builder::new()
            .read(&frame(1, Some(&b"one"[..])))
            .read(&frame(2, None))
            .read(&frame(3, Some(&b""[..])))
            .read(&encode_raw_frame(&[0x0a, 0x05, 0x01]))
            .read(&frame(4, Some(&b"fail"[..])))
            .read(&frame(5, Some(&b"two"[..])))
            .build();

        let report = supervisor.run(stream, peer(), CancellationToken::new()).await;

        assert_eq!(report.outcome, ConnectionOutcome::Dropped);
        assert_eq!(
            report.stats,
            ConnectionStats {
                frames_received: 6,
                bytes_received: report.stats.bytes_received,
                images_persisted: 2,
                images_rejected: 2,
                frames_malformed: 1,
                persist_failures: 1,
            }
        );
        assert!(report.stats.bytes_received > 0);
        assert_eq!(
            *store.persisted.lock().unwrap(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_transport_failure_ends_loop() {
        let store = Arc::new(RecordingStore::default());
        let supervisor = ConnectionSupervisor::new(store.clone(), None);

        let full = frame(1, Some(&b"never completes"[..]));
        let stream = Builder::new().read(&full[..full.len() - 3]).build();

        let report = supervisor.run(stream, peer(), CancellationToken::new()).await;

        assert_eq!(report.outcome, ConnectionOutcome::Dropped);
        assert_eq!(report.stats.images_persisted, 0);
        assert!(store.persisted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_drops_connection() {
        let store = Arc::new(RecordingStore::default());
        let supervisor = ConnectionSupervisor::new(store.clone(), Some(8));

        // The payload is never read, so use a pipe rather than a strict mock
        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(&frame(1, Some(&b"far more than eight bytes"[..])))
            .await
            .unwrap();

        let report = supervisor.run(server, peer(), CancellationToken::new()).await;
        assert_eq!(report.outcome, ConnectionOutcome::Dropped);
        assert_eq!(report.stats.frames_received, 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connection() {
        let store = Arc::new(RecordingStore::default());
        let supervisor = ConnectionSupervisor::new(store, None);

        // Keep the writer half alive so the read blocks forever
        let (_client, server) = tokio::io::duplex(64);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = supervisor.run(server, peer(), shutdown).await;
        assert_eq!(report.outcome, ConnectionOutcome::Closed);
    }
}
