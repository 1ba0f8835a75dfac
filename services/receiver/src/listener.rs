//! TCP accept loop spawning one receive task per camera connection.

use crate::supervisor::ConnectionSupervisor;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Pause after a failed accept so descriptor exhaustion doesn't spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Result of a completed `serve` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    pub connections_accepted: u64,
    /// Whether every connection finished within the grace period
    pub drained: bool,
}

/// Accepts camera connections until its shutdown token is cancelled.
pub struct Listener {
    listener: TcpListener,
    supervisor: Arc<ConnectionSupervisor>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Listener {
    /// Bind a new listening socket.
    pub async fn bind(addr: impl ToSocketAddrs, supervisor: ConnectionSupervisor) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, supervisor))
    }

    /// Use an already bound socket.
    pub fn from_listener(listener: TcpListener, supervisor: ConnectionSupervisor) -> Self {
        Self {
            listener,
            supervisor: Arc::new(supervisor),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Token that stops the accept loop and closes every open connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown, then wait up to `grace` for open
    /// connections to wind down.
    ///
    /// Connections observe the same token, so their sockets are closed from
    /// this side rather than waiting for the next read to fail.
    pub async fn serve(self, grace: Duration) -> ServeSummary {
        let Self {
            listener,
            supervisor,
            shutdown,
            tracker,
        } = self;

        match listener.local_addr() {
            Ok(addr) => info!(%addr, "Listening for camera connections"),
            Err(e) => warn!(error = %e, "Listening on unknown address"),
        }

        let mut connections_accepted = 0u64;

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    connections_accepted += 1;
                    let supervisor = supervisor.clone();
                    let token = shutdown.child_token();
                    tracker.spawn(async move {
                        supervisor.run(stream, peer, token).await;
                    });
                }
                Err(e) => {
                    metrics::counter!("receiver.connections.accept_errors").increment(1);
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        // Stop accepting before waiting on open connections
        drop(listener);
        tracker.close();

        info!(
            open_connections = tracker.len(),
            grace_secs = grace.as_secs_f64(),
            "Listener stopped, waiting for connections to close"
        );

        let drained = tokio::time::timeout(grace, tracker.wait()).await.is_ok();
        if !drained {
            warn!(
                open_connections = tracker.len(),
                "Connections still open after grace period"
            );
        }

        ServeSummary {
            connections_accepted,
            drained,
        }
    }
}
