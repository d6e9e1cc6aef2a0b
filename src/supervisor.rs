//! Reconnection supervisor and the external-process service context.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::{ConnectionConfig, HostConnection};

/// Start the background task that keeps `connection` connected.
///
/// The task wakes every poll interval, or immediately when the connection
/// reports a disconnect, and reconnects with `reconnect_interval` between
/// failed attempts. It runs until `cancel` fires.
pub fn spawn_supervisor(connection: Arc<HostConnection>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let poll_interval = connection.config().poll_interval;
        let reconnect_interval = connection.config().reconnect_interval;
        debug!(addr = %connection.addr(), "Reconnection supervisor started");

        loop {
            if !connection.is_connected() {
                let connected = tokio::select! {
                    () = cancel.cancelled() => break,
                    connected = connection.connect() => connected,
                };
                if !connected {
                    debug!(retry_in = ?reconnect_interval, "Host unreachable");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(reconnect_interval) => {}
                    }
                    continue;
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = connection.disconnected() => info!("Host connection dropped; reconnecting"),
                () = tokio::time::sleep(poll_interval) => {}
            }
        }

        debug!("Reconnection supervisor stopped");
    })
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// External-process context: owns the connection manager and its supervisor.
pub struct BridgeService {
    connection: Arc<HostConnection>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl BridgeService {
    pub fn new(addr: impl Into<String>, config: ConnectionConfig) -> Self {
        Self {
            connection: Arc::new(HostConnection::new(addr, config)),
            supervisor: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.addr(), ConnectionConfig::from_config(config))
    }

    pub const fn connection(&self) -> &Arc<HostConnection> {
        &self.connection
    }

    /// Attempt an initial connection and start supervising.
    ///
    /// Returns whether the host is reachable right now. An unreachable host
    /// is not an error; the supervisor keeps retrying. Calling `start` on a
    /// running service does nothing.
    pub async fn start(&self) -> bool {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            return self.connection.is_connected();
        }

        let connected = self.connection.connect().await;
        if connected {
            info!(addr = %self.connection.addr(), "Bridge service started");
        } else {
            warn!(
                addr = %self.connection.addr(),
                "Host not reachable yet; will keep retrying"
            );
        }

        let cancel = CancellationToken::new();
        let handle = spawn_supervisor(Arc::clone(&self.connection), cancel.clone());
        *supervisor = Some(Supervisor { cancel, handle });
        connected
    }

    /// Stop supervising and close the connection. Idempotent.
    pub async fn stop(&self) {
        let supervisor = self.supervisor.lock().await.take();
        if let Some(Supervisor { cancel, handle }) = supervisor {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Supervisor task ended abnormally");
            }
            info!("Bridge service stopped");
        }
        self.connection.disconnect().await;
    }

    pub async fn is_running(&self) -> bool {
        self.supervisor.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::test_support::HostThread;
    use crate::transport::{ConnectionState, Request};
    use std::time::Duration;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            reconnect_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
            recv_buffer_size: 4096,
        }
    }

    /// Reconnection bound plus scheduling slack.
    fn reconnect_bound() -> Duration {
        let config = fast_config();
        config.reconnect_interval + config.connect_timeout + Duration::from_secs(1)
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn wait_for(connection: &HostConnection, wanted: ConnectionState, within: Duration) {
        let mut rx = connection.subscribe();
        let waited = tokio::time::timeout(within, rx.wait_for(|s| *s == wanted)).await;
        let reached = tokio_test::assert_ok!(waited, "state {wanted} not reached");
        let state = tokio_test::assert_ok!(reached, "state channel closed");
        assert_eq!(*state, wanted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn start_connects_and_stop_is_idempotent() {
        let host = HostThread::spawn(0);
        let service = BridgeService::new(host.addr().to_string(), fast_config());

        assert!(service.start().await);
        assert!(service.start().await);
        assert!(service.is_running().await);
        assert!(service.connection().ping(Duration::from_secs(2)).await);

        service.stop().await;
        service.stop().await;
        assert!(!service.is_running().await);
        assert_eq!(service.connection().state(), ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connects_once_host_appears() {
        let port = free_port();
        let service = BridgeService::new(format!("127.0.0.1:{port}"), fast_config());
        assert!(!service.start().await);

        let err = service
            .connection()
            .send_request(Request::Ping, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));

        let _host = HostThread::spawn(port);
        wait_for(service.connection(), ConnectionState::Connected, reconnect_bound()).await;
        assert!(service.connection().ping(Duration::from_secs(2)).await);
        service.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnects_after_host_restart() {
        let host = HostThread::spawn(0);
        let port = host.port();
        let service = BridgeService::new(host.addr().to_string(), fast_config());
        assert!(service.start().await);

        tokio::task::spawn_blocking(move || host.shutdown())
            .await
            .unwrap();
        wait_for(service.connection(), ConnectionState::Disconnected, Duration::from_secs(1)).await;

        let _restarted = HostThread::spawn(port);
        wait_for(service.connection(), ConnectionState::Connected, reconnect_bound()).await;

        let response = service.connection().execute_code("2+3", None).await.unwrap();
        assert!(matches!(
            response,
            crate::transport::Message::Result { success: true, output: Some(ref out), .. } if out == "5"
        ));
        service.stop().await;
    }

    #[tokio::test]
    async fn stop_cancels_pending_retries() {
        let service = BridgeService::new(format!("127.0.0.1:{}", free_port()), fast_config());
        assert!(!service.start().await);

        tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(1), service.stop()).await);
        assert_eq!(service.connection().state(), ConnectionState::Disconnected);
    }
}
