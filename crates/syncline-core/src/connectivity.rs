//! Online/offline signal sources the coordinator subscribes to.

use std::time::Duration;

use reqwest::Client;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::error::SyncError;

/// Something that can report connectivity changes.
///
/// The receiver holds the current state (`true` = online) and wakes on
/// every change.
pub trait ConnectivitySource: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Connectivity driven explicitly by the host (platform events, tests).
#[derive(Debug)]
pub struct ManualConnectivity {
    tx: watch::Sender<bool>,
}

impl ManualConnectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx }
    }

    /// Publish a new state. Repeating the current state wakes nobody.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }
}

impl ConnectivitySource for ManualConnectivity {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Polls a health URL and reports whether the backend answers at all.
///
/// Any HTTP response counts as online; only transport failures count as
/// offline. Polling stops when the checker is dropped.
pub struct HttpHealthCheck {
    tx: watch::Sender<bool>,
    task: AbortHandle,
}

impl HttpHealthCheck {
    /// Start polling `url` every `interval`. Must be called inside a tokio runtime.
    pub fn spawn(url: &str, interval: Duration) -> Result<Self, SyncError> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| SyncError::InvalidAction(format!("invalid health check URL {}: {}", url, e)))?;
        let client = Client::builder().timeout(interval.max(Duration::from_secs(1))).build()?;
        let (tx, _) = watch::channel(false);

        let poll_tx = tx.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
            loop {
                ticker.tick().await;
                let online = client.head(url.clone()).send().await.is_ok();
                debug!(url = %url, online, "Connectivity check");
                poll_tx.send_if_modified(|current| {
                    if *current == online {
                        false
                    } else {
                        info!(online, "Connectivity changed");
                        *current = online;
                        true
                    }
                });
            }
        })
        .abort_handle();

        Ok(Self { tx, task })
    }
}

impl ConnectivitySource for HttpHealthCheck {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Drop for HttpHealthCheck {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_manual_connectivity_notifies_on_change_only() {
        let source = ManualConnectivity::new(false);
        let mut rx = source.subscribe();
        assert!(!*rx.borrow_and_update());

        source.set_online(false);
        assert!(!rx.has_changed().unwrap());

        source.set_online(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(source.is_online());
    }

    #[tokio::test]
    async fn test_http_check_rejects_bad_url() {
        assert!(HttpHealthCheck::spawn("::nope::", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_http_check_follows_server_reachability() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                        .await;
                });
            }
        });

        let url = format!("http://{}/health", addr);
        let health = HttpHealthCheck::spawn(&url, Duration::from_millis(100)).unwrap();
        let mut rx = health.subscribe();
        assert!(!*rx.borrow_and_update());

        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|online| *online))
            .await
            .expect("server should be reported online")
            .unwrap();

        // Aborting the accept loop drops the listener, so connects are refused
        server.abort();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|online| !*online))
            .await
            .expect("server should be reported offline")
            .unwrap();
    }
}
