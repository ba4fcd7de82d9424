//! Control socket
//!
//! The launcher connects here to learn that the process is alive. Nothing
//! is exchanged on accepted connections; they are held until shutdown.

use crate::app::Feature;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct ControlServer {
    path: PathBuf,
    cancel_token: Mutex<Option<CancellationToken>>,
    tasks: TaskTracker,
    connections: Arc<Mutex<Vec<UnixStream>>>,
    accepted: Arc<AtomicU64>,
}

impl ControlServer {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            cancel_token: Mutex::new(None),
            tasks: TaskTracker::new(),
            connections: Arc::new(Mutex::new(Vec::new())),
            accepted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    fn remove_socket_file(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::network_with_source(
                format!("Failed to remove {}", self.path.display()),
                e,
            )),
        }
    }

    fn listen(&self) -> Result<()> {
        let mut cancel_slot = self.cancel_token.lock();
        if cancel_slot.is_some() {
            return Err(Error::internal("control server is already running"));
        }

        // a previous process may have left its socket behind
        self.remove_socket_file()?;
        let listener = UnixListener::bind(&self.path).map_err(|e| {
            Error::network_with_source(format!("Failed to bind {}", self.path.display()), e)
        })?;

        let cancel_token = CancellationToken::new();
        *cancel_slot = Some(cancel_token.clone());

        tracing::info!("Control server listening on {}", self.path.display());

        let connections = self.connections.clone();
        let accepted = self.accepted.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        tracing::info!("Control server accept loop stopped");
                        break;
                    }
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                tracing::debug!("Control connection accepted");
                                accepted.fetch_add(1, Ordering::Relaxed);
                                connections.lock().push(stream);
                            }
                            Err(e) => {
                                if cancel_token.is_cancelled() {
                                    break;
                                }
                                tracing::error!("Failed to accept control connection: {}", e);
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let Some(cancel_token) = self.cancel_token.lock().take() else {
            return Ok(());
        };
        cancel_token.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();

        self.connections.lock().clear();
        self.remove_socket_file()
    }
}

#[async_trait]
impl Feature for ControlServer {
    fn name(&self) -> &'static str {
        "control server"
    }

    async fn start(&self) -> Result<()> {
        self.listen()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    async fn wait_for_connections(server: &ControlServer, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.connection_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_accepts_and_holds_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpn.sock");
        let server = ControlServer::new(&path);
        server.start().await.unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        let _second = UnixStream::connect(&path).await.unwrap();
        wait_for_connections(&server, 2).await;
        assert_eq!(server.accepted(), 2);

        server.close().await.unwrap();
        assert_eq!(server.connection_count(), 0);
        assert!(!path.exists());

        // the held connection is dropped on close
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpn.sock");
        std::fs::write(&path, b"stale").unwrap();

        let server = ControlServer::new(&path);
        server.start().await.unwrap();
        assert!(server.start().await.is_err());
        UnixStream::connect(&path).await.unwrap();

        server.close().await.unwrap();
        server.close().await.unwrap();

        // can be started again after close
        server.start().await.unwrap();
        server.close().await.unwrap();
    }
}
