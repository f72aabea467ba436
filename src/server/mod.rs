//! Server mode - runs when invoked as `courier serve`
//!
//! One task per connection reads frames and drives a [`Session`]; a second
//! task drains that connection's outbound queue to the socket so pushes from
//! other sessions never interleave with a frame being written.

pub mod registry;
pub mod session;

pub use registry::{PeerHandle, Registry};
pub use session::Session;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::{read_frame, write_frame, Frame};
use crate::store::Store;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Shared by every connection of one server.
pub struct ServerState {
    pub config: ServerConfig,
    pub store: Arc<dyn Store>,
    pub registry: Registry,
    next_conn_id: AtomicU64,
}

impl ServerState {
    pub fn new(mut config: ServerConfig, store: Arc<dyn Store>) -> Self {
        config.storage_dir = expand_tilde(&config.storage_dir);
        Self {
            config,
            store,
            registry: Registry::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Where uploads are written until they complete.
    pub fn staging_dir(&self) -> PathBuf {
        self.config.storage_dir.join("incoming")
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Expand tilde (~) in paths to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub async fn bind(config: ServerConfig, store: Arc<dyn Store>) -> Result<Self> {
        let listener = TcpListener::bind(&config.bind).await?;
        let state = Arc::new(ServerState::new(config, store));
        tokio::fs::create_dir_all(state.staging_dir()).await?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> Arc<ServerState> {
        self.state.clone()
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<()> {
        info!(addr = %self.local_addr()?, "listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, "set_nodelay failed: {}", e);
            }
            let state = self.state.clone();
            tokio::spawn(handle_connection(stream, peer.to_string(), state));
        }
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            res = self.run() => res,
            _ = shutdown => {
                info!("shutting down");
                Ok(())
            }
        }
    }
}

/// Drive one connection until EOF, a malformed frame, or a dead socket.
pub async fn handle_connection<S>(stream: S, peer: String, state: Arc<ServerState>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn_id = state.next_conn_id();
    let span = info_span!("conn", id = conn_id, peer = %peer);

    async move {
        debug!("connected");
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<Frame>(state.config.outbound_queue);

        let writer_task = tokio::spawn(
            async move {
                while let Some(frame) = rx.recv().await {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        warn!("write failed: {}", e);
                        break;
                    }
                }
                let _ = writer.shutdown().await;
            }
            .in_current_span(),
        );

        let mut session = Session::new(conn_id, state, tx.clone());
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(frame)) => match session.handle_frame(frame).await {
                    Ok(()) => {}
                    Err(e) if e.is_connection_fatal() => {
                        debug!("session ended: {}", e);
                        break;
                    }
                    Err(e) => warn!("frame dropped: {}", e),
                },
                Ok(None) => {
                    debug!("peer closed");
                    break;
                }
                Err(e) => {
                    warn!("{}", e);
                    let _ = tx.send(Frame::error("", e.to_string())).await;
                    break;
                }
            }
        }

        // Drops the registry entry and any half-finished upload; the writer
        // stops once every sender is gone.
        drop(session);
        drop(tx);
        let _ = writer_task.await;
        debug!("disconnected");
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        let plain = Path::new("/var/lib/courier");
        assert_eq!(expand_tilde(plain), plain);
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/blobs")), home.join("blobs"));
        }
    }
}
