//! Serving side of a connection.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use super::{ConnectionCore, Role};
use crate::config::MuxConfig;
use crate::error::Result;
use crate::handler::Service;

/// Answers calls arriving on one byte stream at a time.
///
/// Every inbound message start on a free request id opens a call; the
/// request is read completely, handed to the [`Service`], and the response
/// is written back under the same id. Calls run concurrently, each on its
/// own task.
///
/// # Example
///
/// ```no_run
/// use muxwire::{service_fn, MuxConfig, ServerConnection};
/// use tokio::net::TcpListener;
///
/// # async fn example() -> muxwire::Result<()> {
/// let listener = TcpListener::bind("127.0.0.1:7000").await?;
/// let (stream, _) = listener.accept().await?;
///
/// let echo = service_fn(|request: Vec<u8>| async move { request });
/// let server = ServerConnection::new(MuxConfig::default(), echo)?;
/// server.process_stream(stream).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ServerConnection {
    core: Arc<ConnectionCore>,
    service: Arc<dyn Service>,
}

impl ServerConnection {
    /// Create an idle connection that answers with `service`.
    pub fn new<S: Service>(config: MuxConfig, service: S) -> Result<Self> {
        Self::with_shared(config, Arc::new(service))
    }

    /// Like [`new`](Self::new), for a service shared between connections.
    pub fn with_shared(config: MuxConfig, service: Arc<dyn Service>) -> Result<Self> {
        Ok(Self {
            core: Arc::new(ConnectionCore::new(config)?),
            service,
        })
    }

    /// Bind `stream` and serve it on the current task until it ends or the
    /// connection is stopped.
    ///
    /// Returns after every inbound call has finished and the writer task has
    /// exited; the connection is then idle again.
    pub async fn process_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let running = self.core.start(stream)?;
        self.core.run(running, Role::Server(self.service.clone())).await
    }

    /// Bind `stream` now and serve it on a new task.
    pub fn spawn<S>(&self, stream: S) -> Result<JoinHandle<Result<()>>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let running = self.core.start(stream)?;
        let core = self.core.clone();
        let role = Role::Server(self.service.clone());
        Ok(tokio::spawn(async move { core.run(running, role).await }))
    }

    /// Stop the current stream. Returns `true` only for the call that
    /// initiated the stop.
    pub fn stop_async(&self) -> bool {
        self.core.stop_async()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Inbound calls currently being served.
    pub fn active_requests(&self) -> usize {
        self.core.active_requests()
    }

    /// Packets currently checked out of the packet pool.
    pub fn packets_in_use(&self) -> usize {
        self.core.packets_in_use()
    }

    pub fn config(&self) -> &MuxConfig {
        self.core.config()
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("running", &self.is_running())
            .field("active_requests", &self.active_requests())
            .finish()
    }
}
