//! Calling side of a connection.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;

use super::{ConnectionCore, Role};
use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::handler::envelope;
use crate::processor_pool::ActiveRequest;

/// Issues calls over one byte stream at a time.
///
/// Cheap to clone; clones share the connection. Up to
/// [`MuxConfig::max_requests`] calls run concurrently, further calls wait for
/// a free request processor.
///
/// # Example
///
/// ```no_run
/// use muxwire::{ClientConnection, MuxConfig};
/// use tokio::net::TcpStream;
///
/// # async fn example() -> muxwire::Result<()> {
/// let client = ClientConnection::new(MuxConfig::default())?;
/// let stream = TcpStream::connect("127.0.0.1:7000").await?;
/// let reader = client.spawn(stream)?;
///
/// let response = client.invoke_rpc(b"hello").await?;
/// println!("{} bytes back", response.len());
///
/// client.stop_async();
/// reader.await.ok();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClientConnection {
    core: Arc<ConnectionCore>,
}

impl ClientConnection {
    /// Create an idle connection. Fails if `config` does not validate.
    pub fn new(config: MuxConfig) -> Result<Self> {
        Ok(Self {
            core: Arc::new(ConnectionCore::new(config)?),
        })
    }

    /// Bind `stream` and run the reader loop on the current task until the
    /// stream ends or the connection is stopped.
    ///
    /// Returns once every in-flight call has been failed and released and the
    /// writer task has exited; the connection is then idle again.
    pub async fn process_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let running = self.core.start(stream)?;
        self.core.run(running, Role::Client).await
    }

    /// Bind `stream` now and run the reader loop on a new task.
    ///
    /// The connection is already running when this returns, so calls made
    /// right afterwards do not fail with [`MuxError::NotConnected`].
    pub fn spawn<S>(&self, stream: S) -> Result<JoinHandle<Result<()>>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let running = self.core.start(stream)?;
        let core = self.core.clone();
        Ok(tokio::spawn(async move { core.run(running, Role::Client).await }))
    }

    /// Send `request` and wait for the complete response.
    ///
    /// Fails with [`MuxError::NotConnected`] when no stream is bound. On any
    /// failure no part of the response is returned.
    ///
    /// After [`MuxError::ReadTimeout`] or [`MuxError::CallTimeout`] the
    /// request ID stays reserved until the late response has been discarded
    /// or [`MuxConfig::late_response_timeout`] runs out, so that response
    /// cannot be delivered to a later call.
    pub async fn invoke_rpc(&self, request: &[u8]) -> Result<Vec<u8>> {
        if !self.core.is_running() {
            return Err(MuxError::NotConnected);
        }

        let mut active = self.core.processors().acquire_outbound().await?;
        let request_id = active.request_id();
        tracing::trace!(request_id, len = request.len(), "invoke");

        let config = self.core.config();
        let result = match config.call_timeout {
            None => active.invoke(request).await,
            Some(limit) => tokio::time::timeout(limit, active.invoke(request))
                .await
                .unwrap_or(Err(MuxError::CallTimeout)),
        };
        match result {
            Err(e @ (MuxError::ReadTimeout | MuxError::CallTimeout)) => {
                tracing::debug!(request_id, error = %e, "call timed out, holding its id");
                tokio::spawn(drain_late_response(active, config.late_response_timeout));
                Err(e)
            }
            other => other,
        }
    }

    /// Call method `method_id` on a [`MethodRegistry`](crate::MethodRegistry) peer.
    pub async fn call<Req, Resp>(&self, method_id: u8, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let message = envelope::encode_request(method_id, request)?;
        let response = self.invoke_rpc(&message).await?;
        envelope::decode_response(method_id, &response)
    }

    /// Stop the current stream. Returns `true` only for the call that
    /// initiated the stop.
    pub fn stop_async(&self) -> bool {
        self.core.stop_async()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Calls currently holding a request processor.
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

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("running", &self.is_running())
            .field("active_requests", &self.active_requests())
            .finish()
    }
}

/// Keep a timed-out call's id registered until its response has ended or
/// `limit` has passed. Packets arriving meanwhile are discarded here instead
/// of reaching the next call that would otherwise get this id.
async fn drain_late_response(mut active: ActiveRequest, limit: Duration) {
    let request_id = active.request_id();
    let stream = active.processor_mut().stream_mut();
    let drained = tokio::time::timeout(limit, async {
        loop {
            match stream.read_to_end().await {
                Err(MuxError::ReadTimeout) => continue,
                other => return other,
            }
        }
    })
    .await;

    match drained {
        Ok(Ok(late)) => tracing::debug!(request_id, len = late.len(), "discarded late response"),
        Ok(Err(e)) => tracing::debug!(request_id, error = %e, "late response never completed"),
        Err(_) => tracing::debug!(request_id, "no late response, releasing id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invoke_without_stream() {
        let client = ClientConnection::new(MuxConfig::default()).unwrap();
        assert!(!client.is_running());
        assert!(matches!(
            client.invoke_rpc(b"hello").await,
            Err(MuxError::NotConnected)
        ));
        assert!(!client.stop_async());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = ClientConnection::new(MuxConfig::default().packet_capacity(0));
        assert!(matches!(result, Err(MuxError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_spawn_is_running_immediately() {
        let client = ClientConnection::new(MuxConfig::default()).unwrap();
        let (stream, peer) = tokio::io::duplex(1024);
        let reader = client.spawn(stream).unwrap();
        assert!(client.is_running());

        drop(peer);
        reader.await.unwrap().unwrap();
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn test_call_timeout() {
        let config = MuxConfig::default().call_timeout(Duration::from_millis(50));
        let client = ClientConnection::new(config).unwrap();
        // Peer never answers.
        let (stream, _peer) = tokio::io::duplex(64 * 1024);
        let reader = client.spawn(stream).unwrap();

        let result = client.invoke_rpc(b"anyone there?").await;
        assert!(matches!(result, Err(MuxError::CallTimeout)));

        assert!(client.stop_async());
        reader.await.unwrap().unwrap();
        assert_eq!(client.active_requests(), 0);
        assert_eq!(client.packets_in_use(), 0);
    }

    #[tokio::test]
    async fn test_read_timeout_holds_id_until_late_response_ends() {
        use crate::protocol::{FragmentType, Packet, HEADER_SIZE};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let config = MuxConfig::default()
            .read_timeout(Duration::from_millis(50))
            .late_response_timeout(Duration::from_secs(5));
        let client = ClientConnection::new(config).unwrap();
        let (stream, mut peer) = tokio::io::duplex(64 * 1024);
        let reader = client.spawn(stream).unwrap();

        let result = client.invoke_rpc(b"slow").await;
        assert!(matches!(result, Err(MuxError::ReadTimeout)));
        assert_eq!(client.active_requests(), 1);

        let mut request = [0u8; HEADER_SIZE + 4];
        peer.read_exact(&mut request).await.unwrap();
        let mut late = Packet::with_capacity(16);
        late.set_request_id(request[0]);
        late.set_fragment_type(FragmentType::Single);
        late.write_data(b"late");
        peer.write_all(&late.encode()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.active_requests() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("late response releases the id");
        assert!(client.is_running());

        assert!(client.stop_async());
        reader.await.unwrap().unwrap();
        assert_eq!(client.packets_in_use(), 0);
    }
}
