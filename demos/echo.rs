//! Echo over TCP - raw bytes in, raw bytes out.
//!
//! This example demonstrates:
//! - Serving a `ServerConnection` on an accepted TCP stream
//! - Many concurrent `invoke_rpc` calls multiplexed over one socket
//! - Payloads larger than one packet being fragmented and reassembled
//!
//! ```sh
//! RUST_LOG=muxwire=debug cargo run --example echo
//! ```

use std::time::Instant;

use muxwire::{service_fn, ClientConnection, MuxConfig, ServerConnection};
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

const CALLS: usize = 200;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = MuxConfig::default().packet_capacity(1024);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = ServerConnection::new(
        config.clone(),
        service_fn(|request: Vec<u8>| async move { request }),
    )?;
    let serving = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "accepted");
        server.process_stream(stream).await
    });

    let client = ClientConnection::new(config)?;
    let reading = client.spawn(TcpStream::connect(addr).await?)?;

    let started = Instant::now();
    let mut calls = Vec::with_capacity(CALLS);
    for i in 0..CALLS {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let payload = vec![(i % 251) as u8; i * 173];
            let response = client.invoke_rpc(&payload).await?;
            assert_eq!(response, payload);
            Ok::<_, muxwire::MuxError>(payload.len())
        }));
    }

    let mut bytes = 0;
    for call in calls {
        bytes += call.await??;
    }
    println!(
        "{} calls, {} bytes echoed in {:?}",
        CALLS,
        bytes,
        started.elapsed()
    );

    client.stop_async();
    reading.await??;
    serving.await??;
    Ok(())
}
