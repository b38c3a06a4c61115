//! Typed methods - MsgPack-encoded calls through a `MethodRegistry`.
//!
//! This example demonstrates:
//! - Registering typed handlers by name
//! - Calling them by method ID with `ClientConnection::call`
//! - How handler errors surface on the calling side
//!
//! ```sh
//! cargo run --example methods
//! ```

use muxwire::{ClientConnection, MethodRegistry, MuxConfig, MuxError, ServerConnection};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

#[derive(Serialize, Deserialize, Debug)]
struct Stats {
    count: usize,
    sum: f64,
    mean: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut registry = MethodRegistry::new();
    let stats = registry.register("stats", |values: Vec<f64>| async move {
        if values.is_empty() {
            return Err(MuxError::Handler("no values".to_string()));
        }
        let sum: f64 = values.iter().sum();
        Ok(Stats {
            count: values.len(),
            sum,
            mean: sum / values.len() as f64,
        })
    });
    let reverse = registry.register("reverse", |text: String| async move {
        Ok(text.chars().rev().collect::<String>())
    });

    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = ServerConnection::new(MuxConfig::default(), registry)?;
    let serving = server.spawn(server_io)?;
    let client = ClientConnection::new(MuxConfig::default())?;
    let reading = client.spawn(client_io)?;

    let values: Vec<f64> = (1..=10_000).map(f64::from).collect();
    let result: Stats = client.call(stats, &values).await?;
    println!("stats: {:?}", result);

    let text: String = client.call(reverse, "multiplexed").await?;
    println!("reverse: {}", text);

    match client.call::<_, Stats>(stats, &Vec::<f64>::new()).await {
        Err(MuxError::Remote(reason)) => println!("stats of nothing failed: {}", reason),
        other => println!("unexpected: {:?}", other),
    }

    client.stop_async();
    reading.await??;
    serving.await??;
    Ok(())
}
