//! Test Image Client
//!
//! Sends an image file to the classifier service over NATS and prints the reply.
//!
//! Usage: send_image <image-path> [nats-url] [subject] [repeat]

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("send_image=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(image_path) = args.get(1) else {
        anyhow::bail!("usage: send_image <image-path> [nats-url] [subject] [repeat]");
    };
    let nats_url = args.get(2).map(|s| s.as_str()).unwrap_or("nats://localhost:4222");
    let subject = args.get(3).map(|s| s.as_str()).unwrap_or("spotr.predict");
    let repeat: u32 = args.get(4).and_then(|s| s.parse().ok()).unwrap_or(1);

    let image = std::fs::read(image_path)
        .with_context(|| format!("Failed to read image {}", image_path))?;
    info!(
        path = %image_path,
        bytes = image.len(),
        subject = %subject,
        repeat,
        "Sending image"
    );

    // First request may include a full model load
    let client = async_nats::ConnectOptions::new()
        .request_timeout(Some(Duration::from_secs(120)))
        .connect(nats_url)
        .await
        .with_context(|| format!("Failed to connect to NATS at {}", nats_url))?;

    for i in 0..repeat {
        let started = Instant::now();
        match client.request(subject.to_string(), image.clone().into()).await {
            Ok(reply) => {
                let body: serde_json::Value = serde_json::from_slice(&reply.payload)?;
                info!(
                    attempt = i + 1,
                    round_trip_ms = started.elapsed().as_millis() as u64,
                    "Reply received"
                );
                println!("{}", serde_json::to_string_pretty(&body)?);
            }
            Err(e) => warn!(attempt = i + 1, error = %e, "Request failed"),
        }
    }

    Ok(())
}
