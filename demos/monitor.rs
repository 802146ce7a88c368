//! Robot telemetry monitor
//!
//! Connects to a robot, prints its identity, follows the command queue and
//! reports link statistics.
//!
//! ```bash
//! # Simulated robot
//! cargo run --example monitor -- test
//!
//! # WiFi robot, watch for 30 seconds
//! cargo run --example monitor -- wifi 192.168.86.41 30
//!
//! # USB serial, auto-detected port
//! RUST_LOG=martylink=debug cargo run --example monitor -- usb
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use martylink::{Marty, QueueStatus, Request, TopicId};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("martylink=info".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let method = args.next().unwrap_or_else(|| "test".to_string());
    let locator = args.next().unwrap_or_default();
    let seconds: u64 = match args.next() {
        Some(s) => s.parse().context("watch duration must be whole seconds")?,
        None => 5,
    };

    println!("Connecting via {method} {locator}...");
    let marty = Marty::connect(&method, &locator).await.context("failed to connect")?;
    println!("Connected to {} ({:?})", marty.locator(), marty.dialect());

    let version = marty.request(Request::rest("v")).await?.check()?;
    println!("Robot: {}", version.json()?);

    let status_count = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&status_count);
    let handle = marty.subscribe(TopicId::ROBOT_STATUS, move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    let mut states = marty.link_states();
    tokio::spawn(async move {
        while let Some(state) = states.next().await {
            println!("link: {state:?}");
        }
    });

    let mut sampled = Box::pin(marty.subscribe_sampled(TopicId::ROBOT_STATUS, Duration::from_secs(1)));
    let watch = async {
        while sampled.next().await.is_some() {
            match marty.current_queue_state() {
                QueueStatus::Known(q) => {
                    println!("queue: {} queued, moving={} paused={}", q.work_q_count, q.is_moving, q.is_paused)
                }
                QueueStatus::Unknown => println!("queue: unknown"),
            }
        }
    };
    let _ = tokio::time::timeout(Duration::from_secs(seconds), watch).await;

    marty.unsubscribe(handle);
    println!();
    println!("status reports: {}", status_count.load(Ordering::Relaxed));
    println!("publish rates: {:?}", marty.publish_rates());
    println!("link stats: {:#?}", marty.stats());

    marty.close().await?;
    Ok(())
}
