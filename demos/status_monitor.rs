use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::time::{interval, Instant};
use tracing::{error, info, warn};
use mowerlink::{Category, ConnectionState, JsonCodec, MowerDevice, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("📊 mowerlink Status Monitor Example");
    info!("Searching for mowers...");

    let mower = match MowerDevice::connect_first(Arc::new(JsonCodec)).await {
        Ok(device) => {
            info!("✅ Found: {}", device.device_info());
            device
        }
        Err(e) => {
            error!("❌ No mower found: {}", e);
            return Err(e);
        }
    };

    info!("🔍 Starting status monitoring...");
    info!("Press Ctrl+C to stop monitoring");

    // Print every change the store publishes
    let mut changes = mower.subscribe();
    let printer = tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let snapshot = changes.borrow_and_update().clone();
            println!("\n📊 Revision {}", snapshot.revision);
            for category in Category::ALL {
                if let Some(groups) = snapshot.category(category) {
                    for (group, value) in groups {
                        println!("  {category}.{group}: {value}");
                    }
                }
            }
        }
    });

    let start_time = Instant::now();
    let mut poll = interval(Duration::from_secs(15));
    let mut failures = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = poll.tick() => {}
        }

        match mower.command("get_report_info", json!({})).await {
            Ok(_) => failures = 0,
            Err(e) if e.is_recoverable() || e.is_transport_error() => {
                failures += 1;
                warn!("⚠️  Poll failed ({} in a row): {}", failures, e);
                if failures >= 3 {
                    error!("❌ Giving up after {} failures", failures);
                    break;
                }
            }
            Err(e) => {
                error!("❌ {}", e);
                break;
            }
        }

        // Between polls the idle timer closes the link
        if mower.state().await == ConnectionState::Disconnected {
            info!("💤 Link idle");
        }
    }

    info!("🔌 Disconnecting...");
    mower.disconnect().await;
    printer.abort();

    let elapsed = start_time.elapsed();
    println!("\n📊 Final Summary:");
    println!(
        "  Duration: {:02}:{:02}",
        elapsed.as_secs() / 60,
        elapsed.as_secs() % 60
    );
    println!("  Revisions: {}", mower.snapshot().revision);

    info!("🎉 Status monitoring completed!");
    Ok(())
}
