use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info};
use mowerlink::{JsonCodec, MowerDevice, Result};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("🌱 mowerlink BLE Control Example");
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

    info!("Available commands: {}", mower.catalog().keys().join(", "));

    // The first command opens the link
    info!("📋 Requesting device info...");
    match mower.command("get_device_base_info", json!({})).await {
        Ok(reply) => info!("✅ {:?}", reply),
        Err(e) => error!("❌ Device info failed: {}", e),
    }
    info!("🔗 Link state: {}", mower.state().await);

    info!("🚜 Starting the current job...");
    if let Err(e) = mower.command("start_job", json!({})).await {
        error!("❌ Failed to start: {}", e);
        mower.disconnect().await;
        return Err(e);
    }

    sleep(Duration::from_secs(30)).await;

    info!("⏸️  Pausing...");
    mower.command("pause_execute_task", json!({})).await?;

    sleep(Duration::from_secs(5)).await;

    info!("🏠 Returning to dock...");
    mower.command("return_to_dock", json!({})).await?;

    println!("\n📊 Reported state:");
    println!("{:#}", mower.snapshot().to_json());

    info!("🔌 Disconnecting...");
    mower.disconnect().await;
    info!("🎉 Done");
    Ok(())
}
