use serde_json::json;
use std::{env, sync::Arc, time::Duration};
use tracing::{error, info};
use mowerlink::{
    cloud::GatewayRelay, AppCredentials, CloudConfig, CloudDevice, CloudGateway, CommandCatalog,
    JsonCodec, Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("☁️  mowerlink Cloud Login Example");

    let var = |key: &str| env::var(key).unwrap_or_default();
    let credentials = AppCredentials::new(var("MOWER_APP_KEY"), var("MOWER_APP_SECRET"));
    let country = env::var("MOWER_COUNTRY").unwrap_or_else(|_| "US".to_string());
    let auth_code = var("MOWER_AUTH_CODE");

    let cloud = Arc::new(CloudGateway::new(credentials, CloudConfig::default())?);

    let session = match cloud.establish_session(&country, &auth_code).await {
        Ok(session) => session,
        Err(e) => {
            error!("❌ Login failed: {}", e);
            return Err(e);
        }
    };
    info!("✅ Region {} ({})", session.region.region_id, session.region.mqtt_endpoint);
    info!("  Token valid until {}", session.expires_at);

    let bindings = cloud.list_bindings().await?;
    for binding in &bindings {
        println!(
            "🌱 {} {} ({})",
            binding.iot_id,
            binding.device_name,
            binding.nick_name.as_deref().unwrap_or("unnamed")
        );
    }

    let Some(first) = bindings.first() else {
        info!("No mowers bound to this account");
        return Ok(());
    };

    // Events arrive through the application's broker client via `deliver`
    let relay = Arc::new(GatewayRelay::new(cloud.clone()));
    let mower = CloudDevice::attach(
        first.iot_id.clone(),
        relay,
        Arc::new(JsonCodec),
        CommandCatalog::standard(),
        Duration::from_secs(10),
    )
    .await?;

    info!("📋 Requesting a report from {}...", mower.iot_id());
    match mower.command("get_report_info", json!({})).await {
        Ok(reply) => info!("✅ {:?}", reply),
        Err(e) => error!("❌ {}", e),
    }

    info!("🎉 Done");
    Ok(())
}
