use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info};

use crate::config::FleetConfig;
use crate::hub::registry::Registry;
use crate::hub::twin::TwinPatch;
use crate::util::types::DeviceId;

/// Temperature ceiling pushed to every twin's desired properties.
const MAX_TEMPERATURE: i64 = 30;

/// Query result cap; there is no pagination.
const QUERY_PAGE_SIZE: u32 = 100;

/// Grace period between patching and querying so the hub's query index
/// catches up with the twin updates.
const QUERY_SETTLE: Duration = Duration::from_secs(1);

/// One-shot fleet maintenance.
///
/// Tags every listed twin with its plant location and a desired
/// temperature ceiling, using the twin's concurrency token so a
/// concurrent writer surfaces as an error instead of being overwritten.
/// Then runs the two read-only location queries and prints the matches.
pub async fn run(config: FleetConfig) -> Result<()> {
    let registry = Registry::new(
        config.endpoint.clone(),
        &config.credentials,
        config.request_timeout,
        config.sas_ttl,
    );

    let tags = json!({
        "location": {
            "region": config.region,
            "plant": config.plant,
        }
    });
    let desired = json!({ "maxTemperature": MAX_TEMPERATURE });

    for device_id in &config.devices {
        info!(device = %device_id, "fetching twin");
        let twin = registry
            .get_twin(device_id)
            .await
            .with_context(|| format!("failed to fetch twin for {device_id}"))?;
        debug!(
            device = %twin.device_id,
            "twin at etag {}: tags {}, desired {}, reported {}",
            twin.etag,
            twin.tags,
            twin.properties.desired,
            twin.properties.reported,
        );

        info!(device = %device_id, "updating tags and desired properties");
        let patch = TwinPatch::new(tags.clone(), desired.clone());
        registry
            .update_twin(device_id, &patch, &twin.etag)
            .await
            .with_context(|| format!("failed to update twin for {device_id}"))?;
    }

    tokio::time::sleep(QUERY_SETTLE).await;

    let in_plant = registry
        .query(
            &format!(
                "SELECT * FROM devices WHERE tags.location.plant = '{}'",
                config.plant
            ),
            QUERY_PAGE_SIZE,
        )
        .await
        .context("plant query failed")?;
    println!("Devices in {} plant: {}", config.plant, join(&in_plant));

    let on_wifi = registry
        .query(
            &format!(
                "SELECT * FROM devices WHERE tags.location.plant = '{}' \
                 AND properties.reported.connectivity = 'WiFi'",
                config.plant
            ),
            QUERY_PAGE_SIZE,
        )
        .await
        .context("connectivity query failed")?;
    println!(
        "Devices in {} plant using WiFi network: {}",
        config.plant,
        join(&on_wifi)
    );

    Ok(())
}

fn join(ids: &[DeviceId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
