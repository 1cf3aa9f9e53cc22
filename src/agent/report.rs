use tracing::{info, warn};

use crate::hub::device::DeviceClient;
use crate::hub::twin::ReportedPatch;
use crate::sensor::Reading;

/// Publish one reading as a reported-property patch and as a telemetry
/// event carrying the same payload.
///
/// The two operations are independent and both best-effort: a failure is
/// logged and the loop moves on. The transport already retried transient
/// errors within its attempt budget, so whatever arrives here is final
/// for this cycle.
pub async fn publish(client: &mut DeviceClient, reading: &Reading) {
    let patch = ReportedPatch::from(reading);
    info!(
        device = %client.device_id(),
        "temperature(C): {:.3}, temperature(F): {:.3}",
        reading.celsius,
        reading.fahrenheit,
    );

    if let Err(e) = client.patch_reported(&patch).await {
        warn!(device = %client.device_id(), "reported-property patch failed: {e}");
    }

    if let Err(e) = client.send_telemetry(&patch).await {
        warn!(device = %client.device_id(), "telemetry publish failed: {e}");
    }
}
