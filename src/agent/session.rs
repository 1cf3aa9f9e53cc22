use tracing::{info, warn};

use crate::config::Config;
use crate::hub::device::DeviceClient;

/// Establish sessions for every configured device, in order.
///
/// A device that fails to authenticate is skipped with a warning --
/// partial success is acceptable here; the caller resolves the final
/// count against the startup invariants.
pub async fn connect_all(config: &Config) -> Vec<DeviceClient> {
    let mut clients = Vec::with_capacity(config.devices.len());
    for entry in &config.devices {
        let device_id = entry.credentials.device_id();
        info!(device = %device_id, "connecting to {}", entry.endpoint);
        match DeviceClient::connect(&entry.endpoint, &entry.credentials, &config.session).await {
            Ok(client) => clients.push(client),
            Err(e) => warn!(device = %device_id, "could not authenticate or find device: {e}"),
        }
    }
    clients
}

/// Close every session exactly once.
///
/// Individual close failures are swallowed inside [DeviceClient::close];
/// draining always runs to completion.
pub async fn drain(clients: Vec<DeviceClient>) {
    for client in clients {
        client.close().await;
    }
}
