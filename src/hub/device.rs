use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::util::http::{Client, InvalidUriError, Uri};
use crate::util::interrupt::Interrupt;
use crate::util::types::DeviceId;

use super::credentials::{CredentialsError, DeviceCredentials};
use super::request::{Auth, Get, GetError, Push, PushError, RequestConfig};
use super::twin::ReportedPatch;

/// Behavior knobs for one device session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Minimum interval between requests on one transport.
    pub min_interval: Duration,
    /// Backoff cap for transient failures.
    pub max_backoff: Duration,
    /// Attempt budget per publish.
    pub max_attempts: u32,
    /// How often the desired-properties watcher re-polls.
    pub desired_poll_interval: Duration,
    /// Lifetime of minted shared-access signatures.
    pub sas_ttl: Duration,
}

impl SessionConfig {
    fn request(&self, auth: Auth) -> RequestConfig {
        RequestConfig {
            timeout: self.timeout,
            min_interval: self.min_interval,
            max_backoff: self.max_backoff,
            max_attempts: self.max_attempts,
            auth,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Credentials(#[from] CredentialsError),

    #[error("invalid hub endpoint: {0}")]
    Endpoint(#[from] InvalidUriError),

    #[error("failed to build http client: {0}")]
    Client(reqwest::Error),

    /// The hub rejected or does not know this device.
    #[error("could not authenticate or find device {device_id}: {source}")]
    Verify {
        device_id: DeviceId,
        source: GetError,
    },
}

/// An authenticated per-device hub session.
///
/// Owns the transports for reported-property patches and telemetry
/// events plus a background watcher logging desired-property changes
/// pushed by the hub. Sessions must be released with [close] on every
/// exit path.
///
/// [close]: DeviceClient::close
pub struct DeviceClient {
    device_id: DeviceId,
    reported: Push,
    telemetry: Push,
    disconnect: Push,
    watcher: Option<Watcher>,
}

struct Watcher {
    task: JoinHandle<()>,
    interrupt: Interrupt,
}

impl DeviceClient {
    /// Establish a session: build the authenticated client, verify the
    /// credentials with an initial desired-properties fetch, and start
    /// the watcher.
    pub async fn connect(
        endpoint: &Uri,
        credentials: &DeviceCredentials,
        config: &SessionConfig,
    ) -> Result<Self, ConnectError> {
        let device_id = credentials.device_id().clone();

        let (client, auth) = match credentials {
            DeviceCredentials::X509(x509) => {
                let identity = x509.identity()?;
                let inner = reqwest::Client::builder()
                    .identity(identity)
                    .build()
                    .map_err(ConnectError::Client)?;
                (
                    Client::from_reqwest(inner, Some(config.timeout)),
                    Auth::Identity,
                )
            }
            DeviceCredentials::ConnectionString(cs) => (
                Client::new(Some(config.timeout)),
                Auth::Sas {
                    resource: format!("{}/twins/{}", cs.hostname, device_id),
                    key: cs.shared_access_key.clone(),
                    policy: None,
                    ttl: config.sas_ttl,
                },
            ),
        };

        let twin_path = |leaf: &str| {
            Uri::from_parts(
                endpoint.clone(),
                &format!("/twins/{device_id}{leaf}"),
                None,
            )
        };

        let mut desired = Get::new(
            client.clone(),
            twin_path("/properties/desired")?,
            config.request(auth.clone()),
        );
        let reported = Push::patch(
            client.clone(),
            twin_path("/properties/reported")?,
            config.request(auth.clone()),
        );
        let telemetry = Push::post(
            client.clone(),
            twin_path("/messages/events")?,
            config.request(auth.clone()),
        )
        .content_type("application/json; charset=utf-8");

        // single attempt: draining must never hang on a dying hub
        let disconnect = Push::post(
            client,
            twin_path("/disconnect")?,
            RequestConfig {
                max_attempts: 1,
                ..config.request(auth)
            },
        );

        // The fetch doubles as the authentication handshake: a rejected
        // certificate or signature surfaces here, before the session is
        // considered established. It also seeds the watcher's etag.
        let initial = desired.get(None).await.map_err(|source| ConnectError::Verify {
            device_id: device_id.clone(),
            source,
        })?;
        if let Some(value) = initial.value {
            debug!(device = %device_id, "initial desired properties: {value}");
        }

        let interrupt = Interrupt::new();
        let task = spawn_watcher(
            device_id.clone(),
            desired,
            config.desired_poll_interval,
            interrupt.clone(),
        );

        info!(device = %device_id, "session established");

        Ok(Self {
            device_id,
            reported,
            telemetry,
            disconnect,
            watcher: Some(Watcher { task, interrupt }),
        })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Update the twin's reported properties.
    pub async fn patch_reported(&mut self, patch: &ReportedPatch) -> Result<(), PushError> {
        // This is probably a bug in the types, it shouldn't really happen
        let body = serde_json::to_value(patch).expect("reported patch serialization failed");
        self.reported.send(&body, None).await
    }

    /// Publish the same payload as a telemetry event, UTF-8 JSON.
    pub async fn send_telemetry(&mut self, patch: &ReportedPatch) -> Result<(), PushError> {
        // This is probably a bug in the types, it shouldn't really happen
        let body = serde_json::to_value(patch).expect("telemetry serialization failed");
        self.telemetry.send(&body, None).await
    }

    /// Release the session: stop the watcher and notify the hub.
    ///
    /// Never fails; a refused disconnect only costs a debug line so
    /// draining always completes.
    pub async fn close(mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.interrupt.trigger();
            if let Err(e) = watcher.task.await {
                debug!(device = %self.device_id, "watcher ended abnormally: {e}");
            }
        }

        if let Err(e) = self.disconnect.send(&json!({}), None).await {
            debug!(device = %self.device_id, "disconnect notification failed: {e}");
        }

        info!(device = %self.device_id, "session closed");
    }
}

fn spawn_watcher(
    device_id: DeviceId,
    mut desired: Get,
    interval: Duration,
    interrupt: Interrupt,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // jitter the interval so a fleet of devices doesn't poll
            // the hub in lockstep
            let jitter_ms = rand::random_range(0..=interval.as_millis() as u64 / 10);
            let next_poll = interval + Duration::from_millis(jitter_ms);

            tokio::select! {
                _ = tokio::time::sleep(next_poll) => {}
                _ = interrupt.wait() => break,
            }

            match desired.get(Some(interrupt.clone())).await {
                Ok(response) if response.modified => {
                    if let Some(patch) = response.value {
                        info!(device = %device_id, "desired properties changed: {patch}");
                    }
                }
                Ok(_) => {}
                Err(GetError::Cancelled) => break,
                Err(e) => warn!(device = %device_id, "desired-properties watch failed: {e}"),
            }
        }
        debug!(device = %device_id, "desired-properties watcher stopped");
    })
}
