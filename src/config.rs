use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cli::{AgentArgs, FleetArgs};
use crate::hub::credentials::{
    discover_x509, ConnectionString, CredentialsError, DeviceCredentials, ServiceConnectionString,
};
use crate::hub::device::SessionConfig;
use crate::sensor::PollSettings;
use crate::util::http::{InvalidUriError, Uri};
use crate::util::types::DeviceId;

/// Lifetime of minted shared-access signatures. Long enough to not churn
/// on every poll cycle, short enough that a leaked token ages out.
const SAS_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Credentials(#[from] CredentialsError),

    #[error("invalid hub endpoint: {0}")]
    Endpoint(#[from] InvalidUriError),

    #[error("no device credentials configured")]
    NoDevices,

    #[error("certificate devices need an explicit hub endpoint")]
    MissingEndpoint,
}

/// One configured device: its credential material and the hub endpoint
/// its session talks to.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub credentials: DeviceCredentials,
    pub endpoint: Uri,
}

/// Everything the agent needs, assembled once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub devices: Vec<DeviceEntry>,
    pub session: SessionConfig,
    pub sensor: SensorConfig,
    /// Delay between telemetry cycles.
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct SensorConfig {
    pub base_dir: PathBuf,
    pub poll: PollSettings,
}

impl Config {
    pub fn from_args(args: AgentArgs) -> Result<Self, ConfigError> {
        let mut devices = Vec::new();

        if let Some(cert_dir) = &args.cert_dir {
            // certificates carry no host, so an explicit endpoint is required
            let endpoint = args
                .hub_endpoint
                .clone()
                .ok_or(ConfigError::MissingEndpoint)?;
            for credentials in discover_x509(cert_dir, args.cert_pass.as_deref())? {
                devices.push(DeviceEntry {
                    credentials: DeviceCredentials::X509(credentials),
                    endpoint: endpoint.clone(),
                });
            }
        }

        for raw in &args.connection_string {
            let credentials: ConnectionString = raw.parse()?;
            let endpoint = match &args.hub_endpoint {
                Some(endpoint) => endpoint.clone(),
                None => format!("https://{}", credentials.hostname).try_into()?,
            };
            devices.push(DeviceEntry {
                credentials: DeviceCredentials::ConnectionString(credentials),
                endpoint,
            });
        }

        if devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        Ok(Self {
            devices,
            session: SessionConfig {
                timeout: args.request_timeout,
                min_interval: args.request_min_interval,
                // long outages degrade to at most one attempt per cycle
                max_backoff: args.poll_interval,
                max_attempts: args.request_max_attempts,
                desired_poll_interval: args.desired_poll_interval,
                sas_ttl: SAS_TTL,
            },
            sensor: SensorConfig {
                base_dir: args.sensor_dir,
                poll: PollSettings {
                    retry_delay: args.sensor_retry_delay,
                    max_retries: args.sensor_max_retries,
                },
            },
            poll_interval: args.poll_interval,
        })
    }
}

/// Configuration for the one-shot fleet command.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub endpoint: Uri,
    pub credentials: ServiceConnectionString,
    pub devices: Vec<DeviceId>,
    pub region: String,
    pub plant: String,
    pub request_timeout: Duration,
    pub sas_ttl: Duration,
}

impl FleetConfig {
    pub fn from_args(args: FleetArgs) -> Result<Self, ConfigError> {
        let credentials: ServiceConnectionString = args.service_connection_string.parse()?;
        let endpoint = match args.hub_endpoint {
            Some(endpoint) => endpoint,
            None => format!("https://{}", credentials.hostname).try_into()?,
        };

        Ok(Self {
            endpoint,
            credentials,
            devices: args.device.into_iter().map(DeviceId::from).collect(),
            region: args.region,
            plant: args.plant,
            request_timeout: args.request_timeout,
            sas_ttl: SAS_TTL,
        })
    }
}
