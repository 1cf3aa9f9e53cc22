use clap::{Args, Parser, Subcommand};
use std::num::ParseIntError;
use std::path::PathBuf;
use std::time::Duration;

use crate::util::http::Uri;

fn parse_duration(s: &str) -> Result<Duration, ParseIntError> {
    let millis: u64 = s.parse()?;
    Ok(Duration::from_millis(millis))
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)] // read from Cargo.toml
pub struct Cli {
    #[command(flatten)]
    pub agent: AgentArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// One-shot fleet maintenance: tag device twins and run queries
    Fleet(FleetArgs),
}

#[derive(Clone, Debug, Args)]
pub struct AgentArgs {
    /// Hub endpoint URI; defaults to the connection-string host
    #[arg(env = "THERMA_HUB_ENDPOINT", long = "hub-endpoint", value_name = "uri")]
    pub hub_endpoint: Option<Uri>,

    /// Directory with per-device X.509 material, a
    /// <id>-public.pem/<id>-private.pem pair for each device
    #[arg(env = "THERMA_CERT_DIR", long = "cert-dir", value_name = "dir")]
    pub cert_dir: Option<PathBuf>,

    /// Passphrase protecting the private keys in the certificate directory
    #[arg(
        env = "THERMA_CERT_PASS",
        long = "cert-pass",
        value_name = "pass",
        requires = "cert_dir"
    )]
    pub cert_pass: Option<String>,

    /// Device connection strings, comma separated in the environment
    #[arg(
        env = "THERMA_CONNECTION_STRINGS",
        long = "connection-string",
        value_name = "str",
        value_delimiter = ','
    )]
    pub connection_string: Vec<String>,

    /// Base directory scanned for one-wire probes
    #[arg(
        env = "THERMA_SENSOR_DIR",
        long = "sensor-dir",
        value_name = "dir",
        default_value = "/sys/bus/w1/devices"
    )]
    pub sensor_dir: PathBuf,

    /// Delay between telemetry cycles in milliseconds
    #[arg(
        env = "THERMA_POLL_INTERVAL_MS",
        long = "poll-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "15000"
    )]
    pub poll_interval: Duration,

    /// Desired-properties watch interval in milliseconds
    #[arg(
        env = "THERMA_DESIRED_POLL_INTERVAL_MS",
        long = "desired-poll-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "30000"
    )]
    pub desired_poll_interval: Duration,

    /// Hub request timeout in milliseconds
    #[arg(
        env = "THERMA_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "59000"
    )]
    pub request_timeout: Duration,

    /// Rate-limiting interval between hub requests in milliseconds
    #[arg(
        env = "THERMA_REQUEST_MIN_INTERVAL_MS",
        long = "request-min-interval-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "1000"
    )]
    pub request_min_interval: Duration,

    /// Attempts per hub request before a transient failure sticks
    #[arg(
        env = "THERMA_REQUEST_MAX_ATTEMPTS",
        long = "request-max-attempts",
        value_name = "n",
        default_value_t = 3
    )]
    pub request_max_attempts: u32,

    /// Delay between sensor ready-flag re-reads in milliseconds
    #[arg(
        env = "THERMA_SENSOR_RETRY_DELAY_MS",
        long = "sensor-retry-delay-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "200"
    )]
    pub sensor_retry_delay: Duration,

    /// Bound on sensor ready-flag re-reads per cycle
    #[arg(
        env = "THERMA_SENSOR_MAX_RETRIES",
        long = "sensor-max-retries",
        value_name = "n",
        default_value_t = 25
    )]
    pub sensor_max_retries: u32,
}

#[derive(Clone, Debug, Args)]
pub struct FleetArgs {
    /// Service connection string with registry read/write access
    #[arg(
        env = "THERMA_SERVICE_CONNECTION_STRING",
        long = "service-connection-string",
        value_name = "str"
    )]
    pub service_connection_string: String,

    /// Registry endpoint URI; defaults to the connection-string host
    #[arg(env = "THERMA_HUB_ENDPOINT", long = "hub-endpoint", value_name = "uri")]
    pub hub_endpoint: Option<Uri>,

    /// Devices whose twins receive the location tags, comma separated
    /// in the environment
    #[arg(
        env = "THERMA_FLEET_DEVICES",
        long = "device",
        value_name = "id",
        value_delimiter = ',',
        required = true
    )]
    pub device: Vec<String>,

    /// Region written to tags.location
    #[arg(long = "region", value_name = "str", default_value = "BG")]
    pub region: String,

    /// Plant written to tags.location, also used by the queries
    #[arg(long = "plant", value_name = "str", default_value = "Sofia")]
    pub plant: String,

    /// Registry request timeout in milliseconds
    #[arg(
        env = "THERMA_REQUEST_TIMEOUT_MS",
        long = "request-timeout-ms",
        value_name = "ms",
        value_parser = parse_duration,
        default_value = "59000"
    )]
    pub request_timeout: Duration,
}

pub fn parse() -> Cli {
    Parser::parse()
}
