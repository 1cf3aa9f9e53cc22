/*
The telemetry loop: pairs the one-wire probes discovered at startup with
one authenticated hub session each, then repeatedly reads every probe
and reports the result until interrupted.

Lifecycle is STARTING -> RUNNING -> DRAINING -> STOPPED. A startup
invariant violation skips RUNNING and goes straight to draining with the
fatal error carried out; an interrupt observed at the top of a cycle
triggers the same drain gracefully.
*/

mod report;
mod session;

use thiserror::Error;
use tokio::sync::watch::Receiver;
use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::hub::device::DeviceClient;
use crate::sensor::{self, Probe, SensorError};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Sensor(#[from] SensorError),

    #[error("all devices failed to authenticate")]
    NoSessions,

    #[error("{sessions} connected device client(s) for {probes} physical probe(s)")]
    ProbeMismatch { sessions: usize, probes: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// One probe wired to the session that reports for it. The table is
/// built once at startup and never changes while running.
struct Assignment {
    probe: Probe,
    client: DeviceClient,
}

/// Run the telemetry loop until `shutdown` flips or a fatal startup
/// condition aborts it. Every session opened along the way is closed
/// before this returns, on every path.
#[instrument(name = "agent", skip_all, err)]
pub async fn start(config: Config, mut shutdown: Receiver<bool>) -> Result<(), AgentError> {
    debug!(state = ?State::Starting, "discovering probes");

    let probes = sensor::discover(&config.sensor.base_dir).await?;
    info!("discovered {} probe(s)", probes.len());

    let clients = session::connect_all(&config).await;

    if let Err(e) = check_startup(clients.len(), probes.len()) {
        debug!(state = ?State::Draining, "fatal startup condition");
        session::drain(clients).await;
        return Err(e);
    }

    // Probes are in id order and sessions in configuration order, so the
    // pairing is stable across restarts.
    let mut assignments: Vec<_> = probes
        .into_iter()
        .zip(clients)
        .map(|(probe, client)| Assignment { probe, client })
        .collect();
    for assignment in &assignments {
        info!(
            probe = %assignment.probe.id,
            device = %assignment.client.device_id(),
            "probe assigned"
        );
    }

    debug!(state = ?State::Running, "entering telemetry loop");
    info!(
        "reporting every {:?}, press ctrl-c to exit",
        config.poll_interval
    );

    while !*shutdown.borrow_and_update() {
        for assignment in assignments.iter_mut() {
            match sensor::read(&assignment.probe, &config.sensor.poll).await {
                Some(reading) => report::publish(&mut assignment.client, &reading).await,
                None => debug!(probe = %assignment.probe.id, "no reading this cycle"),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.poll_interval) => {}
            changed = shutdown.changed() => {
                // a closed channel means the controller is gone; drain
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!(state = ?State::Draining, "draining sessions");
    session::drain(assignments.into_iter().map(|a| a.client).collect()).await;

    debug!(state = ?State::Stopped, "telemetry loop stopped");
    Ok(())
}

/// Both startup invariants, checked independently: no sessions at all,
/// and a session count that does not match the probe count, are each
/// fatal on their own.
fn check_startup(sessions: usize, probes: usize) -> Result<(), AgentError> {
    if sessions == 0 {
        return Err(AgentError::NoSessions);
    }
    if sessions != probes {
        return Err(AgentError::ProbeMismatch { sessions, probes });
    }
    Ok(())
}
