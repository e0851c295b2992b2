//! A demonstration analysis: pulls the latest chunks, keeps reads whose median
//! current dropped far enough and optionally ejects the rest.
//!
//! It does nothing scientifically useful. It exists to exercise the client
//! the way a real analysis would.

use super::{config::AnalysisConfig, telemetry};
use core::time::Duration;
use read_until::{Client, Error, Transport, WorkUnit};
use std::sync::Arc;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Enough data; ask the server to stop sending more of the read.
    Keep,
    /// Reverse the channel for `duration` to eject the read.
    Eject { duration: Duration },
    Undecided,
}

pub fn decide(unit: &WorkUnit, config: &AnalysisConfig) -> Decision {
    let stats = &unit.stats;
    if stats.median_before > stats.median && stats.median_before - stats.median > config.median_drop
    {
        Decision::Keep
    } else {
        config
            .unblock
            .map_or(Decision::Undecided, |duration| Decision::Eject { duration })
    }
}

/// What a worker did before it exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub units: u64,
    pub kept: u64,
    pub ejected: u64,
    pub rejected: u64,
}

/// Starts `config.workers` analysis loops against `client`.
pub fn spawn_workers<T: Transport>(
    client: &Arc<Client<T>>,
    config: &AnalysisConfig,
    token: &CancellationToken,
) -> Vec<JoinHandle<WorkerReport>> {
    (0..config.workers)
        .map(|_id| {
            let fut = run(Arc::clone(client), config.clone(), token.clone());

            #[cfg(feature = "tracing")]
            let fut = {
                use tracing::Instrument;
                fut.instrument(tracing::info_span!("analysis", worker = _id))
            };

            tokio::spawn(fut)
        })
        .collect()
}

async fn run<T: Transport>(
    client: Arc<Client<T>>,
    config: AnalysisConfig,
    token: CancellationToken,
) -> WorkerReport {
    let mut report = WorkerReport::default();

    #[cfg(feature = "tracing")]
    tracing::info!("Starting analysis in {:?}", config.delay);

    tokio::select! {
        biased;
        () = token.cancelled() => return report,
        () = tokio::time::sleep(config.delay) => {}
    }

    while client.is_running() {
        let started = Instant::now();

        let units = client.get_units();
        report.units += units.len() as u64;
        telemetry::increment_units_analysed(units.len() as u64);

        for (channel, unit) in units {
            let requested = match decide(&unit, &config) {
                Decision::Keep => client
                    .stop_receiving(channel, unit.item_number)
                    .map(|_| {
                        report.kept += 1;
                        telemetry::increment_decisions("stop_further_data");
                    }),
                Decision::Eject { duration } => client
                    .unblock(channel, unit.item_number, duration)
                    .map(|_| {
                        report.ejected += 1;
                        telemetry::increment_decisions("unblock");
                    }),
                Decision::Undecided => Ok(()),
            };

            match requested {
                Ok(()) => {}
                Err(Error::NotRunning) => break,
                Err(_e) => {
                    report.rejected += 1;
                    telemetry::increment_rejected_requests();
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Action for channel {channel} rejected: {_e}");
                }
            }
        }

        tokio::select! {
            biased;
            () = token.cancelled() => break,
            () = tokio::time::sleep_until(started + config.throttle) => {}
        }
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Finished analysis as client stopped: {report:?}");

    report
}
