//! Benchmark orchestrator: every target, every QoS level, one session pair per target.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::{BenchConfig, FailureMode, Target};
use crate::roles::prober::{run_batch, BatchReport, ProbeError};
use crate::session::{SessionError, SessionPair};
use crate::transport::{Connector, Qos};

#[derive(thiserror::Error, Debug)]
pub enum TargetError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("QoS {qos} batch failed: {source}")]
    Probe {
        qos: Qos,
        #[source]
        source: ProbeError,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum BenchError {
    #[error("invalid configuration: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("target '{target}': {source}")]
    Target {
        target: String,
        #[source]
        source: TargetError,
    },
}

/// Everything measured for one target.
#[derive(Debug)]
pub struct TargetOutcome {
    pub target: Target,
    /// One report per completed batch, in QoS order
    pub batches: Vec<BatchReport>,
    /// Only set in `FailureMode::Isolate`
    pub failure: Option<TargetError>,
    /// Close failed after measuring; results are still valid
    pub teardown_error: Option<SessionError>,
}

impl TargetOutcome {
    fn new(target: Target) -> Self {
        Self {
            target,
            batches: Vec::new(),
            failure: None,
            teardown_error: None,
        }
    }
}

#[derive(Debug)]
pub struct BenchReport {
    pub run_id: String,
    pub count: u64,
    pub outcomes: Vec<TargetOutcome>,
    pub elapsed: Duration,
}

impl BenchReport {
    pub fn get(&self, target: &str, qos: Qos) -> Option<&BatchReport> {
        self.outcomes
            .iter()
            .find(|o| o.target.name == target)?
            .batches
            .iter()
            .find(|b| b.qos == qos)
    }

    pub fn failed_targets(&self) -> impl Iterator<Item = &TargetOutcome> {
        self.outcomes.iter().filter(|o| o.failure.is_some())
    }
}

/// Measure every target in order. In `FailureMode::Abort` the first failure
/// ends the run and nothing is reported for the targets already measured.
pub async fn run_bench(
    config: &BenchConfig,
    connector: Arc<dyn Connector>,
) -> Result<BenchReport, BenchError> {
    config.validate()?;
    info!(
        run_id = %config.run_id,
        count = config.count,
        targets = config.targets.len(),
        qos_levels = ?config.qos_levels.iter().map(|q| q.level()).collect::<Vec<_>>(),
        failure_mode = ?config.failure_mode,
        "Starting latency run"
    );

    let started = Instant::now();
    let mut outcomes = Vec::with_capacity(config.targets.len());

    for target in &config.targets {
        let mut pair =
            SessionPair::new(target.clone(), Arc::clone(&connector), config.connect.clone());
        let mut outcome = TargetOutcome::new(target.clone());

        let measured = measure_target(&mut pair, config, &mut outcome.batches).await;

        if let Err(e) = pair.close().await {
            warn!(target_name = %target.name, error = %e, "Session pair teardown failed");
            outcome.teardown_error = Some(e);
        }

        if let Err(source) = measured {
            match config.failure_mode {
                FailureMode::Abort => {
                    error!(target_name = %target.name, error = %source, "Aborting run");
                    return Err(BenchError::Target {
                        target: target.name.clone(),
                        source,
                    });
                }
                FailureMode::Isolate => {
                    error!(target_name = %target.name, error = %source, "Target failed; continuing");
                    outcome.failure = Some(source);
                }
            }
        }
        outcomes.push(outcome);
    }

    Ok(BenchReport {
        run_id: config.run_id.clone(),
        count: config.count,
        outcomes,
        elapsed: started.elapsed(),
    })
}

async fn measure_target(
    pair: &mut SessionPair,
    config: &BenchConfig,
    batches: &mut Vec<BatchReport>,
) -> Result<(), TargetError> {
    pair.open().await?;
    for &qos in &config.qos_levels {
        let report = run_batch(pair, &config.batch(qos))
            .await
            .map_err(|source| TargetError::Probe { qos, source })?;
        batches.push(report);
    }
    Ok(())
}
