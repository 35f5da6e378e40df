//! Run configuration: targets, batch parameters and the failure policy.

use std::collections::HashSet;
use std::time::Duration;

use crate::roles::prober::BatchConfig;
use crate::transport::{ConnectOptions, Qos};

pub const DEFAULT_COUNT: u64 = 1000;
pub const DEFAULT_TOPIC: &str = "mq-latency/probe";
pub const DEFAULT_PACE: Duration = Duration::from_millis(10);
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A named broker topology under test. Publisher and subscriber may point at
/// different brokers (e.g. two cluster nodes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub pub_addr: String,
    pub sub_addr: String,
}

impl Target {
    pub fn new(
        name: impl Into<String>,
        pub_addr: impl Into<String>,
        sub_addr: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            pub_addr: pub_addr.into(),
            sub_addr: sub_addr.into(),
        }
    }

    /// Loopback broker on the default port.
    pub fn local() -> Self {
        Self::new("local", "localhost:1883", "localhost:1883")
    }
}

/// What a target-level failure does to the rest of the run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// First failure aborts the run and no report is produced
    #[default]
    Abort,
    /// Record the failure on the target and continue with the next one
    Isolate,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("message count must be at least 1")]
    ZeroCount,
    #[error("no targets configured")]
    NoTargets,
    #[error("no QoS levels configured")]
    NoQosLevels,
    #[error("duplicate target name '{0}'")]
    DuplicateTarget(String),
    #[error("topic must be non-empty and free of MQTT wildcards, got '{0}'")]
    BadTopic(String),
    #[error("invalid target '{spec}': {reason}")]
    BadTarget { spec: String, reason: String },
}

#[derive(Clone, Debug)]
pub struct BenchConfig {
    pub run_id: String,
    /// Messages per batch
    pub count: u64,
    pub targets: Vec<Target>,
    /// Batches run per target, in this order
    pub qos_levels: Vec<Qos>,
    pub topic: String,
    /// Delay after every publish
    pub pace: Duration,
    /// Bound on the wait for outstanding deliveries after the last publish (None = wait forever)
    pub batch_timeout: Option<Duration>,
    /// Dropped deliveries tolerated per batch (None = unbounded)
    pub max_malformed: Option<u64>,
    pub failure_mode: FailureMode,
    pub connect: ConnectOptions,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            run_id: String::new(),
            count: DEFAULT_COUNT,
            targets: vec![Target::local()],
            qos_levels: vec![Qos::AtMostOnce, Qos::AtLeastOnce],
            topic: DEFAULT_TOPIC.to_string(),
            pace: DEFAULT_PACE,
            batch_timeout: Some(DEFAULT_BATCH_TIMEOUT),
            max_malformed: None,
            failure_mode: FailureMode::Abort,
            connect: ConnectOptions::default(),
        }
    }
}

impl BenchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.count == 0 {
            return Err(ConfigError::ZeroCount);
        }
        if self.targets.is_empty() {
            return Err(ConfigError::NoTargets);
        }
        if self.qos_levels.is_empty() {
            return Err(ConfigError::NoQosLevels);
        }
        if self.topic.is_empty() || self.topic.contains(['#', '+']) {
            return Err(ConfigError::BadTopic(self.topic.clone()));
        }
        let mut seen = HashSet::new();
        for t in &self.targets {
            if !seen.insert(t.name.as_str()) {
                return Err(ConfigError::DuplicateTarget(t.name.clone()));
            }
        }
        Ok(())
    }

    pub fn batch(&self, qos: Qos) -> BatchConfig {
        BatchConfig {
            topic: self.topic.clone(),
            qos,
            count: self.count,
            pace: self.pace,
            timeout: self.batch_timeout,
            max_malformed: self.max_malformed,
        }
    }
}

/// Parse a `--target` value: comma-separated `KEY=VALUE` pairs with keys
/// `name`, `pub`, `sub`, or `addr` (sets both endpoints).
///
/// `name=two-node,pub=localhost:1884,sub=remote.net:1884`
pub fn parse_target(spec: &str) -> Result<Target, ConfigError> {
    let bad = |reason: &str| ConfigError::BadTarget {
        spec: spec.to_string(),
        reason: reason.to_string(),
    };

    let mut name = None;
    let mut pub_addr = None;
    let mut sub_addr = None;
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| bad(&format!("expected KEY=VALUE, got '{}'", part)))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(bad(&format!("empty value for '{}'", key.trim())));
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => name = Some(value.to_string()),
            "pub" => pub_addr = Some(value.to_string()),
            "sub" => sub_addr = Some(value.to_string()),
            "addr" => {
                pub_addr = Some(value.to_string());
                sub_addr = Some(value.to_string());
            }
            other => return Err(bad(&format!("unknown key '{}'", other))),
        }
    }

    match (name, pub_addr, sub_addr) {
        (Some(n), Some(p), Some(s)) => Ok(Target::new(n, p, s)),
        (None, _, _) => Err(bad("missing name")),
        _ => Err(bad("missing pub/sub address")),
    }
}

pub fn parse_qos_levels(levels: &[u8]) -> Result<Vec<Qos>, crate::transport::TransportError> {
    levels.iter().map(|&l| Qos::try_from(l)).collect()
}
