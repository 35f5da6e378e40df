//! mq-latency library crate exposing modules for reuse and testing.

pub mod clock;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod output;
pub mod payload;
pub mod roles;
pub mod session;
pub mod transport;

// Optional re-exports for convenience in downstream code/tests
pub use config::{BenchConfig, FailureMode, Target};
pub use metrics::stats::{LatencySummary, StatsError};
pub use roles::orchestrator::{run_bench, BenchError, BenchReport};
pub use roles::prober::{run_batch, BatchConfig, BatchReport, ProbeError};
pub use session::{SessionError, SessionPair};
pub use transport::{ConnectOptions, Connector, Engine, Qos, Session, TransportBuilder, TransportError};
