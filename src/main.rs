use anyhow::{anyhow, bail, Result};
use clap::Parser;
use mq_latency::config::{
    parse_qos_levels, parse_target, BenchConfig, FailureMode, Target, DEFAULT_TOPIC,
};
use mq_latency::output::OutputWriter;
use mq_latency::roles::orchestrator::run_bench;
use mq_latency::transport::config::parse_engine;
use mq_latency::transport::{ConnectOptions, TransportBuilder};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mq-latency")]
#[command(about = "End-to-end MQTT latency comparison across broker targets")]
struct Cli {
    /// Run ID for tagging outputs (random if empty)
    #[arg(long, default_value = "")]
    run_id: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Messaging engine (mqtt, or mock when built with transport-mock)
    #[arg(long, default_value = "mqtt")]
    engine: String,

    /// Messages per batch
    #[arg(short = 'n', long, default_value = "1000")]
    count: u64,

    /// Target as name=NAME,pub=HOST:PORT,sub=HOST:PORT (or addr=HOST:PORT); repeatable.
    /// Defaults to a single loopback target at localhost:1883
    #[arg(long, value_parser = clap::builder::NonEmptyStringValueParser::new())]
    target: Vec<String>,

    /// QoS levels to measure, in order
    #[arg(long, value_delimiter = ',', default_value = "0,1")]
    qos: Vec<u8>,

    /// Topic shared by publisher and subscriber
    #[arg(long, default_value = DEFAULT_TOPIC)]
    topic: String,

    /// Delay after each publish (ms)
    #[arg(long, default_value = "10")]
    pace_ms: u64,

    /// Seconds any single publish, and the wait for outstanding deliveries after
    /// the last publish, may take before the batch fails (0 = wait forever)
    #[arg(long, default_value = "30")]
    batch_timeout: u64,

    /// Fail a batch once more than this many deliveries were dropped as malformed
    #[arg(long)]
    max_malformed: Option<u64>,

    /// Keep measuring remaining targets when one fails
    #[arg(long, default_value = "false")]
    isolate_failures: bool,

    /// MQTT keep-alive (seconds)
    #[arg(long, default_value = "5")]
    keep_alive: u64,

    /// Timeout for CONNACK/SUBACK (ms)
    #[arg(long, default_value = "10000")]
    connect_timeout: u64,

    /// Enable connection retry with exponential backoff
    #[arg(long, default_value = "false")]
    enable_retry: bool,

    /// Maximum number of connection retry attempts
    #[arg(long, default_value = "3")]
    retry_count: u32,

    /// Initial delay between retries in milliseconds
    #[arg(long, default_value = "1000")]
    retry_delay: u64,

    /// Optional CSV output file path (in addition to the table)
    #[arg(long)]
    csv: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    mq_latency::logging::init(&cli.log_level)?;

    let run_id = if cli.run_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        cli.run_id.clone()
    };
    let engine =
        parse_engine(&cli.engine).ok_or_else(|| anyhow!("unknown engine '{}'", cli.engine))?;
    let targets = if cli.target.is_empty() {
        vec![Target::local()]
    } else {
        cli.target
            .iter()
            .map(|s| parse_target(s))
            .collect::<Result<Vec<_>, _>>()?
    };

    let config = BenchConfig {
        run_id,
        count: cli.count,
        targets,
        qos_levels: parse_qos_levels(&cli.qos)?,
        topic: cli.topic.clone(),
        pace: Duration::from_millis(cli.pace_ms),
        batch_timeout: match cli.batch_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        },
        max_malformed: cli.max_malformed,
        failure_mode: if cli.isolate_failures {
            FailureMode::Isolate
        } else {
            FailureMode::Abort
        },
        connect: ConnectOptions {
            keep_alive_secs: cli.keep_alive,
            clean_start: true,
            connect_timeout_ms: cli.connect_timeout,
            retry_enabled: cli.enable_retry,
            retry_count: cli.retry_count,
            retry_delay_ms: cli.retry_delay,
            retry_max_delay_ms: 30_000,
        },
    };
    config.validate()?;

    match config.batch_timeout {
        Some(t) => info!(
            timeout_secs = t.as_secs(),
            "Batch timeout enabled: a stalled delivery stream fails the batch instead of blocking"
        ),
        None => warn!("Batch timeout disabled: a stalled delivery stream blocks the run forever"),
    }
    println!("mq-latency run_id: {}", config.run_id);
    println!("Number of messages: {}", config.count);

    let connector = TransportBuilder::connector(engine)?;
    let report = run_bench(&config, connector).await?;

    OutputWriter::new_stdout().write_report(&report).await?;
    if let Some(path) = cli.csv {
        OutputWriter::new_csv(path).await?.write_report(&report).await?;
    }
    println!("Finished run in: {:?}", report.elapsed);

    let failed = report.failed_targets().count();
    if failed > 0 {
        bail!("{} of {} targets failed", failed, report.outcomes.len());
    }
    Ok(())
}
