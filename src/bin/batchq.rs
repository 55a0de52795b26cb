//! batchq CLI: pipe stdin through a batch engine, inspect retry and backoff
//! policies.

use batchq::backoff::BackoffPolicy;
use batchq::config::{Config, EngineConfig, FileConfig};
use batchq::engine::{BatchEngine, BatchSink, CancellationToken, SharedEngine};
use batchq::error::BoxError;
use batchq::retry::{DelayTable, find_delay};
use batchq::telemetry::{TelemetryConfig, init_telemetry};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "batchq", about = "Reliable batching and delivery engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Read items from stdin (one per line) and flush them as JSON-lines batches
    Pipe {
        /// TOML file with engine settings; overrides BATCHQ_* variables.
        /// Re-read on SIGHUP.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Append batches to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the retry delay for a retry count using a nearest-key table
    Delay {
        /// How many times the item has failed so far
        retry_count: u32,
        /// Delay table as count=ms pairs, e.g. "0=1000,3=30000,10=300000"
        #[arg(long)]
        table: Option<String>,
        /// Fallback delay in milliseconds
        #[arg(long, default_value_t = 5000)]
        default_ms: u64,
        /// Read the table and fallback from the [retry] section of a TOML file
        #[arg(long, conflicts_with = "table")]
        config: Option<PathBuf>,
    },
    /// Print flush intervals and shedding decisions for consecutive failures
    Backoff {
        #[arg(long, default_value_t = 2000)]
        period_ms: u64,
        #[arg(long, default_value_t = 5000)]
        min_backoff_ms: u64,
        #[arg(long, default_value_t = 600_000)]
        max_backoff_ms: u64,
        /// Highest failure count to show
        #[arg(long, default_value_t = 12)]
        failures: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Pipe { config, output } => cmd_pipe(config, output).await,
        Command::Delay {
            retry_count,
            table,
            default_ms,
            config,
        } => cmd_delay(retry_count, table, default_ms, config),
        Command::Backoff {
            period_ms,
            min_backoff_ms,
            max_backoff_ms,
            failures,
        } => cmd_backoff(period_ms, min_backoff_ms, max_backoff_ms, failures),
    }
}

// ---------------------------------------------------------------------------
// pipe
// ---------------------------------------------------------------------------

/// Writes each batch as one JSON line: `{"batch": n, "items": [...]}`.
struct JsonLinesSink {
    out: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    batches: AtomicU64,
}

impl JsonLinesSink {
    async fn open(path: Option<&Path>) -> anyhow::Result<Self> {
        let out: Box<dyn AsyncWrite + Send + Unpin> = match path {
            Some(path) => Box::new(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?,
            ),
            None => Box::new(tokio::io::stdout()),
        };
        Ok(Self {
            out: tokio::sync::Mutex::new(out),
            batches: AtomicU64::new(0),
        })
    }
}

impl BatchSink<Value> for JsonLinesSink {
    async fn flush(&self, batch: &[Value], _cancel: &CancellationToken) -> Result<(), BoxError> {
        let n = self.batches.fetch_add(1, Ordering::Relaxed) + 1;
        let mut line = serde_json::to_vec(&json!({ "batch": n, "items": batch }))?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line).await?;
        out.flush().await?;
        Ok(())
    }
}

type PipeEngine = BatchEngine<Value, Arc<JsonLinesSink>>;

async fn cmd_pipe(config_path: Option<PathBuf>, output: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "batchq".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let engine_config = load_engine_config(config_path.as_deref(), &config.engine)?;
    let sink = Arc::new(JsonLinesSink::open(output.as_deref()).await?);
    let engine = Arc::new(SharedEngine::new(PipeEngine::new(
        engine_config,
        Arc::clone(&sink),
    )?));

    // Listeners live across iterations so signals that arrive while a branch
    // is running are not lost.
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut hangup = Hangup::listen();

    info!("reading items from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("interrupted, flushing");
                break;
            }
            _ = hangup.recv() => {
                match load_engine_config(config_path.as_deref(), &config.engine)
                    .and_then(|c| Ok(PipeEngine::new(c, Arc::clone(&sink))?))
                {
                    Ok(next) => {
                        let previous = engine.swap(next);
                        previous.close_async().await;
                        info!("configuration reloaded");
                    }
                    Err(e) => warn!(error = %e, "reload failed, keeping current engine"),
                }
            }
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => engine.current().submit(parse_item(line)),
                    None => break,
                }
            }
        }
    }

    engine.current().close_async().await;
    Ok(())
}

fn load_engine_config(path: Option<&Path>, from_env: &EngineConfig) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => Ok(FileConfig::from_toml_file(path)?.engine),
        None => Ok(from_env.clone()),
    }
}

/// JSON lines are kept structured; anything else is a string item.
fn parse_item(line: String) -> Value {
    serde_json::from_str(&line).unwrap_or(Value::String(line))
}

/// SIGHUP stream, registered once. Never fires where SIGHUP does not exist
/// or could not be registered.
struct Hangup {
    #[cfg(unix)]
    stream: Option<tokio::signal::unix::Signal>,
}

impl Hangup {
    #[cfg(unix)]
    fn listen() -> Self {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::hangup()) {
            Ok(stream) => Self {
                stream: Some(stream),
            },
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGHUP");
                Self { stream: None }
            }
        }
    }

    #[cfg(not(unix))]
    fn listen() -> Self {
        Self {}
    }

    #[cfg(unix)]
    async fn recv(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            if stream.recv().await.is_some() {
                return;
            }
            self.stream = None;
        }
        std::future::pending::<()>().await;
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) {
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// delay / backoff
// ---------------------------------------------------------------------------

fn cmd_delay(
    retry_count: u32,
    table: Option<String>,
    default_ms: u64,
    config: Option<PathBuf>,
) -> anyhow::Result<()> {
    let (table, default_delay) = match config {
        Some(path) => {
            let retry = FileConfig::from_toml_file(&path)?.retry;
            (retry.table, retry.default_delay)
        }
        None => {
            let table = table.map(|t| t.parse::<DelayTable>()).transpose()?;
            (table, Duration::from_millis(default_ms))
        }
    };

    let delay = find_delay(retry_count, table.as_ref(), default_delay);
    println!("{}", delay.as_millis());
    Ok(())
}

fn cmd_backoff(
    period_ms: u64,
    min_backoff_ms: u64,
    max_backoff_ms: u64,
    failures: u32,
) -> anyhow::Result<()> {
    let config = EngineConfig {
        period: Duration::from_millis(period_ms),
        min_backoff: Duration::from_millis(min_backoff_ms),
        max_backoff: Duration::from_millis(max_backoff_ms),
        ..EngineConfig::default()
    };
    config.validate()?;

    let mut policy = BackoffPolicy::new(config.period, config.min_backoff, config.max_backoff);

    println!("{:<9}  {:>12}  {:<10}  DROP_QUEUE", "FAILURES", "NEXT_MS", "DROP_BATCH");
    println!("{}", "-".repeat(47));
    for n in 0..=failures {
        if n > 0 {
            policy.mark_failure();
        }
        println!(
            "{:<9}  {:>12}  {:<10}  {}",
            n,
            policy.next_interval().as_millis(),
            policy.should_drop_batch(),
            policy.should_drop_queue()
        );
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hangup_sent_before_polling_is_still_received() {
        let mut hangup = Hangup::listen();

        let status = std::process::Command::new("kill")
            .args(["-HUP", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), hangup.recv())
            .await
            .expect("SIGHUP delivered while nobody was polling");
    }

    #[test]
    fn parse_item_keeps_json_and_wraps_text() {
        assert_eq!(parse_item(r#"{"id":1}"#.to_string()), json!({"id": 1}));
        assert_eq!(parse_item("hello".to_string()), json!("hello"));
    }
}
