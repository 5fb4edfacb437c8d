//! CLI binary for edgequake-jobkit.
//!
//! A thin shim over the library crate: maps flags and environment variables
//! to config structs, then runs a durable-queue worker, probes the backing
//! infrastructure, converts local inputs, or prints reconciliation batches.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use edgequake_jobkit::{
    ConnectorContext, ConvertOptions, ConverterManagerConfig, DocumentStatus,
    DurableOrchestratorConfig, LocalOrchestrator, LocalOrchestratorConfig, ObjectStoreCoordinates,
    Orchestrator, OutputFormat, Reconciler, ResultKind, TaskSource, TaskStatus, TaskTarget,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run two durable-queue workers against a local Redis
  jobkit worker --workers 2

  # Fail fast if Redis is down or no worker is attached
  jobkit check

  # Convert local files in-process, Markdown to stdout
  jobkit convert notes.md report.html

  # Convert a directory to md + json files under ./out
  jobkit convert ./docs --to md,json --output ./out

  # Pack the exports into one archive
  jobkit convert ./docs --zip docs.zip

  # List unconverted PDFs in batches of 50 (requires the `s3` feature)
  jobkit reconcile --endpoint s3.local:9000 --insecure \
      --source-bucket raw --source-prefix pdfs \
      --target-bucket converted --target-prefix pdfs --batch-size 50

ENVIRONMENT VARIABLES:
  JOBKIT_REDIS_URL        Redis connection URL (default redis://localhost:6379/)
  JOBKIT_QUEUE            Queue name (default conversion_queue)
  JOBKIT_RESULTS_PREFIX   Result key prefix (default docling:results)
  JOBKIT_RESULTS_TTL      Result lifetime in seconds (default 14400)
  JOBKIT_JOB_TIMEOUT      Per-job execution budget in seconds (default 14400)
  AWS_ACCESS_KEY_ID       Object-store access key for `reconcile`
  AWS_SECRET_ACCESS_KEY   Object-store secret key for `reconcile`
  RUST_LOG                Overrides --verbose / --quiet
"#;

/// Run and inspect document-conversion jobs.
#[derive(Parser, Debug)]
#[command(
    name = "jobkit",
    version,
    about = "Run and inspect document-conversion jobs",
    long_about = "Background document conversion: durable-queue workers backed by Redis, \
an in-process converter for local files, and reconciliation of object-store prefixes \
against already converted output.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "JOBKIT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "JOBKIT_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process jobs from the durable queue until interrupted.
    Worker {
        #[command(flatten)]
        queue: QueueArgs,

        /// Worker loops in this process, each with its own engine cache.
        #[arg(short, long, env = "JOBKIT_WORKERS", default_value_t = 1)]
        workers: usize,

        /// Engines kept warm per worker (1–100).
        #[arg(long, env = "JOBKIT_CACHE_SIZE", default_value_t = 10,
              value_parser = clap::value_parser!(u64).range(1..=100))]
        cache_size: u64,
    },
    /// Check Redis connectivity and that at least one worker is alive.
    Check {
        #[command(flatten)]
        queue: QueueArgs,

        /// Only check connectivity; do not require live workers.
        #[arg(long)]
        api_only: bool,
    },
    /// Convert local files, directories or URLs in-process.
    Convert(ConvertArgs),
    /// Print batches of source objects that have no converted counterpart.
    Reconcile(ReconcileArgs),
}

#[derive(Args, Debug)]
struct QueueArgs {
    /// Redis connection URL.
    #[arg(long, env = "JOBKIT_REDIS_URL", default_value = "redis://localhost:6379/")]
    redis_url: String,

    /// Key namespace for queue bookkeeping.
    #[arg(long, env = "JOBKIT_NAMESPACE", default_value = "jobkit")]
    namespace: String,

    /// Queue name.
    #[arg(long, env = "JOBKIT_QUEUE", default_value = "conversion_queue")]
    queue: String,

    /// Prefix of result-blob keys.
    #[arg(long, env = "JOBKIT_RESULTS_PREFIX", default_value = "docling:results")]
    results_prefix: String,

    /// Result-blob lifetime in seconds.
    #[arg(long, env = "JOBKIT_RESULTS_TTL", default_value_t = 14_400)]
    results_ttl: u64,

    /// Per-job execution budget in seconds.
    #[arg(long, env = "JOBKIT_JOB_TIMEOUT", default_value_t = 14_400)]
    job_timeout: u64,

    /// Delay between polls of an empty queue, in milliseconds.
    #[arg(long, env = "JOBKIT_POLL_INTERVAL_MS", default_value_t = 500)]
    poll_interval_ms: u64,

    /// Seconds without heartbeat after which a worker counts as dead.
    #[arg(long, env = "JOBKIT_HEARTBEAT_TTL", default_value_t = 30)]
    heartbeat_ttl: u64,
}

impl QueueArgs {
    fn to_config(&self, num_workers: usize, api_only: bool) -> DurableOrchestratorConfig {
        DurableOrchestratorConfig {
            redis_url: self.redis_url.clone(),
            namespace: self.namespace.clone(),
            queue_name: self.queue.clone(),
            results_prefix: self.results_prefix.clone(),
            results_ttl_secs: self.results_ttl,
            job_timeout_secs: self.job_timeout,
            num_workers,
            api_only,
            poll_interval_ms: self.poll_interval_ms,
            heartbeat_ttl_secs: self.heartbeat_ttl,
        }
    }
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Local files, directories, or HTTP/HTTPS URLs.
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Output formats: md, json, html, text, doctags.
    #[arg(long, value_enum, value_delimiter = ',', default_value = "md")]
    to: Vec<FormatArg>,

    /// Write exported files under this directory instead of stdout.
    #[arg(short, long, conflicts_with = "zip")]
    output: Option<PathBuf>,

    /// Write a zip archive of the exported files.
    #[arg(long)]
    zip: Option<PathBuf>,

    /// Glob applied to files inside directory inputs.
    #[arg(long, default_value = "*")]
    pattern: String,

    /// Stop at the first failed document.
    #[arg(long)]
    abort_on_error: bool,

    /// Per-document conversion budget in seconds.
    #[arg(long)]
    document_timeout: Option<u64>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "JOBKIT_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Md,
    Json,
    Html,
    Text,
    Doctags,
}

impl From<FormatArg> for OutputFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Md => OutputFormat::Md,
            FormatArg::Json => OutputFormat::Json,
            FormatArg::Html => OutputFormat::Html,
            FormatArg::Text => OutputFormat::Text,
            FormatArg::Doctags => OutputFormat::Doctags,
        }
    }
}

#[derive(Args, Debug)]
struct ReconcileArgs {
    /// Object-store host[:port], without scheme.
    #[arg(long, env = "JOBKIT_S3_ENDPOINT")]
    endpoint: String,

    /// Use plain HTTP instead of HTTPS.
    #[arg(long)]
    insecure: bool,

    #[arg(long, env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
    access_key: String,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_key: String,

    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    #[arg(long)]
    source_bucket: String,

    #[arg(long, default_value = "")]
    source_prefix: String,

    #[arg(long)]
    target_bucket: String,

    #[arg(long, default_value = "")]
    target_prefix: String,

    /// Keys per batch.
    #[arg(long, default_value_t = 100)]
    batch_size: usize,

    /// Emit pre-signed GET URLs instead of keys.
    #[arg(long)]
    presign: bool,
}

impl ReconcileArgs {
    fn coordinates(&self, bucket: &str, prefix: &str) -> ObjectStoreCoordinates {
        ObjectStoreCoordinates {
            endpoint: self.endpoint.clone(),
            verify_ssl: !self.insecure,
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            bucket: bucket.to_string(),
            key_prefix: prefix.to_string(),
            region: self.region.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Worker {
            queue,
            workers,
            cache_size,
        } => run_worker(&queue, workers, cache_size as usize).await,
        Command::Check { queue, api_only } => run_check(&queue, api_only).await,
        Command::Convert(args) => run_convert(args, cli.quiet).await,
        Command::Reconcile(args) => run_reconcile(args).await,
    }
}

#[cfg(feature = "redis")]
async fn run_worker(args: &QueueArgs, workers: usize, cache_size: usize) -> Result<()> {
    use edgequake_jobkit::engine::text::TextEngineFactory;
    use edgequake_jobkit::DurableOrchestrator;

    let config = args.to_config(workers, false);
    let manager_config = ConverterManagerConfig {
        cache_size,
        ..Default::default()
    };
    let orch = DurableOrchestrator::connect(config)
        .await
        .context("Failed to connect to the job queue")?
        .with_embedded_workers(
            manager_config,
            Arc::new(TextEngineFactory::new()),
            ConnectorContext::default(),
        )?;

    orch.process_queue_until(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("interrupted, shutting down");
    })
    .await
    .context("Worker pool stopped")?;
    Ok(())
}

#[cfg(not(feature = "redis"))]
async fn run_worker(_: &QueueArgs, _: usize, _: usize) -> Result<()> {
    bail!("this build has no durable queue backend; rebuild with `--features redis`")
}

#[cfg(feature = "redis")]
async fn run_check(args: &QueueArgs, api_only: bool) -> Result<()> {
    use edgequake_jobkit::DurableOrchestrator;

    let orch = DurableOrchestrator::connect(args.to_config(1, api_only))
        .await
        .context("Failed to connect to the job queue")?;
    orch.check_connection().await.context("Connection check failed")?;
    let depth = orch.queue_size().await?;
    println!("{} queue '{}' reachable, {} job(s) waiting", green("✓"), args.queue, depth);
    Ok(())
}

#[cfg(not(feature = "redis"))]
async fn run_check(_: &QueueArgs, _: bool) -> Result<()> {
    bail!("this build has no durable queue backend; rebuild with `--features redis`")
}

fn source_for(input: &str, pattern: &str) -> TaskSource {
    if edgequake_jobkit::connectors::http::is_url(input) {
        TaskSource::Http {
            url: input.to_string(),
            headers: Default::default(),
        }
    } else {
        TaskSource::LocalPath {
            path: PathBuf::from(input),
            pattern: pattern.to_string(),
            recursive: true,
        }
    }
}

async fn run_convert(args: ConvertArgs, quiet: bool) -> Result<()> {
    let mut builder = ConvertOptions::builder()
        .to_formats(args.to.iter().copied().map(OutputFormat::from))
        .abort_on_error(args.abort_on_error)
        .download_timeout_secs(args.download_timeout);
    if let Some(secs) = args.document_timeout {
        builder = builder.document_timeout_secs(secs);
    }
    let options = builder.build().context("Invalid conversion options")?;

    let target = match (&args.output, &args.zip) {
        (Some(dir), _) => TaskTarget::LocalPath { path: dir.clone() },
        (None, Some(_)) => TaskTarget::Zip,
        (None, None) => TaskTarget::InBody,
    };
    let sources = args
        .inputs
        .iter()
        .map(|input| source_for(input, &args.pattern))
        .collect();

    let orch = LocalOrchestrator::new(
        LocalOrchestratorConfig {
            num_workers: 1,
            shared_models: true,
        },
        ConverterManagerConfig::default(),
        Arc::new(edgequake_jobkit::engine::text::TextEngineFactory::new()),
        ConnectorContext::default(),
    )?;
    let runner = orch.clone();
    let workers = tokio::spawn(async move { runner.process_queue().await });

    let task = orch.enqueue(sources, options, target).await?;
    let mut status = task.status;
    while !status.is_terminal() {
        status = orch
            .task_status(&task.task_id, Duration::from_secs(1))
            .await?
            .status;
    }
    workers.abort();

    let result = orch
        .task_result(&task.task_id)
        .await?
        .context("Task finished without a result")?;

    if let ResultKind::TaskFailed { error_kind, message } = &result.result {
        bail!("task failed ({error_kind}): {message}");
    }

    match &result.result {
        ResultKind::Export { documents } => {
            let mut stdout = io::stdout().lock();
            for doc in documents {
                if let Some(ref md) = doc.content.md_content {
                    writeln!(stdout, "{md}")?;
                } else if let Some(ref text) = doc.content.text_content {
                    writeln!(stdout, "{text}")?;
                } else if let Some(ref json) = doc.content.json_content {
                    writeln!(stdout, "{}", serde_json::to_string_pretty(json)?)?;
                }
            }
        }
        ResultKind::Zip { content, .. } => {
            if let Some(ref path) = args.zip {
                std::fs::write(path, content)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
            }
        }
        _ => {}
    }

    if !quiet {
        for doc in result.documents() {
            let mark = match doc.status {
                DocumentStatus::Success => green("✓"),
                DocumentStatus::PartialSuccess => green("~"),
                DocumentStatus::Failure => red("✗"),
                DocumentStatus::Skipped => dim("-"),
            };
            eprintln!("  {mark} {}  {}", doc.filename, dim(&format!("{:.2}s", doc.processing_time)));
            for err in &doc.errors {
                eprintln!("      {}", red(&err.to_string()));
            }
        }
        eprintln!(
            "{} converted, {} failed in {:.2}s",
            result.num_succeeded, result.num_failed, result.processing_time
        );
    }
    if status == TaskStatus::Failure || result.num_failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_reconcile(args: ReconcileArgs) -> Result<()> {
    let source = args.coordinates(&args.source_bucket, &args.source_prefix);
    let target = args.coordinates(&args.target_bucket, &args.target_prefix);
    let reconciler = Reconciler::from_context(&ConnectorContext::default(), source, target)
        .context("Invalid reconciliation settings")?;

    let json = if args.presign {
        let batches = reconciler.presigned_batches(args.batch_size).await?;
        let urls: Vec<Vec<&str>> = batches
            .iter()
            .map(|batch| batch.iter().map(|u| u.url.as_str()).collect())
            .collect();
        serde_json::to_string_pretty(&urls)?
    } else {
        serde_json::to_string_pretty(&reconciler.pending_batches(args.batch_size).await?)?
    };
    println!("{json}");
    Ok(())
}
