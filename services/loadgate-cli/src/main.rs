use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use loadgate_core::{metrics, RunPlan, VerdictStatus};
use loadgate_engine::{HttpTransport, ReportFormat, RunController, RunReport, RunResult, Scenario};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// TCP connect timeout of the shared HTTP client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit code for configuration errors and aborted runs.
const EXIT_ABORTED: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "loadgate")]
#[command(about = "Staged load runs with a pass/fail gate for HTTP prediction services", long_about = None)]
#[command(version)]
struct Cli {
    /// Run plan file (TOML, YAML or JSON)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Base URL of the target service (e.g., http://localhost:8000)
    #[arg(long, env = "BASE_URL")]
    base_url: Option<String>,

    /// Probe this path before every iteration
    #[arg(long)]
    health_path: Option<String>,

    /// Never probe, even if the plan configures a health path
    #[arg(long, conflicts_with = "health_path")]
    no_health_gate: bool,

    /// Write the run report to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Report format
    #[arg(long, value_enum, default_value = "json")]
    format: ReportFormatArg,

    /// Write the Prometheus text exposition of the engine metrics to this file
    #[arg(long)]
    prometheus_out: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Print the resolved run plan as JSON and exit without sending traffic
    #[arg(long)]
    print_config: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReportFormatArg {
    Json,
    Markdown,
}

impl From<ReportFormatArg> for ReportFormat {
    fn from(arg: ReportFormatArg) -> Self {
        match arg {
            ReportFormatArg::Json => ReportFormat::Json,
            ReportFormatArg::Markdown => ReportFormat::Markdown,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{:#}", err), "Run could not complete");
            eprintln!("\n❌ loadgate failed: {:#}", err);
            EXIT_ABORTED
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let plan = resolve_plan(&cli)?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(0);
    }

    let transport = Arc::new(HttpTransport::new(CONNECT_TIMEOUT)?);
    let scenario = Scenario::from_plan(&plan, transport).context("invalid scenario")?;
    let config = plan.run_config().context("invalid run plan")?;
    let controller = Arc::new(RunController::configure(config, scenario)?);

    info!(
        run_id = %controller.run_id(),
        target = %plan.target.base_url,
        "Starting load run"
    );
    controller.start()?;

    let interrupts = tokio::spawn(drain_on_interrupt(Arc::clone(&controller)));
    let result = controller.finalize().await;
    interrupts.abort();

    print_summary(&result);

    let report = RunReport::from(&result);
    if let Some(path) = &cli.report {
        report
            .write_report(path, cli.format.into())
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    if let Some(path) = &cli.prometheus_out {
        std::fs::write(path, metrics::export_prometheus())
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "Prometheus metrics written");
    }

    Ok(result.verdict.exit_code())
}

/// Layer the plan sources, then apply command-line overrides and validate.
fn resolve_plan(cli: &Cli) -> Result<RunPlan> {
    let mut plan = RunPlan::layered(cli.config.as_deref()).context("failed to load run plan")?;

    if let Some(base_url) = &cli.base_url {
        plan.target.base_url = base_url.clone();
    }

    if let Some(path) = &cli.health_path {
        plan.health.path = Some(path.clone());
        plan.health.enabled = Some(true);
    }

    if cli.no_health_gate {
        plan.health.enabled = Some(false);
    }

    plan.validate().context("invalid run plan")?;
    Ok(plan)
}

/// First Ctrl-C drains the run; a second one exits immediately.
async fn drain_on_interrupt(controller: Arc<RunController>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    warn!("Interrupt received, draining (Ctrl-C again to exit immediately)");
    controller.drain();

    if tokio::signal::ctrl_c().await.is_ok() {
        error!("Second interrupt, exiting without a verdict");
        std::process::exit(EXIT_ABORTED);
    }
}

fn print_summary(result: &RunResult) {
    let snapshot = &result.snapshot;
    let verdict = &result.verdict;

    match verdict.status {
        VerdictStatus::Passed => println!("\n✅ Run passed"),
        VerdictStatus::Failed => println!("\n❌ Run failed"),
        VerdictStatus::Aborted => println!("\n⚠️  Run aborted"),
    }

    println!("  Run ID: {}", result.run_id);
    println!("  Duration: {:.1}s", snapshot.elapsed.as_secs_f64());
    println!(
        "  Requests: {} ({} failed, {:.2}%)",
        snapshot.total_requests,
        snapshot.failed_requests,
        snapshot.failure_rate() * 100.0
    );
    println!(
        "  Latency: p50 {:.1}ms, p95 {:.1}ms, p99 {:.1}ms",
        snapshot.p50().as_secs_f64() * 1000.0,
        snapshot.p95().as_secs_f64() * 1000.0,
        snapshot.p99().as_secs_f64() * 1000.0
    );
    println!("  Throughput: {:.1} req/s", snapshot.throughput_rps());
    println!("  Peak VUs: {}", snapshot.peak_concurrency);

    if snapshot.health_gated > 0 {
        println!("  Health-gated iterations: {}", snapshot.health_gated);
    }
    if snapshot.interrupted_iterations > 0 {
        println!("  Interrupted iterations: {}", snapshot.interrupted_iterations);
    }

    for (name, counter) in &snapshot.checks {
        println!("  Check '{}': {:.2}%", name, counter.pass_rate() * 100.0);
    }

    if verdict.status != VerdictStatus::Passed {
        println!("\n{}", verdict.failure_summary());
    }
}

/// Initialize logging
fn init_logging(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_overrides_apply_before_validation() {
        let cli = Cli::parse_from([
            "loadgate",
            "--base-url",
            "http://model:8000",
            "--health-path",
            "/health",
        ]);
        let plan = resolve_plan(&cli).unwrap();

        assert_eq!(plan.target.base_url, "http://model:8000");
        assert!(plan.health.is_enabled());
    }

    #[test]
    fn test_disable_gate_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.toml");
        std::fs::write(
            &path,
            "[target]\nbase_url = \"http://model:8000\"\n\n[health]\npath = \"/health\"\n",
        )
        .unwrap();

        let cli = Cli::parse_from([
            "loadgate",
            "--config",
            path.to_str().unwrap(),
            "--no-health-gate",
        ]);
        let plan = resolve_plan(&cli).unwrap();

        assert_eq!(plan.health.path.as_deref(), Some("/health"));
        assert!(!plan.health.is_enabled());
    }

    #[test]
    fn test_empty_base_url_is_rejected() {
        let cli = Cli::parse_from(["loadgate", "--base-url", " "]);
        let err = resolve_plan(&cli).unwrap_err();
        assert!(format!("{:#}", err).contains("base_url"));
    }

    #[test]
    fn test_report_format_mapping() {
        assert_eq!(ReportFormat::from(ReportFormatArg::Markdown), ReportFormat::Markdown);
        assert_eq!(ReportFormat::from(ReportFormatArg::Json), ReportFormat::Json);
    }
}
