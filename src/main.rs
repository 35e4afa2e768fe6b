use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use audit_queue::config::{parse_phase, PhaseConfig, PipelineConfig, ServiceConfig, WorkerConfig};
use audit_queue::error::Error;
use audit_queue::pipeline::{PhasePlan, PhaseStrategy};
use audit_queue::service::Service;
use audit_queue::shutdown::install_shutdown_handler;
use audit_queue::strategy::CommandStrategy;

#[derive(Parser, Debug)]
#[command(name = "audit-queue")]
#[command(version)]
#[command(about = "Priority job queue and multi-phase pipeline runner for hash audits")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the worker pool and the HTTP adapter
    Serve(ServeArgs),
}

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Number of concurrent workers in this process
    #[arg(long, default_value = "2", env = "AUDIT_WORKERS")]
    workers: usize,

    /// HTTP listen address
    #[arg(long, default_value = "127.0.0.1:8080", env = "AUDIT_LISTEN")]
    listen: SocketAddr,

    /// Run workers only, without the HTTP adapter
    #[arg(long)]
    no_http: bool,

    /// Worker id prefix (defaults to a random one)
    #[arg(long)]
    worker_id: Option<String>,

    /// Heartbeat interval in milliseconds. Leases live for three intervals.
    #[arg(long, default_value = "5000")]
    heartbeat_ms: u64,

    /// Phase in `name:ratio:command` form, in execution order. Repeatable.
    /// Ratios must sum to 1.
    #[arg(long = "phase", value_name = "NAME:RATIO:COMMAND")]
    phases: Vec<String>,

    /// Grace period past a phase's slot before it is hard-stopped, in seconds
    #[arg(long, default_value = "2")]
    phase_grace_secs: u64,

    #[arg(long, default_value = "1")]
    min_budget_secs: u64,

    #[arg(long, default_value = "3600")]
    max_budget_secs: u64,

    /// How long terminal job records stay readable, in seconds
    #[arg(long, default_value = "86400")]
    retention_secs: u64,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_config(args: &ServeArgs) -> Result<ServiceConfig, Error> {
    let phases = args
        .phases
        .iter()
        .map(|spec| parse_phase(spec))
        .collect::<Result<Vec<PhaseConfig>, Error>>()?;
    if phases.is_empty() {
        return Err(Error::InvalidConfig(
            "at least one --phase name:ratio:command is required".into(),
        ));
    }

    let pipeline = PipelineConfig {
        phases,
        phase_grace: Duration::from_secs(args.phase_grace_secs),
        min_total_budget: Duration::from_secs(args.min_budget_secs),
        max_total_budget: Duration::from_secs(args.max_budget_secs),
    };
    pipeline.validate()?;

    let mut worker = match &args.worker_id {
        Some(id) => WorkerConfig::new(id.clone()),
        None => WorkerConfig::default(),
    };
    worker = worker.with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms.max(1)));

    let mut config = ServiceConfig {
        listen_addr: (!args.no_http).then_some(args.listen),
        workers: args.workers.max(1),
        worker,
        pipeline,
        ..ServiceConfig::default()
    };
    config.store.retention = Duration::from_secs(args.retention_secs);
    Ok(config)
}

fn command_strategy(phase: &PhaseConfig) -> Result<Arc<dyn PhaseStrategy>, Error> {
    match &phase.command {
        Some(command) => Ok(Arc::new(CommandStrategy::new(phase.name.clone(), command.clone()))),
        None => Err(Error::InvalidConfig(format!(
            "phase '{}' has no command",
            phase.name
        ))),
    }
}

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(args.log_level.as_deref());

    let config = build_config(&args)?;
    let plan = PhasePlan::from_config(&config.pipeline, command_strategy)?;
    for (index, phase) in plan.phases().iter().enumerate() {
        tracing::info!(
            phase_index = index,
            phase = %phase.name,
            ratio = phase.ratio,
            "Phase configured"
        );
    }

    let shutdown = install_shutdown_handler();
    Service::new(config, plan).run(shutdown).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve_args(extra: &[&str]) -> ServeArgs {
        let mut argv = vec!["audit-queue", "serve"];
        argv.extend_from_slice(extra);
        match Args::parse_from(argv).command {
            Commands::Serve(args) => args,
        }
    }

    #[test]
    fn phases_are_parsed_in_order() {
        let args = serve_args(&[
            "--phase",
            "dictionary:0.4:echo found:x",
            "--phase",
            "mask:0.6:mask-runner --charset a:z",
        ]);
        let config = build_config(&args).unwrap();
        let names: Vec<&str> = config.pipeline.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["dictionary", "mask"]);
        assert_eq!(
            config.pipeline.phases[1].command.as_deref(),
            Some("mask-runner --charset a:z")
        );
    }

    #[test]
    fn serve_requires_a_phase() {
        let args = serve_args(&[]);
        assert!(matches!(build_config(&args), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn heartbeat_sets_lease_ttl() {
        let args = serve_args(&["--heartbeat-ms", "200", "--phase", "a:1.0:true", "--no-http"]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.worker.lease_ttl(), Duration::from_millis(600));
        assert!(config.listen_addr.is_none());
    }

    #[test]
    fn phase_without_command_is_rejected() {
        let phase = PhaseConfig::new("rules", 1.0);
        assert!(command_strategy(&phase).is_err());
    }
}
