//! powermeter - Optical Power Meter Pulse Counter
//!
//! Daemon that counts meter LED blinks and pushes the energy they represent
//! to a Prometheus Pushgateway.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use powermeter::{
    shutdown, AgentConfig, DefaultSignalSource, Exposition, FileStore, HostLink, HttpTransport,
    LoggingTransport, MemoryStore, MeterState, PowerMeterAgent, PushTransport, ReplaySource,
    ReportJob, StateStore, StaticLink, DEFAULT_THRESHOLD,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "powermeter")]
#[command(about = "Optical power meter pulse counter for Prometheus Pushgateway")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(
    long_about = "Counts the indicator LED blinks of a utility power meter and pushes the energy they represent to a Prometheus Pushgateway"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Pushgateway host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Pushgateway port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Pushgateway grouping path, e.g. /metrics/job/powermeter/instance/home
    #[arg(long, global = true)]
    context: Option<String>,

    /// Pulses per report
    #[arg(short, long, global = true)]
    threshold: Option<u64>,

    /// Directory holding the persisted meter state
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Count pulses and push reports (default)
    Run,

    /// Print the persisted meter state and exit
    Status(StatusArgs),

    /// Push a synthetic blink train through the whole pipeline
    Simulate(SimulateArgs),

    /// Print the exposition body for the outstanding pulses
    Payload,
}

#[derive(Args)]
struct StatusArgs {
    /// Output format: json or pretty
    #[arg(short, long, default_value = "pretty")]
    format: String,
}

#[derive(Args)]
struct SimulateArgs {
    /// Number of blinks to synthesize
    #[arg(short = 'n', long, default_value_t = DEFAULT_THRESHOLD)]
    pulses: u64,

    /// Log payloads instead of sending them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    init_logging(config.debug)?;

    match &cli.command {
        Some(Commands::Run) | None => run_command(config).await,
        Some(Commands::Status(args)) => status_command(&config, args),
        Some(Commands::Simulate(args)) => simulate_command(config, args).await,
        Some(Commands::Payload) => payload_command(&config),
    }
}

/// Defaults, then the config file, then command line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => AgentConfig::default(),
    };

    if let Some(host) = &cli.host {
        config = config.with_host(host);
    }
    if let Some(port) = cli.port {
        config = config.with_port(port);
    }
    if let Some(context) = &cli.context {
        config = config.with_context(context);
    }
    if let Some(threshold) = cli.threshold {
        config = config.with_threshold(threshold);
    }
    if let Some(dir) = &cli.data_dir {
        config = config.with_data_dir(dir);
    }
    if cli.debug {
        config = config.with_debug(true);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn init_logging(debug: bool) -> anyhow::Result<()> {
    let level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install log subscriber")?;

    Ok(())
}

async fn run_command(config: AgentConfig) -> anyhow::Result<()> {
    info!("Starting powermeter {}", env!("CARGO_PKG_VERSION"));

    let source = DefaultSignalSource::new(&config.detector).context("Failed to open sensor")?;
    let link = HostLink::new(&config.wifi.interface);
    let transport = HttpTransport::new(&config.push)?;
    let store = FileStore::open(&config.storage.data_dir).with_context(|| {
        format!(
            "Failed to open state directory {}",
            config.storage.data_dir.display()
        )
    })?;

    #[cfg(not(feature = "gpio"))]
    warn!("Built without the gpio feature, no pulses will be counted");

    let agent = PowerMeterAgent::new(
        config,
        Box::new(source),
        Box::new(link),
        Arc::new(transport),
        Box::new(store),
    )?;

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        trigger.trigger();
    });

    let state = agent.run(shutdown).await?;
    info!(
        total = state.total_pulses,
        outstanding = state.pulses_since_last_report,
        "Final meter state persisted"
    );

    Ok(())
}

fn status_command(config: &AgentConfig, args: &StatusArgs) -> anyhow::Result<()> {
    let state = load_state(config)?;

    match args.format.as_str() {
        "json" => {
            let json = serde_json::to_string_pretty(&state)?;
            println!("{}", json);
        }
        "pretty" => print_pretty_state(config, &state),
        other => bail!("Unsupported format: {}. Use 'json' or 'pretty'", other),
    }

    Ok(())
}

async fn simulate_command(config: AgentConfig, args: &SimulateArgs) -> anyhow::Result<()> {
    let pulses = usize::try_from(args.pulses).context("Pulse count too large")?;

    // Hold each level for twice the debounce window so no edge is rejected
    let interval_ms = config.detector.sample_interval_ms.max(1);
    let hold = usize::try_from((config.detector.debounce_ms * 2).div_ceil(interval_ms))
        .context("Debounce window too large")?
        .max(1);
    let replay = Duration::from_millis(interval_ms * (2 * hold as u64) * args.pulses);

    let transport: Arc<dyn PushTransport> = if args.dry_run {
        Arc::new(LoggingTransport)
    } else {
        Arc::new(HttpTransport::new(&config.push)?)
    };
    let threshold = config.scheduler.threshold;
    let drain_budget = drain_budget(&config);

    let agent = PowerMeterAgent::new(
        config,
        Box::new(ReplaySource::blinks(pulses, hold, hold)),
        Box::new(StaticLink::up()),
        transport,
        Box::new(MemoryStore::new()),
    )?;
    let accumulator = agent.accumulator();

    info!(pulses, ?replay, "Simulating blinks");
    let (trigger, shutdown) = shutdown::channel();
    let task = tokio::spawn(agent.run(shutdown));

    tokio::select! {
        _ = async {
            tokio::time::sleep(replay + Duration::from_millis(interval_ms * 2)).await;
            let deadline = tokio::time::Instant::now() + drain_budget;
            while accumulator.outstanding() >= threshold && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => info!("Interrupt received, stopping simulation"),
    }
    trigger.trigger();

    let state = task.await.context("Simulation task panicked")??;
    if state.pulses_since_last_report >= threshold {
        warn!(
            outstanding = state.pulses_since_last_report,
            "Simulation ended with reports still undelivered"
        );
    }

    println!("Simulated pulses:    {}", state.total_pulses);
    println!("Reported pulses:     {}", state.reported_pulses());
    println!("Outstanding pulses:  {}", state.pulses_since_last_report);

    Ok(())
}

fn payload_command(config: &AgentConfig) -> anyhow::Result<()> {
    let state = load_state(config)?;
    let exposition = Exposition::from_config(&config.push)?;
    let job = ReportJob::new(
        state.pulses_since_last_report,
        config.energy.wh_per_pulse(),
        config.push.url(),
    );

    println!("PUT {}", job.endpoint());
    print!("{}", exposition.render(&job)?);

    Ok(())
}

fn load_state(config: &AgentConfig) -> anyhow::Result<MeterState> {
    let mut store = FileStore::open(&config.storage.data_dir).with_context(|| {
        format!(
            "Failed to open state directory {}",
            config.storage.data_dir.display()
        )
    })?;
    Ok(store.load()?.unwrap_or_default())
}

/// Upper bound on the time one job can spend in the reporter.
fn drain_budget(config: &AgentConfig) -> Duration {
    let attempts = config.retry.max_attempts.max(1);
    let backoff = Duration::from_millis(config.retry.max_backoff_ms) * attempts;
    let requests = config.push.request_timeout() * attempts;
    backoff + requests
}

fn print_pretty_state(config: &AgentConfig, state: &MeterState) {
    let wh_per_pulse = config.energy.wh_per_pulse();

    println!("Meter state ({})", config.storage.data_dir.display());
    println!("==========================================");
    println!(
        "  Total pulses:       {} ({:.3} kWh)",
        state.total_pulses,
        state.total_pulses as f64 * wh_per_pulse / 1000.0
    );
    println!(
        "  Outstanding pulses: {} ({:.1} Wh)",
        state.pulses_since_last_report,
        state.pulses_since_last_report as f64 * wh_per_pulse
    );
    match state.last_report_timestamp {
        Some(at) => println!("  Last report:        {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("  Last report:        never"),
    }
    println!("  Push URL:           {}", config.push.url());
    println!("  Report threshold:   {}", config.scheduler.threshold);
}
