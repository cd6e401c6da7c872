use anyhow::{Context, Result};
use clap::Parser;
use radload_core::{
    Exchanger, MockExchanger, Pacing, PhasePlan, PhaseSelector, PhaseSequencer, PlanFile,
    RunConfig, RunReport, UdpExchanger,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "radius-load")]
#[command(about = "Phased RADIUS load generator - writes one JSON record per request to stdout")]
struct Args {
    /// RADIUS server address (host:port)
    #[arg(long, env = "RADIUS_ADDR", default_value = "127.0.0.1:1812")]
    addr: String,

    /// RADIUS shared secret
    #[arg(long, env = "RADIUS_SECRET", default_value = "testing123", hide_env_values = true)]
    secret: String,

    /// Password sent for every synthetic user
    #[arg(long, env = "RADIUS_PASS", default_value = "pass123", hide_env_values = true)]
    password: String,

    /// Number of synthetic users (user0000..)
    #[arg(long, env = "USERS", default_value_t = 1000)]
    users: usize,

    /// Target steady-state requests per second
    #[arg(long, env = "RPS", default_value_t = 200.0)]
    rps: f64,

    /// Max concurrent in-flight requests
    #[arg(long, env = "WORKERS", default_value_t = 512)]
    workers: usize,

    /// Per-request timeout
    #[arg(long, env = "RADIUS_TIMEOUT", default_value = "2s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Retransmission interval while waiting for a reply (0 disables)
    #[arg(long, env = "RADIUS_RETRANSMIT", default_value = "1s", value_parser = humantime::parse_duration)]
    retransmit: Duration,

    /// Warmup duration
    #[arg(long, env = "WARMUP", default_value = "5s", value_parser = humantime::parse_duration)]
    warmup: Duration,

    /// Steady duration
    #[arg(long, env = "STEADY", default_value = "30s", value_parser = humantime::parse_duration)]
    steady: Duration,

    /// Spike duration
    #[arg(long, env = "SPIKE", default_value = "10s", value_parser = humantime::parse_duration)]
    spike: Duration,

    /// Spike rate multiplier
    #[arg(long = "spike-mult", env = "SPIKE_MULT", default_value_t = 3.0)]
    spike_mult: f64,

    /// Phase to run: warmup|steady|spike|all (or a name from --plan)
    #[arg(long, env = "PHASE", default_value = "all")]
    phase: PhaseSelector,

    /// Optional test identifier (sent as Calling-Station-Id)
    #[arg(long = "test-id", env = "TEST_ID")]
    test_id: Option<String>,

    /// Seed for username selection
    #[arg(long, env = "SEED")]
    seed: Option<u64>,

    /// Dispatch pacing: ticker or token-bucket
    #[arg(long, env = "PACING", default_value = "ticker")]
    pacing: Pacing,

    /// Records buffered between requests and the output writer
    #[arg(long = "channel-capacity", env = "CHANNEL_CAPACITY", default_value_t = radload_core::DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// TOML file with [[phases]] replacing warmup/steady/spike
    #[arg(long, env = "PLAN")]
    plan: Option<PathBuf>,

    /// How often to log the scheduled phase (0 disables)
    #[arg(long, env = "PROGRESS", default_value = "10s", value_parser = humantime::parse_duration)]
    progress: Duration,

    /// Exchange mode: udp or mock
    #[arg(long, env = "MODE", default_value = "udp")]
    mode: String,
}

impl Args {
    fn into_config(self) -> Result<(RunConfig, String, Duration)> {
        let mut config = RunConfig::default();
        config.target.address = self.addr;
        config.target.secret = self.secret;
        config.target.password = self.password;
        config.target.timeout = self.timeout;
        config.target.retransmit = self.retransmit;

        config.scenario.users = self.users;
        config.scenario.rps = self.rps;
        config.scenario.workers = self.workers;
        config.scenario.warmup = self.warmup;
        config.scenario.steady = self.steady;
        config.scenario.spike = self.spike;
        config.scenario.spike_multiplier = self.spike_mult;
        config.scenario.phase = self.phase;
        config.scenario.pacing = self.pacing;
        config.scenario.channel_capacity = self.channel_capacity;
        config.scenario.seed = self.seed;
        config.scenario.test_id = self.test_id.filter(|id| !id.is_empty());

        if let Some(path) = &self.plan {
            let plan = PlanFile::from_file(path)
                .with_context(|| format!("Failed to load plan from {:?}", path))?;
            config.phases = Some(plan.phases);
        }

        Ok((config, self.mode, self.progress))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the records, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let (config, mode, progress) = Args::parse().into_config()?;
    config.validate().context("Invalid configuration")?;

    let mut mock = None;
    let exchanger: Arc<dyn Exchanger> = match mode.as_str() {
        "mock" => {
            let exchanger = Arc::new(MockExchanger::new(Duration::from_millis(5)));
            mock = Some(Arc::clone(&exchanger));
            exchanger
        }
        "udp" => {
            let addr = resolve(&config.target.address).await?;
            Arc::new(UdpExchanger::new(
                addr,
                config.target.secret.as_bytes().to_vec(),
                config.target.retransmit,
            ))
        }
        _ => anyhow::bail!("Invalid mode: {}, must be 'udp' or 'mock'", mode),
    };

    info!(
        "Starting load against {} using {} exchanger",
        config.target.address,
        exchanger.name()
    );
    info!(
        "users={} workers={} timeout={:?} pacing={:?} test_id={}",
        config.scenario.users,
        config.scenario.workers,
        config.target.timeout,
        config.scenario.pacing,
        config.scenario.test_id.as_deref().unwrap_or("-")
    );

    let sequencer = PhaseSequencer::from_config(&config, exchanger)?;
    print_schedule(sequencer.plan());

    let reporter = (!progress.is_zero())
        .then(|| tokio::spawn(report_progress(sequencer.plan().clone(), progress)));

    let stdout = tokio::io::stdout();
    let result = sequencer
        .run_to_writer(stdout, config.scenario.channel_capacity)
        .await;
    if let Some(reporter) = reporter {
        reporter.abort();
    }
    let (_, report) = result.context("Load run failed")?;

    if let Some(mock) = &mock {
        info!("Mock exchanger served {} exchanges", mock.calls());
    }
    print_summary(&report);
    Ok(())
}

async fn resolve(address: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await
        .with_context(|| format!("Failed to resolve {address}"))?
        .next()
        .with_context(|| format!("No addresses found for {address}"))
}

async fn report_progress(plan: PhasePlan, every: Duration) {
    let start = Instant::now();
    let Some(first) = start.checked_add(every) else {
        return;
    };
    let mut ticker = interval_at(first, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let elapsed = start.elapsed();
        match plan.phase_at(elapsed) {
            Some(phase) => info!(
                "Progress: {:?} elapsed, in {} at {:.1} req/s",
                elapsed, phase.name, phase.rate
            ),
            None => info!("Progress: {:?} elapsed, draining in-flight requests", elapsed),
        }
    }
}

fn print_schedule(plan: &PhasePlan) {
    info!("Total scheduled duration: {:?}", plan.total_duration());
    for (idx, phase) in plan.phases().iter().enumerate() {
        info!(
            "Phase {}: {} at {:.1} req/s for {:?} (~{} requests)",
            idx,
            phase.name,
            phase.rate,
            phase.duration,
            phase.expected_dispatches()
        );
    }
}

fn print_summary(report: &RunReport) {
    eprintln!("\n=== Run Summary ===");
    eprintln!("Elapsed: {:?}", report.elapsed);
    for phase in &report.phases {
        eprintln!(
            "{:<10} dispatched={:<8} target={:.1}/s achieved={:.1}/s",
            phase.name,
            phase.dispatched,
            phase.rate,
            phase.achieved_rate()
        );
    }
    eprintln!("Records written: {}", report.written);
    eprintln!("Records skipped: {}", report.skipped);
    eprintln!("Failed requests: {}", report.failures);
    eprintln!();
}
