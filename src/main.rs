mod bus;
mod config;
mod sim;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bus::{BusMessage, ChannelPublisher};
use config::SimConfig;
use sim::kernel::Kernel;
use sim::predictor::{AlertFeedModel, HeuristicRiskModel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RiskModelKind {
    /// Built-in threshold-proximity model.
    Heuristic,
    /// Score each machine from the external service's `job/alerts` feed.
    Alerts,
}

/// Flexible job-shop simulator with predictive maintenance.
#[derive(Debug, Parser)]
#[command(name = "flexshop", version)]
struct Args {
    /// RON configuration file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// RNG seed override for reproducible runs.
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many ticks (0 = run until quiescence).
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Wall-clock seconds between ticks.
    #[arg(long)]
    tick_seconds: Option<f64>,

    /// Number of jobs generated at init.
    #[arg(long)]
    seed_jobs: Option<u32>,

    /// Where failure-risk scores come from.
    #[arg(long, value_enum, default_value = "heuristic")]
    risk_model: RiskModelKind,

    /// Run ticks back to back with no wall-clock delay.
    #[arg(long)]
    fast: bool,
}

impl Args {
    fn apply(&self, config: &mut SimConfig) {
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(max_ticks) = self.max_ticks {
            config.max_ticks = max_ticks;
        }
        if let Some(tick_seconds) = self.tick_seconds {
            config.tick_seconds = tick_seconds;
        }
        if let Some(seed_jobs) = self.seed_jobs {
            config.seed_jobs = seed_jobs;
        }
        if self.fast {
            config.tick_seconds = 0.0;
        }
    }
}

/// Broker stand-in: drains the outbound bus and writes one
/// `<topic> <json>` line per message.
fn spawn_bus_drain(mut rx: mpsc::Receiver<BusMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message.to_json() {
                Ok(json) => println!("{} {}", message.topic(), json),
                Err(err) => warn!(%err, topic = message.topic(), "payload serialization failed"),
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = config::load(args.config.as_deref())?;
    args.apply(&mut config);
    info!(?config, "simulation configured");

    let (mut publisher, rx) = ChannelPublisher::channel(config.event_capacity);
    let drain = spawn_bus_drain(rx);

    // The alert feed is where a broker bridge would inject `job/alerts`
    // messages from the external inference service. With the heuristic
    // model the kernel merely ingests the feed; with the alerts model it
    // becomes the risk source itself.
    let (_alert_tx, alert_inbox) = bus::alert_feed(config.event_capacity);

    let mut kernel = match args.risk_model {
        RiskModelKind::Heuristic => {
            let model = HeuristicRiskModel::new(config.risk_threshold);
            let mut kernel = Kernel::new(config.clone(), Box::new(model));
            kernel.attach_alerts(alert_inbox);
            kernel
        }
        RiskModelKind::Alerts => {
            let model = AlertFeedModel::new(alert_inbox, config.risk_threshold);
            Kernel::new(config.clone(), Box::new(model))
        }
    };

    let tick_delay = Duration::from_secs_f64(config.tick_seconds.max(0.0));
    loop {
        let report = match kernel.tick(&mut publisher) {
            Ok(report) => report,
            Err(err) => {
                error!(%err, "fatal kernel error, shutting down");
                break;
            }
        };
        if report.halt {
            info!(tick = report.tick, "all work drained, shutting down");
            break;
        }
        if config.max_ticks > 0 && report.tick >= config.max_ticks {
            info!(tick = report.tick, "tick limit reached");
            break;
        }
        if tick_delay.is_zero() {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(tick_delay) => {}
            _ = tokio::signal::ctrl_c() => {
                info!(tick = report.tick, "stop requested, finishing up");
                break;
            }
        }
    }

    info!(
        ticks = kernel.tick_count(),
        completed = kernel.completed_count(),
        "run summary"
    );
    for (machine_id, status) in publisher.retained() {
        info!(
            machine = %machine_id,
            status = %status.status,
            temperature = status.temperature,
            vibration = status.vibration,
            power_kwh = status.power_kwh_total,
            "final machine state"
        );
    }

    // Closing the publisher lets the drain task flush what is buffered.
    drop(publisher);
    drain.await?;
    Ok(())
}
