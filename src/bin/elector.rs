use clap::{ArgAction, Parser};
use consul_election::util::parse_duration;
use consul_election::{participate, Client, ClientOptions, LeadershipConfig, Phase, SessionBehavior};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "elector", version, about = "Takes part in a Consul leader election", long_about = None)]
struct Cli {
    /// Contact info published while this process leads
    #[arg(required = true)]
    name: String,

    /// Leader key to contend for
    #[arg(short, long, default_value = "service/elector/leader")]
    key: String,

    /// Agent address; defaults to CONSUL_HTTP_ADDR or http://localhost:8500
    #[arg(short, long)]
    address: Option<String>,

    /// Session ttl, e.g. 10s or 1m
    #[arg(long, default_value = "15s", value_parser = duration)]
    ttl: Duration,

    /// Lock delay applied when a leader disappears
    #[arg(long, default_value = "15s", value_parser = duration)]
    lock_delay: Duration,

    /// Keep the leader key's value when the session goes away
    #[arg(long)]
    release: bool,

    /// Verbose mode (-v, -vv, -vvv)
    #[arg(short, action = ArgAction::Count)]
    verbosity: u8,
}

fn duration(s: &str) -> Result<Duration, String> {
    parse_duration(s).ok_or_else(|| format!("invalid duration {s:?}"))
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "consul_election=debug,elector=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbosity);

    let mut opts = ClientOptions::from_env();
    if let Some(address) = cli.address {
        opts = opts.with_address(address);
    }
    let client = Arc::new(Client::new(opts)?);

    let behavior = if cli.release {
        SessionBehavior::Release
    } else {
        SessionBehavior::Delete
    };
    let config = LeadershipConfig::new(cli.key, cli.name.clone())
        .with_description(format!("elector-{}", cli.name))
        .with_ttl(cli.ttl)
        .with_lock_delay(cli.lock_delay)
        .with_behavior(behavior);

    let name = cli.name;
    let session = participate(
        client,
        config,
        move |tenure: CancellationToken| {
            let name = name.clone();
            async move {
                info!(%name, "leading");
                tenure.cancelled().await;
                info!(%name, "no longer leading");
                anyhow::Ok(())
            }
        },
        CancellationToken::new(),
    )
    .await?;

    let mut phases = session.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Ok(()) = phases.changed() => {
                if *phases.borrow_and_update() == Phase::Stopped {
                    warn!("election stopped on its own");
                    break;
                }
            }
            _ = ticker.tick() => match session.current().await {
                Ok(leader) => info!(%leader, phase = ?session.phase(), "current leader"),
                Err(e) => warn!(error = %e, phase = ?session.phase(), "no current leader"),
            },
        }
    }

    info!("shutting down");
    session.shutdown().await;
    Ok(())
}
