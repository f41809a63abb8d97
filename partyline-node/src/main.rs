// Party line daemon: UDP transport, console and timers around partyline-core.

mod config;
mod console;
mod transport;

use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use clap::Parser;
use partyline_core::{BootstrapToken, FatalError, Identity, OverlayCore};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

/// Command-line flags; each overrides the file and environment config.
#[derive(Debug, Parser)]
#[command(name = "partyline", version, about = "peer-to-peer party line chat node")]
struct Args {
    /// UDP port to bind and advertise
    #[arg(short, long)]
    port: Option<u16>,
    /// Local address to bind
    #[arg(long)]
    bind_ip: Option<IpAddr>,
    /// Address other nodes reach us at
    #[arg(long)]
    advertise_ip: Option<IpAddr>,
    /// Bootstrap token <8 hex ip>:<4 hex port>:<64 hex id>
    #[arg(short, long)]
    bootstrap: Option<String>,
    /// Log filter, overrides the configured one (RUST_LOG still wins)
    #[arg(long)]
    log: Option<String>,
}

impl Args {
    fn apply(self, c: &mut config::Config) {
        if let Some(p) = self.port {
            c.port = p;
        }
        if let Some(ip) = self.bind_ip {
            c.bind_ip = ip;
        }
        if let Some(ip) = self.advertise_ip {
            c.advertise_ip = ip;
        }
        if self.bootstrap.is_some() {
            c.bootstrap = self.bootstrap;
        }
        if let Some(filter) = self.log {
            c.log_filter = filter;
        }
    }
}

fn main() {
    let args = Args::parse();
    let (mut cfg, config_problem) = config::load();
    args.apply(&mut cfg);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    if let Some(problem) = config_problem {
        warn!("ignoring config file, using defaults: {problem}");
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "cannot start runtime");
            std::process::exit(1);
        }
    };
    if let Err(e) = rt.block_on(run(cfg)) {
        if e.downcast_ref::<FatalError>().is_some() {
            error!("bootstrap verification failed: {e}");
        } else {
            error!("{e:#}");
        }
        std::process::exit(1);
    }
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let advertise = SocketAddr::new(cfg.advertise_ip, cfg.port);
    let core = OverlayCore::with_config(Identity::generate(), advertise, cfg.overlay());
    let mut node = transport::Node::bind(core, SocketAddr::new(cfg.bind_ip, cfg.port)).await?;

    println!("{}", console::render_id(node.core()));
    println!("type /help for commands");

    if let Some(token) = &cfg.bootstrap {
        let token: BootstrapToken = token.parse().context("bad bootstrap token")?;
        node.join(token).await?;
    }
    node.run().await
}
