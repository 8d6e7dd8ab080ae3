use std::{
    net::{Ipv4Addr, SocketAddr},
    process::ExitCode,
};

use clap::Parser;

use lantorrent::{conf::TrackerConfig, error::Result, tracker::service};

/// Run the swarm rendezvous tracker.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Port to serve /announce and /stats on
    #[arg(short, long, default_value_t = 8000)]
    port: u16,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.port));
    let tracker = service::serve(addr, TrackerConfig::default())?;

    tokio::signal::ctrl_c().await?;
    log::info!("Interrupted, shutting down");
    drop(tracker);
    Ok(())
}
