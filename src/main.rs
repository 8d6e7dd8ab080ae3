use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;

use lantorrent::{
    conf::Config,
    engine::Engine,
    error::Result,
    metainfo::Metainfo,
};

/// Download and seed a torrent on the local network.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Directory the file is downloaded to and seeded from
    #[arg(short, long, default_value = ".")]
    data_dir: PathBuf,

    /// Port to listen on for peer connections (0 = OS assigned)
    #[arg(short, long, default_value_t = 0)]
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
    let buf = std::fs::read(&cli.torrent)?;
    let metainfo = Metainfo::from_bytes(&buf)?;

    let mut conf = Config::new(cli.data_dir);
    conf.listen_port = cli.port;

    let engine = Engine::spawn(conf, metainfo).await?;

    let store = Arc::clone(engine.store());
    tokio::spawn(async move {
        store.wait_complete().await;
        log::info!("Download complete, seeding");
    });

    tokio::signal::ctrl_c().await?;
    log::info!("Interrupted, shutting down");
    engine.shutdown().await
}
