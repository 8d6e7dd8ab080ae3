//! Engine assembly: wires the piece store, the supervisor and the tracker
//! client together and owns their lifecycle.

use std::sync::Arc;

use tokio::{sync::watch, task::JoinHandle};

use crate::{
    conf::Config,
    counter::ThruputCounters,
    error::{Error, Result},
    metainfo::Metainfo,
    store::PieceStore,
    torrent::Torrent,
};

/// A running peer engine for one torrent.
///
/// Spawning returns immediately; the engine downloads and seeds in the
/// background until [`shutdown`](Engine::shutdown) is called.
pub struct Engine {
    store: Arc<PieceStore>,
    counters: Arc<ThruputCounters>,
    listen_port: u16,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<Result<()>>,
}

impl Engine {
    /// Opens (or resumes) the download in the configured data directory,
    /// binds the peer listener and joins the swarm.
    ///
    /// Must be called within a tokio runtime.
    pub async fn spawn(conf: Config, metainfo: Metainfo) -> Result<Self> {
        log::info!(
            "Starting engine for {} ({})",
            metainfo.name,
            hex::encode(metainfo.info_hash)
        );
        let store = Arc::new(PieceStore::open(
            &metainfo,
            &conf.data_dir,
            conf.request_timeout,
        )?);
        let counters = Arc::new(ThruputCounters::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut torrent = Torrent::bind(
            conf,
            &metainfo,
            Arc::clone(&store),
            Arc::clone(&counters),
            shutdown_rx,
        )
        .await?;
        let listen_port = torrent.listen_port();
        let supervisor = tokio::spawn(async move { torrent.run().await });

        Ok(Self {
            store,
            counters,
            listen_port,
            shutdown: shutdown_tx,
            supervisor,
        })
    }

    /// The port the engine accepts peer connections on.
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// The engine's piece store; lets callers observe download progress.
    pub fn store(&self) -> &Arc<PieceStore> {
        &self.store
    }

    /// Total payload bytes uploaded to peers so far.
    pub fn uploaded(&self) -> u64 {
        self.counters.up()
    }

    /// Total payload bytes downloaded from peers so far.
    pub fn downloaded(&self) -> u64 {
        self.counters.down()
    }

    /// Resolves once the local bitfield is all ones. The engine keeps
    /// seeding afterwards.
    pub async fn wait_complete(&self) {
        self.store.wait_complete().await;
    }

    /// Signals shutdown and waits for the wind-down: sessions close, the
    /// tracker gets a best-effort `stopped`, the store is flushed.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        match self.supervisor.await {
            Ok(result) => result,
            Err(e) => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("supervisor task failed: {}", e),
            ))),
        }
    }
}
