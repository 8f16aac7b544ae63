//! CertServ daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;
use tokio::sync::mpsc;

mod channel;
mod commands;
mod config;
mod discovery;
mod engine;
mod prober;
mod scheduler;
mod stats;
mod store;
mod types;

use channel::{ControlChannel, IrcChannel};
use config::Config;
use engine::{now_millis, Engine};
use prober::TlsProber;
use store::{JsonFile, StateStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Arc::new(Config::load()?);
    info!("Starting CertServ with config: {:?}", cfg);

    // Persisted state; a malformed file is fatal
    let mut file = JsonFile::new(cfg.data_file.clone());
    let committed = file.load_or_init(now_millis())?;
    info!(
        "Loaded state from {}: {} servers, {} with expiry data",
        file.path().display(),
        committed.network_state.len(),
        committed.expiry_state.len()
    );
    let store = StateStore::new(committed, Box::new(file));

    let prober = Arc::new(TlsProber::new(cfg.probe_timeout())?);

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    // Engine
    let engine = Engine::new(
        Arc::clone(&cfg),
        store,
        prober,
        events_tx.clone(),
        outbound_tx,
    );
    let mut engine_handle = tokio::spawn(engine.run(events_rx));

    // Control channel
    let channel = IrcChannel::new(Arc::clone(&cfg));
    let channel_handle = tokio::spawn(async move {
        if let Err(e) = channel.run(events_tx, outbound_rx).await {
            error!("Control channel failed: {}", e);
        }
    });

    // Run until Ctrl+C or the engine stops
    let result = tokio::select! {
        res = signal::ctrl_c() => {
            match res {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
            Ok(())
        }
        res = &mut engine_handle => match res {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::anyhow!("Engine failed: {}", e)),
            Err(e) => Err(anyhow::anyhow!("Engine task panicked: {}", e)),
        },
    };

    // Abort tasks
    engine_handle.abort();
    channel_handle.abort();

    info!("Shutdown complete.");
    result
}
