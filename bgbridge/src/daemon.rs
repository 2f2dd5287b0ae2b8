//! Daemon lifecycle: wiring, signal handling and shutdown.

use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::tracing::prelude::*;
use crate::{
    bridge,
    clock::TokioClock,
    config::BridgeConfig,
    discovery::DiscoveryActor,
    gap::AdvertisementPipeline,
    keys::KeyStore,
    sequencer::CommandSequencer,
    sink::{LogPublisher, TopicSink},
    supervisor::CommandSupervisor,
    transport,
};

/// The main daemon.
pub struct Daemon {
    config: BridgeConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Run until a signal asks us to stop or a link fails.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = &self.config;

        let keys = Arc::new(KeyStore::load_or_empty(&config.keys_path));
        info!(count = keys.len(), path = %config.keys_path.display(), "Loaded bind keys");

        let topics = Arc::new(TopicSink::new(config.topic_prefix.clone(), LogPublisher));
        let supervisor = Arc::new(CommandSupervisor::new(
            config.restart_command.clone(),
            config.patch_command.clone(),
        ));

        let (discovery_actor, discovery) =
            DiscoveryActor::new(config.discovery.clone(), supervisor, topics.clone());
        self.tracker.spawn(discovery_actor.run(self.shutdown.clone()));

        let pipeline = AdvertisementPipeline::new(
            config.pipeline.clone(),
            Arc::new(TokioClock),
            keys.clone(),
            topics.clone(),
            topics,
        );

        let chip = transport::open(&config.chip).context("chip link")?;
        let app = transport::open(&config.app).context("application link")?;
        info!(
            chip = %config.chip.path,
            app = %config.app.path,
            baud = config.chip.baud,
            "Links open"
        );

        self.tracker.spawn({
            let shutdown = self.shutdown.clone();
            let (chip_framing, app_framing) = (config.chip.framing, config.app.framing);
            let scan_timing = config.scan_timing;
            async move {
                let result = bridge::run(
                    chip,
                    chip_framing,
                    app,
                    app_framing,
                    Arc::new(CommandSequencer::new()),
                    discovery,
                    pipeline,
                    scan_timing,
                    shutdown.clone(),
                )
                .await;
                if let Err(e) = result {
                    error!(error = %e, "Bridge stopped");
                }
                // Nothing works without both links
                shutdown.cancel();
            }
        });

        self.tracker.close();

        info!("Started.");
        info!("For debugging, set RUST_LOG=bgbridge=debug or trace.");

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sighup = unix::signal(SignalKind::hangup())?;

        let failed = loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT.");
                    break false;
                },
                _ = sigterm.recv() => {
                    info!("Received SIGTERM.");
                    break false;
                },
                _ = sighup.recv() => {
                    match keys.reload() {
                        Ok(count) => info!(count, "Reloaded bind keys"),
                        Err(e) => warn!(error = %e, "Failed to reload bind keys"),
                    }
                },
                _ = self.shutdown.cancelled() => break true,
            }
        };

        self.shutdown.cancel();
        self.tracker.wait().await;
        info!("Exiting.");

        if failed {
            bail!("bridge stopped");
        }
        Ok(())
    }
}
