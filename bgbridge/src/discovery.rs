//! BLE adapter lifecycle and the discovery watchdog.
//!
//! The vendor application drives the chip through reset, setup (reading the
//! BT address) and discovery. Once discovery has started, the chip streams
//! scan responses continuously; if it goes quiet for the watchdog interval the
//! chip process is assumed wedged and is restarted. After a restart the
//! watchdog is re-armed with a longer delay so a chip that never recovers is
//! not restarted in a tight loop.
//!
//! [`DiscoveryStateMachine`] holds the transitions and is driven with explicit
//! timestamps. [`DiscoveryActor`] owns one, feeds it observations from the
//! readers and fires the watchdog.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use strum::Display;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::sink::EventSink;
use crate::tracing::prelude::*;
use crate::types::MacAddr;

/// Default time discovery may stay silent before the chip is restarted.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default minimum time between chip restarts.
pub const RESTART_DELAY: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AdapterState {
    #[default]
    None,
    Reset,
    Setup,
    Discovery,
}

/// What the readers saw that matters to the adapter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Chip boot event. `expected` if the last command sent was a reset.
    Boot { expected: bool },
    /// Response to get-BT-address.
    Address(MacAddr),
    /// The application asked the chip to start discovery.
    DiscoveryRequested,
    /// Any frame from the chip.
    Activity,
}

/// Actions the bridge cannot perform itself.
#[async_trait]
pub trait ChipSupervisor: Send + Sync {
    /// Restart the process that owns the chip.
    async fn restart_chip_process(&self);

    /// Called each time discovery is requested.
    async fn on_discovery_start(&self);
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub timeout: Duration,
    pub restart_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: DISCOVERY_TIMEOUT,
            restart_delay: RESTART_DELAY,
        }
    }
}

pub struct DiscoveryStateMachine {
    state: AdapterState,
    deadline: Option<Instant>,
    config: DiscoveryConfig,
}

impl DiscoveryStateMachine {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            state: AdapterState::None,
            deadline: None,
            config,
        }
    }

    pub fn state(&self) -> AdapterState {
        self.state
    }

    /// When the watchdog fires, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Apply an observation. Returns the new state if it changed.
    pub fn observe(&mut self, observation: Observation, now: Instant) -> Option<AdapterState> {
        let next = match observation {
            Observation::Boot { .. } => AdapterState::Reset,
            Observation::Address(_) => AdapterState::Setup,
            Observation::DiscoveryRequested => {
                self.deadline = Some(now + self.config.timeout);
                AdapterState::Discovery
            }
            Observation::Activity => {
                // Never shortens a pending restart delay
                if let Some(deadline) = self.deadline {
                    self.deadline = Some(deadline.max(now + self.config.timeout));
                }
                self.state
            }
        };
        self.transition(next)
    }

    /// Fire the watchdog if its deadline has passed. Returns true if the chip
    /// should be restarted.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.state = AdapterState::None;
                self.deadline = Some(now + self.config.restart_delay);
                true
            }
            _ => false,
        }
    }

    fn transition(&mut self, next: AdapterState) -> Option<AdapterState> {
        if next == self.state {
            return None;
        }
        self.state = next;
        Some(next)
    }
}

/// Sends observations to a [`DiscoveryActor`] and reads its state.
#[derive(Clone)]
pub struct DiscoveryHandle {
    tx: mpsc::UnboundedSender<Observation>,
    state: watch::Receiver<AdapterState>,
}

impl DiscoveryHandle {
    pub fn observe(&self, observation: Observation) {
        // The actor only goes away at shutdown
        let _ = self.tx.send(observation);
    }

    pub fn state(&self) -> AdapterState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AdapterState> {
        self.state.clone()
    }
}

pub struct DiscoveryActor {
    machine: DiscoveryStateMachine,
    rx: mpsc::UnboundedReceiver<Observation>,
    state_tx: watch::Sender<AdapterState>,
    supervisor: Arc<dyn ChipSupervisor>,
    sink: Arc<dyn EventSink>,
}

impl DiscoveryActor {
    pub fn new(
        config: DiscoveryConfig,
        supervisor: Arc<dyn ChipSupervisor>,
        sink: Arc<dyn EventSink>,
    ) -> (Self, DiscoveryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(AdapterState::None);
        let actor = Self {
            machine: DiscoveryStateMachine::new(config),
            rx,
            state_tx,
            supervisor,
            sink,
        };
        (
            actor,
            DiscoveryHandle {
                tx,
                state: state_rx,
            },
        )
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let deadline = self.machine.deadline();
            tokio::select! {
                _ = shutdown.cancelled() => break,

                observation = self.rx.recv() => match observation {
                    Some(observation) => self.handle(observation).await,
                    None => break,
                },

                _ = async {
                    match deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    if self.machine.expire(Instant::now()) {
                        warn!("Discovery stalled, restarting chip process");
                        self.publish(AdapterState::None);
                        self.supervisor.restart_chip_process().await;
                    }
                }
            }
        }
        debug!("Discovery task stopped.");
    }

    async fn handle(&mut self, observation: Observation) {
        match observation {
            Observation::Boot { expected: false } => {
                warn!("Unexpected chip reset");
            }
            Observation::Address(mac) => {
                info!(%mac, "Gateway BT address");
                self.sink.gateway_address(mac);
            }
            _ => {}
        }

        if let Some(state) = self.machine.observe(observation, Instant::now()) {
            debug!(%state, "Adapter state");
            self.publish(state);
        }

        if observation == Observation::DiscoveryRequested {
            self.supervisor.on_discovery_start().await;
        }
    }

    fn publish(&self, state: AdapterState) {
        self.state_tx.send_replace(state);
        self.sink.adapter_state(state);
    }
}
