//! The orchestrator actor.
//!
//! [`Orchestrator`] is the single owner of the [`Store`]. It runs in its own
//! task and is the only place where events are applied, one at a time:
//!
//! ```text
//! handle / pollers ──Command──> Orchestrator ──Effect──> EffectRunner ──> DeviceApi
//!                                   ^   │                     │
//!                                   │   └──snapshot (watch)   │
//!                                   └────────Event (mpsc)─────┘
//! ```
//!
//! On every accepted command it validates against the current store, applies
//! the matching `*Requested` event and hands the effect to the runner. Outcome
//! events come back on a channel and are applied in arrival order. After every
//! application the new snapshot is published on a `watch` channel.
//!
//! Port initialize and shutdown are admission-controlled: a command for a port
//! that already has an operation in flight is rejected with
//! [`CommandError::PortBusy`]. Actuator and sensor commands are never rejected;
//! overlapping calls all run and the last outcome applied wins.
//!
//! ## Shutdown
//!
//! 1. [`OrchestratorHandle::shutdown`] (or dropping every handle)
//! 2. Pending outcomes keep being applied until the runner is idle
//! 3. After the configured timeout, remaining calls are aborted and a
//!    `*Failed` outcome with [`ABORTED_AT_SHUTDOWN`] is applied for each, so
//!    the final snapshot carries no busy or loading flags
//! 4. The event loop exits and the shutdown is acknowledged

use crate::api::DeviceApi;
use crate::config::{OrchestratorConfig, PollingConfig};
use crate::error::{CommandError, ValidationError};
use crate::events::{Actuator, Command, Event, PortEvent, ResourceKey, Switch};
use crate::messages::OrchestratorMessage;
use crate::poller::PollerSet;
use crate::runner::{Effect, EffectRunner};
use crate::session::SessionParams;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Failure reason applied to operations aborted by shutdown.
pub const ABORTED_AT_SHUTDOWN: &str = "aborted at shutdown";

const TASK_PANICKED: &str = "operation task panicked";

/// Owner of the store and the effect runner.
pub struct Orchestrator {
    store: Store,
    runner: EffectRunner,
    events: mpsc::Receiver<Event>,
    snapshots: watch::Sender<Store>,
    settle_waiters: Vec<oneshot::Sender<Store>>,
    shutdown_timeout: Duration,
}

impl Orchestrator {
    /// Build the actor and its handle without spawning it.
    pub fn new(
        api: Arc<dyn DeviceApi>,
        config: &OrchestratorConfig,
    ) -> (Self, OrchestratorHandle, mpsc::Receiver<OrchestratorMessage>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (snapshot_tx, snapshot_rx) = watch::channel(Store::new());

        let actor = Self {
            store: Store::new(),
            runner: EffectRunner::new(api, event_tx),
            events: event_rx,
            snapshots: snapshot_tx,
            settle_waiters: Vec::new(),
            shutdown_timeout: config.shutdown_timeout(),
        };
        let handle = OrchestratorHandle {
            tx: command_tx,
            snapshots: snapshot_rx,
        };
        (actor, handle, command_rx)
    }

    /// Spawn the actor on the current runtime and return its handle.
    pub fn spawn(api: Arc<dyn DeviceApi>, config: &OrchestratorConfig) -> OrchestratorHandle {
        let (actor, handle, commands) = Self::new(api, config);
        tokio::spawn(actor.run(commands));
        handle
    }

    /// Run the event loop until shutdown.
    pub async fn run(mut self, mut commands: mpsc::Receiver<OrchestratorMessage>) {
        info!("orchestrator started");

        loop {
            tokio::select! {
                biased;

                Some(event) = self.events.recv() => {
                    self.apply(event);
                }

                Some(()) = self.runner.join_next() => {
                    self.fail_abandoned(TASK_PANICKED);
                    self.notify_if_settled();
                }

                message = commands.recv() => match message {
                    Some(OrchestratorMessage::Submit { command, response }) => {
                        let result = self.submit(command);
                        if let Some(response) = response {
                            let _ = response.send(result);
                        }
                    }
                    Some(OrchestratorMessage::Settle { response }) => {
                        self.settle_waiters.push(response);
                        self.notify_if_settled();
                    }
                    Some(OrchestratorMessage::Shutdown { response }) => {
                        info!("shutdown requested");
                        self.shutdown().await;
                        let _ = response.send(());
                        break;
                    }
                    None => {
                        info!("all handles dropped, shutting down");
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        info!("orchestrator stopped");
    }

    fn submit(&mut self, command: Command) -> Result<(), CommandError> {
        let name = command.name();
        let effect = match self.resolve(command) {
            Ok(effect) => effect,
            Err(err) => {
                warn!(command = name, error = %err, "command rejected");
                return Err(err);
            }
        };
        debug!(command = name, resource = %effect.key(), "dispatching");
        self.apply(effect.requested());
        self.runner.spawn(effect);
        Ok(())
    }

    /// Check a command against the current store and turn it into an effect.
    fn resolve(&self, command: Command) -> Result<Effect, CommandError> {
        Ok(match command {
            Command::FetchPorts => Effect::FetchPorts,
            Command::InitPort { port, params } => {
                params.validate()?;
                self.admit_port(&port)?;
                Effect::InitPort { port, params }
            }
            Command::ShutdownPort { port } => {
                let entry = self.admit_port(&port)?;
                let baudrate = entry
                    .remote
                    .as_ref()
                    .map_or(entry.baudrate, |remote| remote.baudrate);
                Effect::ShutdownPort { port, baudrate }
            }
            Command::SetRelay { actuator, switch } => Effect::SetRelay { actuator, switch },
            Command::PollActuator(actuator) => Effect::PollActuator(actuator),
            Command::PollTemperature => Effect::PollTemperature,
            Command::FetchRemotes => Effect::FetchRemotes,
        })
    }

    fn admit_port(&self, name: &str) -> Result<&crate::store::Port, CommandError> {
        if name.trim().is_empty() {
            return Err(ValidationError::PortName(name.to_string()).into());
        }
        let port = self
            .store
            .port(name)
            .ok_or_else(|| CommandError::UnknownPort(name.to_string()))?;
        if port.busy || self.runner.in_flight(&ResourceKey::Port(name.to_string())) > 0 {
            return Err(CommandError::PortBusy(name.to_string()));
        }
        Ok(port)
    }

    fn apply(&mut self, event: Event) {
        if event.is_failure() {
            debug!(resource = %event.key(), "applying failure");
        }
        self.store.apply(&event);
        if matches!(event, Event::Port(PortEvent::FetchSucceeded(_))) {
            self.remark_port_operations();
        }
        self.snapshots.send_replace(self.store.clone());
    }

    /// A refresh rebuilds every port entry. Re-apply the `*Requested` event of
    /// each port call still running so its entry stays busy and keeps the
    /// parameters its outcome will be applied against.
    fn remark_port_operations(&mut self) {
        for effect in self.runner.running() {
            if let ResourceKey::Port(port) = effect.key() {
                debug!(port = %port, "port operation still in flight after refresh");
                self.store.apply(&effect.requested());
            }
        }
    }

    /// Apply a failure for every effect whose task ended without an outcome.
    fn fail_abandoned(&mut self, reason: &str) {
        for effect in self.runner.take_abandoned() {
            warn!(resource = %effect.key(), reason, "operation ended without an outcome");
            self.apply(effect.failed(reason));
        }
    }

    fn notify_if_settled(&mut self) {
        if self.settle_waiters.is_empty() || !self.runner.is_idle() {
            return;
        }
        // Every finished task sent its outcome before exiting.
        while let Ok(event) = self.events.try_recv() {
            self.apply(event);
        }
        for waiter in self.settle_waiters.drain(..) {
            let _ = waiter.send(self.store.clone());
        }
    }

    async fn drain(&mut self) {
        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.apply(event),
                reaped = self.runner.join_next() => {
                    if reaped.is_none() {
                        break;
                    }
                    self.fail_abandoned(TASK_PANICKED);
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        let in_flight = self.runner.len();
        if in_flight > 0 {
            info!(in_flight, "waiting for in-flight operations");
        }
        if tokio::time::timeout(self.shutdown_timeout, self.drain())
            .await
            .is_err()
        {
            warn!(
                remaining = self.runner.len(),
                "in-flight operations did not finish in time, aborting"
            );
            self.runner.abort_all();
            while self.runner.join_next().await.is_some() {}
        }
        while let Ok(event) = self.events.try_recv() {
            self.apply(event);
        }
        self.fail_abandoned(ABORTED_AT_SHUTDOWN);
        for waiter in self.settle_waiters.drain(..) {
            let _ = waiter.send(self.store.clone());
        }
    }
}

/// Cloneable front end to a running [`Orchestrator`].
#[derive(Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorMessage>,
    snapshots: watch::Receiver<Store>,
}

impl OrchestratorHandle {
    /// Submit a command and wait until it is accepted or rejected.
    pub async fn submit(&self, command: Command) -> Result<(), CommandError> {
        let (message, rx) = OrchestratorMessage::submit(command);
        self.tx
            .send(message)
            .await
            .map_err(|_| CommandError::Closed)?;
        rx.await.map_err(|_| CommandError::Closed)?
    }

    /// Submit a command without waiting for acceptance.
    pub async fn enqueue(&self, command: Command) -> Result<(), CommandError> {
        self.tx
            .send(OrchestratorMessage::enqueue(command))
            .await
            .map_err(|_| CommandError::Closed)
    }

    /// Refresh the port list.
    pub async fn fetch_ports(&self) -> Result<(), CommandError> {
        self.submit(Command::FetchPorts).await
    }

    /// Open a remote session on `port`.
    pub async fn init_port(
        &self,
        port: impl Into<String>,
        params: SessionParams,
    ) -> Result<(), CommandError> {
        self.submit(Command::InitPort {
            port: port.into(),
            params,
        })
        .await
    }

    /// Close the remote session on `port`.
    pub async fn shutdown_port(&self, port: impl Into<String>) -> Result<(), CommandError> {
        self.submit(Command::ShutdownPort { port: port.into() })
            .await
    }

    /// Switch an actuator relay.
    pub async fn set_relay(&self, actuator: Actuator, switch: Switch) -> Result<(), CommandError> {
        self.submit(Command::SetRelay { actuator, switch }).await
    }

    /// Read back an actuator's relay state.
    pub async fn poll_actuator(&self, actuator: Actuator) -> Result<(), CommandError> {
        self.submit(Command::PollActuator(actuator)).await
    }

    /// Read the temperature probe.
    pub async fn poll_temperature(&self) -> Result<(), CommandError> {
        self.submit(Command::PollTemperature).await
    }

    /// Refresh the remote listing.
    pub async fn fetch_remotes(&self) -> Result<(), CommandError> {
        self.submit(Command::FetchRemotes).await
    }

    /// New receiver for store snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Store> {
        self.snapshots.clone()
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Store {
        self.snapshots.borrow().clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_until<F>(&self, mut predicate: F) -> Result<Store, CommandError>
    where
        F: FnMut(&Store) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let store = rx
            .wait_for(|store| predicate(store))
            .await
            .map_err(|_| CommandError::Closed)?;
        Ok(store.clone())
    }

    /// Wait until nothing is in flight and return the resulting store.
    pub async fn settle(&self) -> Result<Store, CommandError> {
        let (message, rx) = OrchestratorMessage::settle();
        self.tx
            .send(message)
            .await
            .map_err(|_| CommandError::Closed)?;
        rx.await.map_err(|_| CommandError::Closed)
    }

    /// Start the pollers enabled in `config`.
    pub fn start_pollers(&self, config: &PollingConfig) -> PollerSet {
        PollerSet::from_config(self.clone(), config)
    }

    /// Stop the orchestrator and wait for it to drain.
    pub async fn shutdown(&self) -> Result<(), CommandError> {
        let (message, rx) = OrchestratorMessage::shutdown();
        self.tx
            .send(message)
            .await
            .map_err(|_| CommandError::Closed)?;
        rx.await.map_err(|_| CommandError::Closed)
    }

    /// True once the orchestrator task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MockDeviceApi, Operation};
    use crate::store::PortStatus;

    fn spawn(api: &Arc<MockDeviceApi>) -> OrchestratorHandle {
        Orchestrator::spawn(api.clone(), &OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn unknown_port_is_rejected_without_a_call() {
        let api = Arc::new(MockDeviceApi::with_ports(["COM1"]));
        let handle = spawn(&api);

        let err = handle
            .init_port("COM1", SessionParams::default())
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::UnknownPort("COM1".into()));
        assert_eq!(api.call_count(Operation::InitPort), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_init_on_a_busy_port_is_rejected() {
        let api = Arc::new(MockDeviceApi::with_ports(["COM1"]));
        api.delay_next(Operation::InitPort, Duration::from_millis(100));
        let handle = spawn(&api);
        handle.fetch_ports().await.unwrap();
        handle.settle().await.unwrap();

        handle
            .init_port("COM1", SessionParams::default())
            .await
            .unwrap();
        assert!(handle.snapshot().ports["COM1"].busy);
        assert_eq!(
            handle.init_port("COM1", SessionParams::default()).await,
            Err(CommandError::PortBusy("COM1".into()))
        );
        assert_eq!(
            handle.shutdown_port("COM1").await,
            Err(CommandError::PortBusy("COM1".into()))
        );

        let store = handle.settle().await.unwrap();
        assert_eq!(store.ports["COM1"].status, PortStatus::Connected);
        assert_eq!(api.call_count(Operation::InitPort), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_during_init_keeps_the_port_busy() {
        let api = Arc::new(MockDeviceApi::with_ports(["COM1"]));
        api.delay_next(Operation::InitPort, Duration::from_millis(100));
        let handle = spawn(&api);
        handle.fetch_ports().await.unwrap();
        handle.settle().await.unwrap();

        handle
            .init_port("COM1", SessionParams::with_baudrate(9600))
            .await
            .unwrap();
        handle.fetch_ports().await.unwrap();
        let store = handle.wait_until(|store| !store.loading).await.unwrap();
        let port = &store.ports["COM1"];
        assert!(port.busy);
        assert_eq!(port.status, PortStatus::Connecting);
        assert_eq!(port.pending.as_ref().map(|p| p.baudrate), Some(9600));
    }

    #[tokio::test]
    async fn shutdown_uses_the_session_baudrate() {
        let api = Arc::new(MockDeviceApi::with_ports(["COM1"]));
        let handle = spawn(&api);
        handle.fetch_ports().await.unwrap();
        handle.settle().await.unwrap();

        handle
            .init_port("COM1", SessionParams::with_baudrate(9600))
            .await
            .unwrap();
        handle.settle().await.unwrap();
        handle.shutdown_port("COM1").await.unwrap();

        let store = handle.settle().await.unwrap();
        let port = &store.ports["COM1"];
        assert_eq!(port.status, PortStatus::Offline);
        assert!(port.session.is_none());
        assert!(port.last_error.is_none());
        assert!(api.sessions().is_empty());
    }

    #[tokio::test]
    async fn handle_reports_closed_after_shutdown() {
        let api = Arc::new(MockDeviceApi::new());
        let handle = spawn(&api);
        handle.shutdown().await.unwrap();
        assert_eq!(handle.fetch_ports().await, Err(CommandError::Closed));
    }
}
