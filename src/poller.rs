//! Periodic pollers.
//!
//! A poller enqueues the same command on every tick of a fixed interval,
//! whether or not the previous poll has completed. Overlapping polls are
//! resolved by the store like any other overlapping operation.
//!
//! Stopping a poller only stops future ticks. Polls already handed to the
//! orchestrator run to completion and their outcomes are applied.

use crate::config::PollingConfig;
use crate::events::{Actuator, Command};
use crate::orchestrator::OrchestratorHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Start/stop handle for one poller task.
///
/// Dropping the handle aborts the task.
pub struct PollerHandle {
    command: Command,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Spawn a poller enqueuing `command` every `interval`.
    ///
    /// The first command is enqueued immediately.
    pub fn start(orchestrator: OrchestratorHandle, command: Command, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task_command = command.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!(command = task_command.name(), ?interval, "poller started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if orchestrator.enqueue(task_command.clone()).await.is_err() {
                            debug!(command = task_command.name(), "orchestrator closed, poller exiting");
                            break;
                        }
                    }
                }
            }
            debug!(command = task_command.name(), "poller stopped");
        });

        Self {
            command,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Command this poller issues.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Signal the poller to stop. No further commands are enqueued after it
    /// observes the signal.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Stop the poller and wait for its task to exit.
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// True while the poller task is alive.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Pollers stopped as a unit.
#[derive(Default)]
pub struct PollerSet {
    pollers: Vec<PollerHandle>,
}

impl PollerSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the pollers enabled in `config`.
    pub fn from_config(orchestrator: OrchestratorHandle, config: &PollingConfig) -> Self {
        let mut set = Self::new();
        let interval = config.interval();
        if config.heat_plate {
            set.start(
                orchestrator.clone(),
                Command::PollActuator(Actuator::HeatPlate),
                interval,
            );
        }
        if config.motor {
            set.start(
                orchestrator.clone(),
                Command::PollActuator(Actuator::Motor),
                interval,
            );
        }
        if config.temperature {
            set.start(orchestrator, Command::PollTemperature, interval);
        }
        info!(pollers = set.len(), ?interval, "pollers started");
        set
    }

    /// Start one more poller.
    pub fn start(&mut self, orchestrator: OrchestratorHandle, command: Command, interval: Duration) {
        self.pollers
            .push(PollerHandle::start(orchestrator, command, interval));
    }

    /// Number of pollers in the set.
    pub fn len(&self) -> usize {
        self.pollers.len()
    }

    /// True if the set holds no pollers.
    pub fn is_empty(&self) -> bool {
        self.pollers.is_empty()
    }

    /// True while any poller is alive.
    pub fn is_running(&self) -> bool {
        self.pollers.iter().any(PollerHandle::is_running)
    }

    /// Stop every poller and wait for them to exit.
    pub async fn stop_all(&mut self) {
        for poller in &mut self.pollers {
            debug!(command = poller.command().name(), "stopping poller");
            poller.stop();
        }
        for poller in self.pollers.drain(..) {
            poller.join().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MockDeviceApi, Operation};
    use crate::config::OrchestratorConfig;
    use crate::orchestrator::Orchestrator;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn polls_every_tick_until_stopped() {
        let api = Arc::new(MockDeviceApi::new());
        let handle = Orchestrator::spawn(api.clone(), &OrchestratorConfig::default());

        let mut poller = PollerHandle::start(
            handle.clone(),
            Command::PollTemperature,
            Duration::from_millis(100),
        );
        assert!(poller.is_running());

        // Ticks at 0, 100, 200 and 300 ms.
        tokio::time::sleep(Duration::from_millis(350)).await;
        poller.stop();
        poller.join().await;
        handle.settle().await.unwrap();
        let polls = api.call_count(Operation::Temperature);
        assert_eq!(polls, 4);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(api.call_count(Operation::Temperature), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn config_toggles_select_pollers() {
        let api = Arc::new(MockDeviceApi::new());
        let handle = Orchestrator::spawn(api, &OrchestratorConfig::default());
        let config = PollingConfig {
            motor: false,
            ..PollingConfig::default()
        };

        let mut set = PollerSet::from_config(handle, &config);
        assert_eq!(set.len(), 2);
        assert!(set.is_running());
        let commands: Vec<&Command> = set.pollers.iter().map(PollerHandle::command).collect();
        assert_eq!(
            commands,
            [
                &Command::PollActuator(Actuator::HeatPlate),
                &Command::PollTemperature
            ]
        );
        set.stop_all().await;
        assert!(set.is_empty());
    }
}
