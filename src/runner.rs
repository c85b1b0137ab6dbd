//! Effect runner: performs backend calls and reports their outcomes.
//!
//! The runner owns no state about resources. For every accepted command the
//! orchestrator hands it an [`Effect`]; the runner spawns one task that calls
//! the [`DeviceApi`] and posts the resulting `*Succeeded`/`*Failed` [`Event`] on
//! the event channel. Tasks for different resources run concurrently, and so
//! do overlapping tasks for the same resource: nothing is dropped or
//! cancelled, and the store resolves the race by applying outcomes in the
//! order they arrive.
//!
//! The runner keeps a ledger of running effects with a count per
//! [`ResourceKey`]. The orchestrator reads it for port admission control. A
//! task that ends without posting its outcome (aborted at shutdown, or
//! panicked) leaves its effect in the ledger's abandoned list so the caller
//! can apply a failure for it instead. The runner never retries; a poller
//! re-issuing the same command on its next tick is the only retry policy.

use crate::api::DeviceApi;
use crate::events::{
    Actuator, ActuatorEvent, Event, PortEvent, RemotesEvent, ResourceKey, SensorEvent, Switch,
};
use crate::session::SessionParams;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, trace, warn, Instrument};

/// A command resolved against the store, ready to run.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// `list-ports`
    FetchPorts,
    /// `{port}/{baudrate}/new`
    InitPort {
        /// Port name
        port: String,
        /// Validated parameters
        params: SessionParams,
    },
    /// `{port}/{baudrate}/shutdown`
    ShutdownPort {
        /// Port name
        port: String,
        /// Baudrate the session was opened with
        baudrate: u32,
    },
    /// `{actuator}/{on|off}`
    SetRelay {
        /// Target actuator
        actuator: Actuator,
        /// Desired position
        switch: Switch,
    },
    /// `{actuator}`
    PollActuator(Actuator),
    /// `temp`
    PollTemperature,
    /// `list-remotes`
    FetchRemotes,
}

impl Effect {
    /// Resource the effect operates on.
    pub fn key(&self) -> ResourceKey {
        match self {
            Effect::FetchPorts => ResourceKey::PortList,
            Effect::InitPort { port, .. } | Effect::ShutdownPort { port, .. } => {
                ResourceKey::Port(port.clone())
            }
            Effect::SetRelay { actuator, .. } | Effect::PollActuator(actuator) => {
                ResourceKey::Actuator(*actuator)
            }
            Effect::PollTemperature => ResourceKey::Temperature,
            Effect::FetchRemotes => ResourceKey::Remotes,
        }
    }

    /// The `*Requested` event marking this effect as dispatched.
    pub fn requested(&self) -> Event {
        match self {
            Effect::FetchPorts => Event::Port(PortEvent::FetchRequested),
            Effect::InitPort { port, params } => Event::Port(PortEvent::InitRequested {
                port: port.clone(),
                params: params.clone(),
            }),
            Effect::ShutdownPort { port, .. } => {
                Event::Port(PortEvent::ShutdownRequested { port: port.clone() })
            }
            Effect::SetRelay { actuator, switch } => {
                Event::Actuator(*actuator, ActuatorEvent::CommandRequested(*switch))
            }
            Effect::PollActuator(actuator) => {
                Event::Actuator(*actuator, ActuatorEvent::PollRequested)
            }
            Effect::PollTemperature => Event::Temperature(SensorEvent::Requested),
            Effect::FetchRemotes => Event::Remotes(RemotesEvent::Requested),
        }
    }

    /// The `*Failed` outcome for this effect with `reason`.
    pub fn failed(&self, reason: &str) -> Event {
        let reason = reason.to_string();
        match self {
            Effect::FetchPorts => Event::Port(PortEvent::FetchFailed(reason)),
            Effect::InitPort { port, .. } => Event::Port(PortEvent::InitFailed {
                port: port.clone(),
                error: reason,
            }),
            Effect::ShutdownPort { port, .. } => Event::Port(PortEvent::ShutdownFailed {
                port: port.clone(),
                error: reason,
            }),
            Effect::SetRelay { actuator, .. } => {
                Event::Actuator(*actuator, ActuatorEvent::CommandFailed(reason))
            }
            Effect::PollActuator(actuator) => {
                Event::Actuator(*actuator, ActuatorEvent::PollFailed(reason))
            }
            Effect::PollTemperature => Event::Temperature(SensorEvent::Failed(reason)),
            Effect::FetchRemotes => Event::Remotes(RemotesEvent::Failed(reason)),
        }
    }
}

/// Perform one effect against the backend and map the result to its outcome event.
pub async fn execute(api: &dyn DeviceApi, effect: Effect) -> Event {
    match effect {
        Effect::FetchPorts => Event::Port(match api.list_ports().await {
            Ok(names) => PortEvent::FetchSucceeded(names),
            Err(err) => PortEvent::FetchFailed(err.to_string()),
        }),
        Effect::InitPort { port, params } => Event::Port(match api.init_port(&port, &params).await {
            Ok(session) => PortEvent::InitSucceeded { port, session },
            Err(err) => PortEvent::InitFailed {
                port,
                error: err.to_string(),
            },
        }),
        Effect::ShutdownPort { port, baudrate } => {
            Event::Port(match api.shutdown_port(&port, baudrate).await {
                Ok(()) => PortEvent::ShutdownSucceeded { port },
                Err(err) => PortEvent::ShutdownFailed {
                    port,
                    error: err.to_string(),
                },
            })
        }
        Effect::SetRelay { actuator, switch } => Event::Actuator(
            actuator,
            match api.send_actuator_command(actuator, switch).await {
                Ok(state) => ActuatorEvent::CommandSucceeded(state),
                Err(err) => ActuatorEvent::CommandFailed(err.to_string()),
            },
        ),
        Effect::PollActuator(actuator) => Event::Actuator(
            actuator,
            match api.actuator_state(actuator).await {
                Ok(state) => ActuatorEvent::PollSucceeded(state),
                Err(err) => ActuatorEvent::PollFailed(err.to_string()),
            },
        ),
        Effect::PollTemperature => Event::Temperature(match api.sensor_state().await {
            Ok(reading) => SensorEvent::Succeeded(reading),
            Err(err) => SensorEvent::Failed(err.to_string()),
        }),
        Effect::FetchRemotes => Event::Remotes(match api.list_remotes().await {
            Ok(remotes) => RemotesEvent::Succeeded(remotes),
            Err(err) => RemotesEvent::Failed(err.to_string()),
        }),
    }
}

#[derive(Debug, Default)]
struct Ledger {
    next_id: u64,
    running: HashMap<u64, Effect>,
    counts: HashMap<ResourceKey, usize>,
    abandoned: Vec<Effect>,
}

impl Ledger {
    fn insert(&mut self, effect: Effect) -> (u64, usize) {
        let id = self.next_id;
        self.next_id += 1;
        let count = self.counts.entry(effect.key()).or_insert(0);
        *count += 1;
        let in_flight = *count;
        self.running.insert(id, effect);
        (id, in_flight)
    }

    fn remove(&mut self, id: u64, completed: bool) {
        let Some(effect) = self.running.remove(&id) else {
            return;
        };
        let key = effect.key();
        if let Some(count) = self.counts.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(&key);
            }
        }
        if !completed {
            self.abandoned.push(effect);
        }
    }
}

type SharedLedger = Arc<Mutex<Ledger>>;

/// Removes its effect from the ledger when the task ends, however it ends.
struct InFlightGuard {
    id: u64,
    ledger: SharedLedger,
    completed: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ledger.lock().remove(self.id, self.completed);
    }
}

/// Concurrent executor for effects.
pub struct EffectRunner {
    api: Arc<dyn DeviceApi>,
    events: mpsc::Sender<Event>,
    ledger: SharedLedger,
    tasks: JoinSet<()>,
}

impl EffectRunner {
    /// Runner posting outcomes on `events`.
    pub fn new(api: Arc<dyn DeviceApi>, events: mpsc::Sender<Event>) -> Self {
        Self {
            api,
            events,
            ledger: Arc::new(Mutex::new(Ledger::default())),
            tasks: JoinSet::new(),
        }
    }

    /// Spawn a task for `effect`. Overlapping effects on the same key are allowed.
    pub fn spawn(&mut self, effect: Effect) {
        let key = effect.key();
        let (id, in_flight) = self.ledger.lock().insert(effect.clone());
        if in_flight > 1 {
            debug!(resource = %key, in_flight, "overlapping operation dispatched");
        }

        let mut guard = InFlightGuard {
            id,
            ledger: self.ledger.clone(),
            completed: false,
        };
        let api = self.api.clone();
        let events = self.events.clone();
        let span = tracing::debug_span!("effect", resource = %key);

        self.tasks.spawn(
            async move {
                let outcome = execute(api.as_ref(), effect).await;
                if outcome.is_failure() {
                    warn!(?outcome, "operation failed");
                } else {
                    trace!(?outcome, "operation completed");
                }
                if events.send(outcome).await.is_err() {
                    debug!("event channel closed, outcome dropped");
                }
                guard.completed = true;
            }
            .instrument(span),
        );
    }

    /// Number of operations in flight for `key`.
    pub fn in_flight(&self, key: &ResourceKey) -> usize {
        self.ledger.lock().counts.get(key).copied().unwrap_or(0)
    }

    /// Effects still running, oldest first.
    pub fn running(&self) -> Vec<Effect> {
        let ledger = self.ledger.lock();
        let mut running: Vec<(&u64, &Effect)> = ledger.running.iter().collect();
        running.sort_by_key(|(id, _)| **id);
        running.into_iter().map(|(_, effect)| effect.clone()).collect()
    }

    /// Take the effects whose tasks ended without posting an outcome.
    pub fn take_abandoned(&self) -> Vec<Effect> {
        std::mem::take(&mut self.ledger.lock().abandoned)
    }

    /// Total number of running tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True when nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Reap the next finished task. Returns `None` when nothing is running.
    pub async fn join_next(&mut self) -> Option<()> {
        match self.tasks.join_next().await? {
            Ok(()) => Some(()),
            Err(err) if err.is_cancelled() => Some(()),
            Err(err) => {
                warn!(error = %err, "effect task panicked");
                Some(())
            }
        }
    }

    /// Abort every running task. Their outcomes are never posted; the
    /// effects show up in [`take_abandoned`](Self::take_abandoned) once reaped.
    pub fn abort_all(&mut self) {
        self.tasks.abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{MockDeviceApi, Operation};
    use crate::error::ApiError;
    use crate::store::RelayState;
    use std::time::Duration;

    #[tokio::test]
    async fn failures_become_failed_events() {
        let api = MockDeviceApi::new();
        api.fail_next(
            Operation::ActuatorCommand(Actuator::HeatPlate),
            ApiError::Timeout(Duration::from_secs(2)),
        );
        let outcome = execute(
            &api,
            Effect::SetRelay {
                actuator: Actuator::HeatPlate,
                switch: Switch::On,
            },
        )
        .await;
        assert_eq!(
            outcome,
            Event::Actuator(
                Actuator::HeatPlate,
                ActuatorEvent::CommandFailed("request timed out after 2s".into())
            )
        );
    }

    #[tokio::test]
    async fn success_carries_payload() {
        let api = MockDeviceApi::new();
        api.set_relay(Actuator::Motor, RelayState::On);
        let outcome = execute(&api, Effect::PollActuator(Actuator::Motor)).await;
        assert_eq!(
            outcome,
            Event::Actuator(Actuator::Motor, ActuatorEvent::PollSucceeded(RelayState::On))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_overlapping_operations_per_key() {
        let api = Arc::new(MockDeviceApi::new());
        api.delay_next(Operation::Temperature, Duration::from_millis(50));
        api.delay_next(Operation::Temperature, Duration::from_millis(50));
        let (tx, mut rx) = mpsc::channel(8);
        let mut runner = EffectRunner::new(api.clone(), tx);

        runner.spawn(Effect::PollTemperature);
        runner.spawn(Effect::PollTemperature);
        runner.spawn(Effect::PollActuator(Actuator::Motor));
        assert_eq!(runner.in_flight(&ResourceKey::Temperature), 2);
        assert_eq!(runner.len(), 3);

        for _ in 0..3 {
            assert!(rx.recv().await.is_some());
        }
        while runner.join_next().await.is_some() {}
        assert!(runner.is_idle());
        assert_eq!(runner.in_flight(&ResourceKey::Temperature), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_effects_are_reported_as_abandoned() {
        let api = Arc::new(MockDeviceApi::with_ports(["COM1"]));
        api.delay_next(Operation::InitPort, Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(8);
        let mut runner = EffectRunner::new(api.clone(), tx);

        let init = Effect::InitPort {
            port: "COM1".into(),
            params: SessionParams::default(),
        };
        runner.spawn(init.clone());
        runner.spawn(Effect::PollTemperature);
        assert_eq!(runner.running(), vec![init.clone(), Effect::PollTemperature]);

        // The temperature read finishes normally.
        assert!(matches!(rx.recv().await, Some(Event::Temperature(_))));
        runner.join_next().await;
        assert_eq!(runner.running(), vec![init.clone()]);

        runner.abort_all();
        while runner.join_next().await.is_some() {}
        assert_eq!(runner.take_abandoned(), vec![init]);
        assert!(runner.take_abandoned().is_empty());
        assert_eq!(runner.in_flight(&ResourceKey::Port("COM1".into())), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failed_outcome_matches_the_effect() {
        let shutdown = Effect::ShutdownPort {
            port: "COM1".into(),
            baudrate: 9600,
        };
        assert_eq!(
            shutdown.failed("aborted"),
            Event::Port(PortEvent::ShutdownFailed {
                port: "COM1".into(),
                error: "aborted".into()
            })
        );
        assert_eq!(
            Effect::SetRelay {
                actuator: Actuator::Motor,
                switch: Switch::On
            }
            .failed("aborted"),
            Event::Actuator(Actuator::Motor, ActuatorEvent::CommandFailed("aborted".into()))
        );
    }
}
