//! In-process device backend.
//!
//! [`MockDeviceApi`] behaves like the real backend (ports have to exist to be
//! initialized, a port can only hold one session, relay commands are
//! remembered) and lets tests script per-operation delays and failures:
//!
//! ```rust,ignore
//! let api = MockDeviceApi::with_ports(["COM1", "COM2"]);
//! api.delay_next(Operation::ActuatorCommand(Actuator::HeatPlate), Duration::from_millis(50));
//! api.fail_next(Operation::Temperature, ApiError::Timeout(Duration::from_secs(1)));
//! ```
//!
//! Scripted entries are consumed in FIFO order, one per call of the matching
//! operation. Every call is recorded and can be inspected with
//! [`calls`](MockDeviceApi::calls).

use super::DeviceApi;
use crate::error::ApiError;
use crate::events::{Actuator, Switch};
use crate::session::{RemoteSession, SessionParams, SessionToken};
use crate::store::{RelayState, TempReading};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

/// Operation kinds, for scripting and call inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `list-ports`
    ListPorts,
    /// `{port}/{baudrate}/new`
    InitPort,
    /// `{port}/{baudrate}/shutdown`
    ShutdownPort,
    /// `heat_plate`, `motor`
    ActuatorState(Actuator),
    /// `heat_plate/{on|off}`, `motor/{on|off}`
    ActuatorCommand(Actuator),
    /// `temp`
    Temperature,
    /// `list-remotes`
    ListRemotes,
}

#[derive(Debug, Default)]
struct Scripted {
    delay: Duration,
    failure: Option<ApiError>,
}

#[derive(Debug)]
struct MockState {
    ports: Vec<String>,
    sessions: BTreeMap<String, RemoteSession>,
    relays: HashMap<Actuator, RelayState>,
    temperature: TempReading,
    next_session: u32,
    script: HashMap<Operation, VecDeque<Scripted>>,
    calls: Vec<Operation>,
}

/// Scriptable in-memory [`DeviceApi`].
#[derive(Debug)]
pub struct MockDeviceApi {
    state: Mutex<MockState>,
}

impl Default for MockDeviceApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDeviceApi {
    /// Backend with no ports, relays off and a room-temperature probe.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                ports: Vec::new(),
                sessions: BTreeMap::new(),
                relays: Actuator::ALL
                    .iter()
                    .map(|actuator| (*actuator, RelayState::Off))
                    .collect(),
                temperature: TempReading {
                    temp_c: Some(21.0),
                    temp_v: Some(0.71),
                },
                next_session: 1,
                script: HashMap::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// Backend exposing the given ports.
    pub fn with_ports<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let api = Self::new();
        api.set_ports(ports);
        api
    }

    /// Replace the visible port list.
    pub fn set_ports<I, S>(&self, ports: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().ports = ports.into_iter().map(Into::into).collect();
    }

    /// Set the value the temperature probe reports.
    pub fn set_temperature(&self, reading: TempReading) {
        self.state.lock().temperature = reading;
    }

    /// Set a relay position as if changed outside this process.
    pub fn set_relay(&self, actuator: Actuator, state: RelayState) {
        self.state.lock().relays.insert(actuator, state);
    }

    /// Delay the next call of `op` by `delay`, then behave normally.
    pub fn delay_next(&self, op: Operation, delay: Duration) {
        self.script(op, delay, None);
    }

    /// Fail the next call of `op` with `error`.
    pub fn fail_next(&self, op: Operation, error: ApiError) {
        self.script(op, Duration::ZERO, Some(error));
    }

    /// Queue a scripted reply for the next unscripted call of `op`.
    pub fn script(&self, op: Operation, delay: Duration, failure: Option<ApiError>) {
        self.state
            .lock()
            .script
            .entry(op)
            .or_default()
            .push_back(Scripted { delay, failure });
    }

    /// All calls received so far, in arrival order.
    pub fn calls(&self) -> Vec<Operation> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of `op` received so far.
    pub fn call_count(&self, op: Operation) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == op).count()
    }

    /// Sessions currently open, keyed by port.
    pub fn sessions(&self) -> BTreeMap<String, RemoteSession> {
        self.state.lock().sessions.clone()
    }

    /// Record the call and play back its scripted delay/failure, if any.
    async fn enter(&self, op: Operation) -> Result<(), ApiError> {
        let scripted = {
            let mut state = self.state.lock();
            state.calls.push(op);
            state
                .script
                .get_mut(&op)
                .and_then(VecDeque::pop_front)
                .unwrap_or_default()
        };
        if !scripted.delay.is_zero() {
            tokio::time::sleep(scripted.delay).await;
        }
        match scripted.failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DeviceApi for MockDeviceApi {
    async fn list_ports(&self) -> Result<Vec<String>, ApiError> {
        self.enter(Operation::ListPorts).await?;
        Ok(self.state.lock().ports.clone())
    }

    async fn init_port(
        &self,
        port: &str,
        params: &SessionParams,
    ) -> Result<SessionToken, ApiError> {
        self.enter(Operation::InitPort).await?;
        let mut state = self.state.lock();
        if !state.ports.iter().any(|p| p == port) {
            return Err(ApiError::Application(format!("no such port: {}", port)));
        }
        if state.sessions.contains_key(port) {
            return Err(ApiError::Application("port already in use".into()));
        }
        let token = SessionToken::new(state.next_session.to_string());
        state.next_session = state.next_session % 0xFE + 1;
        state
            .sessions
            .insert(port.to_string(), RemoteSession::from_params(port, params));
        Ok(token)
    }

    async fn shutdown_port(&self, port: &str, baudrate: u32) -> Result<(), ApiError> {
        self.enter(Operation::ShutdownPort).await?;
        let mut state = self.state.lock();
        match state.sessions.get(port) {
            Some(session) if session.baudrate == baudrate => {
                state.sessions.remove(port);
                Ok(())
            }
            _ => Err(ApiError::Application("remote not registered".into())),
        }
    }

    async fn actuator_state(&self, actuator: Actuator) -> Result<RelayState, ApiError> {
        self.enter(Operation::ActuatorState(actuator)).await?;
        Ok(self
            .state
            .lock()
            .relays
            .get(&actuator)
            .copied()
            .unwrap_or_default())
    }

    async fn send_actuator_command(
        &self,
        actuator: Actuator,
        switch: Switch,
    ) -> Result<RelayState, ApiError> {
        self.enter(Operation::ActuatorCommand(actuator)).await?;
        let state = RelayState::from(switch);
        self.state.lock().relays.insert(actuator, state);
        Ok(state)
    }

    async fn sensor_state(&self) -> Result<TempReading, ApiError> {
        self.enter(Operation::Temperature).await?;
        Ok(self.state.lock().temperature)
    }

    async fn list_remotes(&self) -> Result<BTreeMap<String, RemoteSession>, ApiError> {
        self.enter(Operation::ListRemotes).await?;
        Ok(self
            .state
            .lock()
            .sessions
            .values()
            .map(|session| (session.key(), session.clone()))
            .collect())
    }
}
