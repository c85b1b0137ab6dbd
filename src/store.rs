//! Resource state store and its transition functions.
//!
//! The [`Store`] is the canonical snapshot of every tracked resource: the
//! serial ports listed by the backend, the two relay actuators, the
//! temperature probe and the backend's own list of registered remotes.
//!
//! # Mutation
//!
//! [`Store::apply`] (and its by-value twin [`apply`]) is the only way to change
//! a store. It is total and deterministic: every [`Event`] variant has a
//! defined effect, and events that name a port the store does not know about
//! are ignored rather than creating phantom entries.
//!
//! # Failure semantics
//!
//! `*Failed` events only touch flags and the error slot of the resource that
//! produced them. Payload fields (relay state, temperature reading, port
//! entries) keep their last known good value, so a transient poll failure
//! never blanks what an observer is displaying.
//!
//! # Ordering
//!
//! Events are applied in the order they arrive. There is no reordering and no
//! rollback; when two outcomes for the same resource race, the one applied
//! last wins.

use crate::events::{Actuator, ActuatorEvent, Event, PortEvent, RemotesEvent, SensorEvent};
use crate::session::{RemoteSession, SessionParams, SessionToken, DEFAULT_BAUDRATE};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    /// No session bound
    #[default]
    Offline,
    /// Initialize in flight
    Connecting,
    /// Session bound
    Connected,
    /// Last initialize failed
    Error,
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PortStatus::Offline => "offline",
            PortStatus::Connecting => "connecting",
            PortStatus::Connected => "connected",
            PortStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// A serial endpoint as seen by the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Port {
    /// Unique port name
    pub name: String,
    /// Lifecycle state
    pub status: PortStatus,
    /// Serial speed; updated from the parameters of a successful initialize
    pub baudrate: u32,
    /// Backend session token, present iff `status == Connected`
    pub session: Option<SessionToken>,
    /// True while an initialize or shutdown is in flight
    pub busy: bool,
    /// Parameters submitted with the in-flight initialize
    pub pending: Option<SessionParams>,
    /// Description of the bound remote while connected
    pub remote: Option<RemoteSession>,
    /// Last initialize/shutdown failure
    pub last_error: Option<String>,
}

impl Port {
    /// Fresh offline entry, as created by a port list refresh.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: PortStatus::Offline,
            baudrate: DEFAULT_BAUDRATE,
            session: None,
            busy: false,
            pending: None,
            remote: None,
            last_error: None,
        }
    }

    fn unbind(&mut self) {
        self.session = None;
        self.remote = None;
        self.pending = None;
    }
}

/// Last known position of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    /// Relay energized
    On,
    /// Relay released
    Off,
    /// Never observed, or the backend reported something unrecognized
    #[default]
    Unknown,
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RelayState::On => "on",
            RelayState::Off => "off",
            RelayState::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Accepts `"on"`/`"off"`, booleans and `0`/`1`; anything else is `Unknown`.
impl<'de> Deserialize<'de> for RelayState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "on" | "high" | "1" | "true" => RelayState::On,
                "off" | "low" | "0" | "false" => RelayState::Off,
                _ => RelayState::Unknown,
            },
            serde_json::Value::Bool(true) => RelayState::On,
            serde_json::Value::Bool(false) => RelayState::Off,
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(1) => RelayState::On,
                Some(0) => RelayState::Off,
                _ => RelayState::Unknown,
            },
            _ => RelayState::Unknown,
        })
    }
}

/// A relay-controlled actuator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActuatorResource {
    /// True between a relay command's dispatch and its outcome
    pub command_pending: bool,
    /// Last acknowledged relay position
    pub relay_state: RelayState,
    /// True while a state poll is in flight
    pub poll_loading: bool,
    /// Last command or poll failure
    pub last_error: Option<String>,
}

/// One temperature probe reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TempReading {
    /// Temperature in degrees Celsius
    #[serde(default)]
    pub temp_c: Option<f64>,
    /// Raw probe voltage
    #[serde(default)]
    pub temp_v: Option<f64>,
}

/// A polled sensor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SensorResource {
    /// True while a read is in flight
    pub loading: bool,
    /// Last good reading
    pub reading: Option<TempReading>,
    /// Last read failure
    pub last_error: Option<String>,
}

/// Snapshot of every tracked resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Store {
    /// True while a port list fetch is in flight
    pub loading: bool,
    /// Last port list fetch failure (the only global error)
    pub error: Option<String>,
    /// Ports keyed by name
    pub ports: BTreeMap<String, Port>,
    /// Heat plate relay
    pub heat_plate: ActuatorResource,
    /// Stirring motor relay
    pub motor: ActuatorResource,
    /// Temperature probe
    pub temperature: SensorResource,
    /// Remotes registered on the backend, keyed by backend key
    pub remotes: BTreeMap<String, RemoteSession>,
    /// True while a remote listing is in flight
    pub remotes_loading: bool,
    /// Last remote listing failure
    pub remotes_error: Option<String>,
}

/// By-value form of [`Store::apply`].
pub fn apply(mut state: Store, event: &Event) -> Store {
    state.apply(event);
    state
}

impl Store {
    /// Empty store, as at process start.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a port.
    pub fn port(&self, name: &str) -> Option<&Port> {
        self.ports.get(name)
    }

    /// Actuator state by identity.
    pub fn actuator(&self, actuator: Actuator) -> &ActuatorResource {
        match actuator {
            Actuator::HeatPlate => &self.heat_plate,
            Actuator::Motor => &self.motor,
        }
    }

    fn actuator_mut(&mut self, actuator: Actuator) -> &mut ActuatorResource {
        match actuator {
            Actuator::HeatPlate => &mut self.heat_plate,
            Actuator::Motor => &mut self.motor,
        }
    }

    /// Names of ports with an operation in flight.
    pub fn busy_ports(&self) -> impl Iterator<Item = &str> {
        self.ports
            .values()
            .filter(|port| port.busy)
            .map(|port| port.name.as_str())
    }

    /// Apply one event.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::Port(event) => self.apply_port(event),
            Event::Actuator(actuator, event) => self.actuator_mut(*actuator).apply(event),
            Event::Temperature(event) => self.temperature.apply(event),
            Event::Remotes(event) => self.apply_remotes(event),
        }
    }

    fn apply_port(&mut self, event: &PortEvent) {
        match event {
            PortEvent::FetchRequested => {
                self.loading = true;
            }
            PortEvent::FetchSucceeded(names) => {
                self.ports = names
                    .iter()
                    .map(|name| (name.clone(), Port::new(name.clone())))
                    .collect();
                self.loading = false;
                self.error = None;
            }
            PortEvent::FetchFailed(reason) => {
                self.loading = false;
                self.error = Some(reason.clone());
            }
            PortEvent::InitRequested { port, params } => {
                if let Some(port) = self.ports.get_mut(port) {
                    port.busy = true;
                    port.status = PortStatus::Connecting;
                    port.pending = Some(params.clone());
                }
            }
            PortEvent::InitSucceeded { port, session } => {
                if let Some(port) = self.ports.get_mut(port) {
                    // Parameters are consumed on the first success; a repeated
                    // success keeps the remote built from them.
                    if let Some(params) = port.pending.take() {
                        port.baudrate = params.baudrate;
                        port.remote = Some(RemoteSession::from_params(&port.name, &params));
                    }
                    port.busy = false;
                    port.status = PortStatus::Connected;
                    port.session = Some(session.clone());
                    port.last_error = None;
                }
            }
            PortEvent::InitFailed { port, error } => {
                if let Some(port) = self.ports.get_mut(port) {
                    port.busy = false;
                    port.status = PortStatus::Error;
                    port.unbind();
                    port.last_error = Some(error.clone());
                }
            }
            PortEvent::ShutdownRequested { port } => {
                if let Some(port) = self.ports.get_mut(port) {
                    port.busy = true;
                }
            }
            PortEvent::ShutdownSucceeded { port } => {
                if let Some(port) = self.ports.get_mut(port) {
                    port.busy = false;
                    port.status = PortStatus::Offline;
                    port.unbind();
                    port.last_error = None;
                }
            }
            PortEvent::ShutdownFailed { port, error } => {
                if let Some(port) = self.ports.get_mut(port) {
                    port.busy = false;
                    port.last_error = Some(error.clone());
                }
            }
        }
    }

    fn apply_remotes(&mut self, event: &RemotesEvent) {
        match event {
            RemotesEvent::Requested => {
                self.remotes_loading = true;
            }
            RemotesEvent::Succeeded(remotes) => {
                self.remotes = remotes.clone();
                self.remotes_loading = false;
                self.remotes_error = None;
            }
            RemotesEvent::Failed(reason) => {
                self.remotes_loading = false;
                self.remotes_error = Some(reason.clone());
            }
        }
    }
}

impl ActuatorResource {
    fn apply(&mut self, event: &ActuatorEvent) {
        match event {
            ActuatorEvent::CommandRequested(_) => {
                self.command_pending = true;
            }
            ActuatorEvent::CommandSucceeded(state) => {
                self.command_pending = false;
                self.relay_state = *state;
                self.last_error = None;
            }
            ActuatorEvent::CommandFailed(reason) => {
                self.command_pending = false;
                self.last_error = Some(reason.clone());
            }
            ActuatorEvent::PollRequested => {
                self.poll_loading = true;
            }
            ActuatorEvent::PollSucceeded(state) => {
                self.poll_loading = false;
                self.relay_state = *state;
                self.last_error = None;
            }
            ActuatorEvent::PollFailed(reason) => {
                self.poll_loading = false;
                self.last_error = Some(reason.clone());
            }
        }
    }
}

impl SensorResource {
    fn apply(&mut self, event: &SensorEvent) {
        match event {
            SensorEvent::Requested => {
                self.loading = true;
            }
            SensorEvent::Succeeded(reading) => {
                self.loading = false;
                self.reading = Some(*reading);
                self.last_error = None;
            }
            SensorEvent::Failed(reason) => {
                self.loading = false;
                self.last_error = Some(reason.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Switch;

    fn port_event(event: PortEvent) -> Event {
        Event::Port(event)
    }

    fn with_ports(names: &[&str]) -> Store {
        apply(
            Store::new(),
            &port_event(PortEvent::FetchSucceeded(
                names.iter().map(|n| n.to_string()).collect(),
            )),
        )
    }

    #[test]
    fn fetch_success_builds_offline_ports() {
        let mut store = Store::new();
        store.apply(&port_event(PortEvent::FetchRequested));
        assert!(store.loading);

        store.apply(&port_event(PortEvent::FetchSucceeded(vec![
            "COM1".into(),
            "COM2".into(),
        ])));
        assert!(!store.loading);
        assert_eq!(store.ports.len(), 2);
        for port in store.ports.values() {
            assert_eq!(port.status, PortStatus::Offline);
            assert!(!port.busy);
            assert!(port.session.is_none());
            assert_eq!(port.baudrate, DEFAULT_BAUDRATE);
        }
    }

    #[test]
    fn fetch_failure_keeps_existing_ports() {
        let mut store = with_ports(&["COM1"]);
        store.apply(&port_event(PortEvent::FetchRequested));
        store.apply(&port_event(PortEvent::FetchFailed("connection refused".into())));

        assert!(!store.loading);
        assert_eq!(store.error.as_deref(), Some("connection refused"));
        assert!(store.port("COM1").is_some());

        // The next good fetch clears the global error.
        store.apply(&port_event(PortEvent::FetchSucceeded(vec!["COM3".into()])));
        assert!(store.error.is_none());
        assert!(store.port("COM1").is_none());
    }

    #[test]
    fn init_on_unknown_port_is_noop() {
        let store = with_ports(&["COM1"]);
        let after = apply(
            store.clone(),
            &port_event(PortEvent::InitRequested {
                port: "COM9".into(),
                params: SessionParams::default(),
            }),
        );
        assert_eq!(after, store);
    }

    #[test]
    fn init_lifecycle_scenario() {
        let mut store = with_ports(&["COM1", "COM2"]);
        let com2_before = store.port("COM2").cloned();

        store.apply(&port_event(PortEvent::InitRequested {
            port: "COM1".into(),
            params: SessionParams::with_baudrate(9600),
        }));
        let com1 = store.port("COM1").unwrap();
        assert!(com1.busy);
        assert_eq!(com1.status, PortStatus::Connecting);

        store.apply(&port_event(PortEvent::InitSucceeded {
            port: "COM1".into(),
            session: SessionToken::new("s1"),
        }));
        let com1 = store.port("COM1").unwrap();
        assert_eq!(com1.status, PortStatus::Connected);
        assert_eq!(com1.session, Some(SessionToken::new("s1")));
        assert!(!com1.busy);
        assert_eq!(com1.baudrate, 9600);
        assert_eq!(com1.remote.as_ref().map(|r| r.baudrate), Some(9600));
        assert!(com1.pending.is_none());
        assert_eq!(store.port("COM2").cloned(), com2_before);
    }

    #[test]
    fn init_failure_discards_params_and_session() {
        let mut store = with_ports(&["COM1"]);
        store.apply(&port_event(PortEvent::InitRequested {
            port: "COM1".into(),
            params: SessionParams::default(),
        }));
        store.apply(&port_event(PortEvent::InitFailed {
            port: "COM1".into(),
            error: "port already in use".into(),
        }));
        let com1 = store.port("COM1").unwrap();
        assert_eq!(com1.status, PortStatus::Error);
        assert!(!com1.busy);
        assert!(com1.session.is_none());
        assert!(com1.pending.is_none());
        assert!(com1.remote.is_none());
        assert_eq!(com1.last_error.as_deref(), Some("port already in use"));
    }

    #[test]
    fn shutdown_returns_port_offline() {
        let mut store = with_ports(&["COM1"]);
        store.apply(&port_event(PortEvent::InitRequested {
            port: "COM1".into(),
            params: SessionParams::default(),
        }));
        store.apply(&port_event(PortEvent::InitSucceeded {
            port: "COM1".into(),
            session: SessionToken::new("7"),
        }));

        store.apply(&port_event(PortEvent::ShutdownRequested { port: "COM1".into() }));
        assert!(store.port("COM1").unwrap().busy);
        store.apply(&port_event(PortEvent::ShutdownFailed {
            port: "COM1".into(),
            error: "remote not registered".into(),
        }));
        let com1 = store.port("COM1").unwrap();
        assert!(!com1.busy);
        assert_eq!(com1.status, PortStatus::Connected);

        store.apply(&port_event(PortEvent::ShutdownSucceeded { port: "COM1".into() }));
        let com1 = store.port("COM1").unwrap();
        assert_eq!(com1.status, PortStatus::Offline);
        assert!(com1.session.is_none());
        assert!(com1.remote.is_none());
    }

    #[test]
    fn heat_plate_timeout_keeps_relay_state() {
        let mut store = Store::new();
        let heat = |e| Event::Actuator(Actuator::HeatPlate, e);
        store.apply(&heat(ActuatorEvent::CommandRequested(Switch::On)));
        store.apply(&heat(ActuatorEvent::CommandSucceeded(RelayState::On)));

        store.apply(&heat(ActuatorEvent::CommandRequested(Switch::Off)));
        assert!(store.heat_plate.command_pending);
        store.apply(&heat(ActuatorEvent::CommandFailed("timeout".into())));

        assert!(!store.heat_plate.command_pending);
        assert_eq!(store.heat_plate.last_error.as_deref(), Some("timeout"));
        assert_eq!(store.heat_plate.relay_state, RelayState::On);
        assert_eq!(store.motor, ActuatorResource::default());
    }

    #[test]
    fn sensor_failure_keeps_last_reading() {
        let mut store = Store::new();
        let reading = TempReading {
            temp_c: Some(64.5),
            temp_v: Some(1.2),
        };
        store.apply(&Event::Temperature(SensorEvent::Requested));
        store.apply(&Event::Temperature(SensorEvent::Succeeded(reading)));
        store.apply(&Event::Temperature(SensorEvent::Requested));
        store.apply(&Event::Temperature(SensorEvent::Failed("HTTP 502".into())));

        assert!(!store.temperature.loading);
        assert_eq!(store.temperature.reading, Some(reading));
        assert_eq!(store.temperature.last_error.as_deref(), Some("HTTP 502"));
    }

    #[test]
    fn last_applied_outcome_wins() {
        let mut store = Store::new();
        let motor = |e| Event::Actuator(Actuator::Motor, e);
        store.apply(&motor(ActuatorEvent::PollSucceeded(RelayState::Off)));
        store.apply(&motor(ActuatorEvent::CommandSucceeded(RelayState::On)));
        assert_eq!(store.motor.relay_state, RelayState::On);

        store.apply(&motor(ActuatorEvent::PollSucceeded(RelayState::Off)));
        store.apply(&motor(ActuatorEvent::PollFailed("timeout".into())));
        assert_eq!(store.motor.relay_state, RelayState::Off);
        assert_eq!(store.motor.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn relay_state_decodes_loose_backend_values() {
        let decode = |json: &str| serde_json::from_str::<RelayState>(json).unwrap();
        assert_eq!(decode("\"on\""), RelayState::On);
        assert_eq!(decode("\"OFF\""), RelayState::Off);
        assert_eq!(decode("true"), RelayState::On);
        assert_eq!(decode("0"), RelayState::Off);
        assert_eq!(decode("\"sideways\""), RelayState::Unknown);
        assert_eq!(decode("null"), RelayState::Unknown);
    }
}
