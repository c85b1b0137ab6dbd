//! Commands and events flowing through the orchestrator.
//!
//! A [`Command`] is an intent ("fetch ports", "switch the heat plate on"),
//! issued by a caller or a poller. An [`Event`] is something the store applies:
//! a `*Requested` marker posted when the operation is dispatched, or the
//! `*Succeeded`/`*Failed` outcome posted when the backend call completes.
//!
//! ```text
//! caller/poller ──Command──> Orchestrator ──Effect──> EffectRunner task
//!                                 ^                          │
//!                                 └────────Event (outcome)───┘
//! ```
//!
//! Every event variant is matched exhaustively in [`Store::apply`](crate::store::Store::apply),
//! so adding an outcome without a transition is a compile error.

use crate::session::{RemoteSession, SessionParams, SessionToken};
use crate::store::{RelayState, TempReading};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The relay-controlled actuators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actuator {
    /// Kettle heat plate
    HeatPlate,
    /// Stirring motor
    Motor,
}

impl Actuator {
    /// Both actuators, in display order.
    pub const ALL: [Actuator; 2] = [Actuator::HeatPlate, Actuator::Motor];

    /// Backend path segment for this actuator.
    pub fn path(self) -> &'static str {
        match self {
            Actuator::HeatPlate => "heat_plate",
            Actuator::Motor => "motor",
        }
    }
}

impl fmt::Display for Actuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Target position of a relay command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Switch {
    /// Energize the relay
    On,
    /// Release the relay
    Off,
}

impl Switch {
    /// Backend path segment.
    pub fn as_str(self) -> &'static str {
        match self {
            Switch::On => "on",
            Switch::Off => "off",
        }
    }
}

impl std::str::FromStr for Switch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Ok(Switch::On),
            "off" => Ok(Switch::Off),
            _ => Err(format!("expected 'on' or 'off', got '{}'", s)),
        }
    }
}

impl From<Switch> for RelayState {
    fn from(switch: Switch) -> Self {
        match switch {
            Switch::On => RelayState::On,
            Switch::Off => RelayState::Off,
        }
    }
}

/// Identity of a resource for in-flight bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKey {
    /// The port list as a whole
    PortList,
    /// A single port
    Port(String),
    /// A relay actuator (commands and polls share the key)
    Actuator(Actuator),
    /// The temperature probe
    Temperature,
    /// The backend's list of registered remotes
    Remotes,
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::PortList => f.write_str("ports"),
            ResourceKey::Port(name) => write!(f, "port:{}", name),
            ResourceKey::Actuator(actuator) => write!(f, "actuator:{}", actuator),
            ResourceKey::Temperature => f.write_str("temperature"),
            ResourceKey::Remotes => f.write_str("remotes"),
        }
    }
}

/// An intent submitted to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Refresh the port list (replaces every port entry on success).
    FetchPorts,
    /// Open a remote session on a port.
    InitPort {
        /// Port name as listed by the backend
        port: String,
        /// Session parameters, validated before dispatch
        params: SessionParams,
    },
    /// Close the remote session bound to a port.
    ShutdownPort {
        /// Port name
        port: String,
    },
    /// Switch an actuator relay.
    SetRelay {
        /// Target actuator
        actuator: Actuator,
        /// Desired relay position
        switch: Switch,
    },
    /// Read back an actuator's live relay state.
    PollActuator(Actuator),
    /// Read the temperature probe.
    PollTemperature,
    /// Refresh the list of remotes registered on the backend.
    FetchRemotes,
}

impl Command {
    /// Short name for log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Command::FetchPorts => "fetch_ports",
            Command::InitPort { .. } => "init_port",
            Command::ShutdownPort { .. } => "shutdown_port",
            Command::SetRelay { .. } => "set_relay",
            Command::PollActuator(_) => "poll_actuator",
            Command::PollTemperature => "poll_temperature",
            Command::FetchRemotes => "fetch_remotes",
        }
    }
}

/// Port list and port lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    /// A port list fetch was dispatched.
    FetchRequested,
    /// The backend returned the current port names.
    FetchSucceeded(Vec<String>),
    /// The port list could not be fetched.
    FetchFailed(String),
    /// An initialize was dispatched with these parameters.
    InitRequested {
        /// Port name
        port: String,
        /// Submitted parameters
        params: SessionParams,
    },
    /// The backend opened a session.
    InitSucceeded {
        /// Port name
        port: String,
        /// Session token returned by the backend
        session: SessionToken,
    },
    /// The initialize failed.
    InitFailed {
        /// Port name
        port: String,
        /// Failure reason
        error: String,
    },
    /// A shutdown was dispatched.
    ShutdownRequested {
        /// Port name
        port: String,
    },
    /// The backend closed the session.
    ShutdownSucceeded {
        /// Port name
        port: String,
    },
    /// The shutdown failed; the port keeps its previous status.
    ShutdownFailed {
        /// Port name
        port: String,
        /// Failure reason
        error: String,
    },
}

/// Actuator command and poll events.
#[derive(Debug, Clone, PartialEq)]
pub enum ActuatorEvent {
    /// A relay command was dispatched.
    CommandRequested(Switch),
    /// The backend acknowledged the relay command.
    CommandSucceeded(RelayState),
    /// The relay command failed.
    CommandFailed(String),
    /// A state poll was dispatched.
    PollRequested,
    /// The backend reported the live relay state.
    PollSucceeded(RelayState),
    /// The state poll failed.
    PollFailed(String),
}

/// Temperature probe events.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    /// A read was dispatched.
    Requested,
    /// The backend returned a reading.
    Succeeded(TempReading),
    /// The read failed.
    Failed(String),
}

/// Remote listing events.
#[derive(Debug, Clone, PartialEq)]
pub enum RemotesEvent {
    /// A listing was dispatched.
    Requested,
    /// The backend returned its registered remotes.
    Succeeded(BTreeMap<String, RemoteSession>),
    /// The listing failed.
    Failed(String),
}

/// Everything the store knows how to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Port list / port lifecycle
    Port(PortEvent),
    /// Heat plate or motor
    Actuator(Actuator, ActuatorEvent),
    /// Temperature probe
    Temperature(SensorEvent),
    /// Remote listing
    Remotes(RemotesEvent),
}

impl Event {
    /// Resource this event belongs to.
    pub fn key(&self) -> ResourceKey {
        match self {
            Event::Port(
                PortEvent::FetchRequested | PortEvent::FetchSucceeded(_) | PortEvent::FetchFailed(_),
            ) => ResourceKey::PortList,
            Event::Port(
                PortEvent::InitRequested { port, .. }
                | PortEvent::InitSucceeded { port, .. }
                | PortEvent::InitFailed { port, .. }
                | PortEvent::ShutdownRequested { port }
                | PortEvent::ShutdownSucceeded { port }
                | PortEvent::ShutdownFailed { port, .. },
            ) => ResourceKey::Port(port.clone()),
            Event::Actuator(actuator, _) => ResourceKey::Actuator(*actuator),
            Event::Temperature(_) => ResourceKey::Temperature,
            Event::Remotes(_) => ResourceKey::Remotes,
        }
    }

    /// True for `*Failed` outcomes.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Event::Port(
                PortEvent::FetchFailed(_)
                    | PortEvent::InitFailed { .. }
                    | PortEvent::ShutdownFailed { .. }
            ) | Event::Actuator(
                _,
                ActuatorEvent::CommandFailed(_) | ActuatorEvent::PollFailed(_)
            ) | Event::Temperature(SensorEvent::Failed(_))
                | Event::Remotes(RemotesEvent::Failed(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_map_to_resource_keys() {
        let init = Event::Port(PortEvent::InitFailed {
            port: "COM1".into(),
            error: "boom".into(),
        });
        assert_eq!(init.key(), ResourceKey::Port("COM1".into()));
        assert!(init.is_failure());

        let poll = Event::Actuator(Actuator::Motor, ActuatorEvent::PollRequested);
        assert_eq!(poll.key(), ResourceKey::Actuator(Actuator::Motor));
        assert!(!poll.is_failure());
    }

    #[test]
    fn resource_keys_render_for_logs() {
        assert_eq!(ResourceKey::Port("/dev/ttyUSB0".into()).to_string(), "port:/dev/ttyUSB0");
        assert_eq!(
            ResourceKey::Actuator(Actuator::HeatPlate).to_string(),
            "actuator:heat_plate"
        );
    }
}
