//! Device backend boundary.
//!
//! [`DeviceApi`] is the only way the orchestrator talks to the outside world.
//! Implementations are pure transport: no retries, no caching, no state about
//! ports or relays beyond what a single request needs. Every call is bounded
//! in time by the implementation; a timeout is reported as
//! [`ApiError::Timeout`](crate::error::ApiError::Timeout) like any other failure.
//!
//! Two implementations ship with the crate:
//!
//! - [`HttpDeviceApi`]: talks to the real backend over HTTP/1.
//! - [`MockDeviceApi`]: in-process backend with scripted delays and failures,
//!   used by the tests and the `--mock` CLI mode.

pub mod http;
pub mod mock;
pub mod wire;

pub use http::HttpDeviceApi;
pub use mock::{MockDeviceApi, Operation};

use crate::error::ApiError;
use crate::events::{Actuator, Switch};
use crate::session::{RemoteSession, SessionParams, SessionToken};
use crate::store::{RelayState, TempReading};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Operations offered by the device-control backend.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Names of the serial ports the backend can see.
    async fn list_ports(&self) -> Result<Vec<String>, ApiError>;

    /// Open a remote session on `port`.
    async fn init_port(
        &self,
        port: &str,
        params: &SessionParams,
    ) -> Result<SessionToken, ApiError>;

    /// Close the remote session bound to `port` at `baudrate`.
    async fn shutdown_port(&self, port: &str, baudrate: u32) -> Result<(), ApiError>;

    /// Live relay position of an actuator.
    async fn actuator_state(&self, actuator: Actuator) -> Result<RelayState, ApiError>;

    /// Switch an actuator relay; returns the acknowledged position.
    async fn send_actuator_command(
        &self,
        actuator: Actuator,
        switch: Switch,
    ) -> Result<RelayState, ApiError>;

    /// Current temperature probe reading.
    async fn sensor_state(&self) -> Result<TempReading, ApiError>;

    /// Remotes currently registered on the backend.
    async fn list_remotes(&self) -> Result<BTreeMap<String, RemoteSession>, ApiError>;
}
