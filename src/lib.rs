//! # Brewbot Orchestration Core
//!
//! This crate tracks serial ports and the hardware bound to them (remote device
//! sessions, the heat plate and motor relays, and a temperature probe) behind an
//! HTTP device-control backend. It coordinates asynchronous requests against
//! that backend and merges their out-of-order, possibly failing responses into
//! one consistent, observable state.
//!
//! ## Crate Structure
//!
//! - **`api`**: The [`DeviceApi`](api::DeviceApi) trait, the HTTP client for the
//!   real backend, the wire envelope decoder and a scriptable mock backend.
//! - **`config`**: Figment-based configuration (`config/brewbot.toml` + `BREWBOT_*`
//!   environment variables).
//! - **`error`**: `thiserror` error types for every layer.
//! - **`events`**: Commands (intents) and events (requested/succeeded/failed outcomes).
//! - **`messages`**: Mailbox messages understood by the orchestrator actor.
//! - **`orchestrator`**: The single-writer actor owning the store, and its cloneable handle.
//! - **`poller`**: Cancellable fixed-interval pollers.
//! - **`runner`**: Executes backend calls concurrently and posts their outcomes.
//! - **`session`**: Pin configuration, session parameters and remote session descriptions.
//! - **`store`**: The resource state store and its transition function.
//! - **`telemetry`**: `tracing-subscriber` setup.
//!
//! ## Example
//!
//! ```no_run
//! use brewbot::api::MockDeviceApi;
//! use brewbot::config::AppConfig;
//! use brewbot::events::{Actuator, Switch};
//! use brewbot::orchestrator::Orchestrator;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = AppConfig::default();
//! let api = Arc::new(MockDeviceApi::with_ports(["COM1"]));
//! let handle = Orchestrator::spawn(api, &config.orchestrator);
//!
//! handle.fetch_ports().await?;
//! handle.set_relay(Actuator::HeatPlate, Switch::On).await?;
//! let store = handle.settle().await?;
//! println!("heat plate: {}", store.heat_plate.relay_state);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod messages;
pub mod orchestrator;
pub mod poller;
pub mod runner;
pub mod session;
pub mod store;
pub mod telemetry;

pub use error::{AppResult, BrewError};
