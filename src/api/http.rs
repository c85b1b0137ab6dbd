//! HTTP/1 client for the device backend.

use super::wire;
use super::DeviceApi;
use crate::config::BackendConfig;
use crate::error::ApiError;
use crate::events::{Actuator, Switch};
use crate::session::{RemoteSession, SessionParams, SessionToken};
use crate::store::{RelayState, TempReading};
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Uri};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

/// [`DeviceApi`] over plain HTTP.
///
/// Every request is a `GET` below `base_url`, bounded by `timeout`. Port names
/// are split on `/` into path segments, so `/dev/ttyUSB0` at 9600 baud becomes
/// `{base_url}/dev/ttyUSB0/9600/new`.
#[derive(Clone)]
pub struct HttpDeviceApi {
    client: Client<HttpConnector, Body>,
    base: Url,
    timeout: Duration,
}

impl HttpDeviceApi {
    /// Client for the backend rooted at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let mut base =
            Url::parse(base_url).map_err(|e| ApiError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        if base.scheme() != "http" {
            return Err(ApiError::InvalidUrl(format!(
                "unsupported scheme '{}' (only http is supported)",
                base.scheme()
            )));
        }
        if base.cannot_be_a_base() {
            return Err(ApiError::InvalidUrl(base_url.to_string()));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        Ok(Self {
            client: Client::new(),
            base,
            timeout,
        })
    }

    /// Client configured from the `[backend]` section.
    pub fn from_config(config: &BackendConfig) -> Result<Self, ApiError> {
        Self::new(&config.base_url, config.request_timeout())
    }

    /// Base URL all requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Build the URL for a route made of `segments` plus query pairs.
    pub fn endpoint(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Url, ApiError> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ApiError::InvalidUrl(self.base.to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.extend(segment.split('/').filter(|part| !part.is_empty()));
            }
        }
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    #[instrument(skip_all, fields(url = %url), err(Display))]
    async fn get(&self, url: Url) -> Result<Value, ApiError> {
        let uri: Uri = url
            .as_str()
            .parse()
            .map_err(|e| ApiError::InvalidUrl(format!("{}: {}", url, e)))?;

        let request = async {
            let response = self
                .client
                .get(uri)
                .await
                .map_err(|e| ApiError::Transport(e.to_string()))?;
            let status = response.status().as_u16();
            let body = hyper::body::to_bytes(response.into_body())
                .await
                .map_err(|e| ApiError::Transport(e.to_string()))?;
            Ok::<_, ApiError>((status, body))
        };

        let (status, body) = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| ApiError::Timeout(self.timeout))??;
        debug!(status, bytes = body.len(), "backend response");

        wire::unwrap_envelope(status, &body)
    }
}

#[async_trait]
impl DeviceApi for HttpDeviceApi {
    async fn list_ports(&self) -> Result<Vec<String>, ApiError> {
        let url = self.endpoint(&["list-ports"], &[])?;
        wire::decode_ports(self.get(url).await?)
    }

    async fn init_port(
        &self,
        port: &str,
        params: &SessionParams,
    ) -> Result<SessionToken, ApiError> {
        let baudrate = params.baudrate.to_string();
        let url = self.endpoint(&[port, baudrate.as_str(), "new"], &params.query_pairs())?;
        wire::decode_session(self.get(url).await?)
    }

    async fn shutdown_port(&self, port: &str, baudrate: u32) -> Result<(), ApiError> {
        let baudrate = baudrate.to_string();
        let url = self.endpoint(&[port, baudrate.as_str(), "shutdown"], &[])?;
        self.get(url).await.map(|_| ())
    }

    async fn actuator_state(&self, actuator: Actuator) -> Result<RelayState, ApiError> {
        let url = self.endpoint(&[actuator.path()], &[])?;
        wire::decode_relay(self.get(url).await?)
    }

    async fn send_actuator_command(
        &self,
        actuator: Actuator,
        switch: Switch,
    ) -> Result<RelayState, ApiError> {
        let url = self.endpoint(&[actuator.path(), switch.as_str()], &[])?;
        wire::decode_relay(self.get(url).await?)
    }

    async fn sensor_state(&self) -> Result<TempReading, ApiError> {
        let url = self.endpoint(&["temp"], &[])?;
        wire::decode_temperature(self.get(url).await?)
    }

    async fn list_remotes(&self) -> Result<BTreeMap<String, RemoteSession>, ApiError> {
        let url = self.endpoint(&["list-remotes"], &[])?;
        wire::decode_remotes(self.get(url).await?)
    }
}
