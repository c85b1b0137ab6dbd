//! Response decoding for the device backend.
//!
//! The backend wraps most payloads in an envelope:
//!
//! ```json
//! {"status": "success", "data": {"relay_state": "on"}}
//! {"status": "error", "error": {"code": 400, "msg": "assembly does not exist"}}
//! {"status": "fail", "msg": "port already in use"}
//! ```
//!
//! Some routes answer with a bare payload instead (`{"ports": [...]}`, or even
//! a bare list of remotes). [`unwrap_envelope`] normalizes all of these: any
//! explicit status other than `success` becomes [`ApiError::Application`], the
//! same failure class a caller sees for transport errors, and the payload is
//! taken from `data` when present, otherwise from the top-level document.

use crate::error::ApiError;
use crate::session::{PinConfig, RemoteSession, SessionToken};
use crate::store::{RelayState, TempReading};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// Status value the backend uses for success.
pub const STATUS_SUCCESS: &str = "success";

/// Split a raw response into its payload, or the failure it reports.
pub fn unwrap_envelope(http_status: u16, body: &[u8]) -> Result<Value, ApiError> {
    let ok = (200..300).contains(&http_status);
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) if ok => return Err(ApiError::Decode(err.to_string())),
        Err(_) => {
            return Err(ApiError::Application(format!(
                "backend returned HTTP {}",
                http_status
            )))
        }
    };

    if let Some(status) = value.get("status").and_then(Value::as_str) {
        if status != STATUS_SUCCESS {
            return Err(ApiError::Application(failure_message(&value, status)));
        }
    } else if !ok {
        return Err(ApiError::Application(failure_message(
            &value,
            &format!("HTTP {}", http_status),
        )));
    }

    match value.get("data") {
        Some(data) if !data.is_null() => Ok(data.clone()),
        _ => Ok(value),
    }
}

fn failure_message(value: &Value, status: &str) -> String {
    let from_error = match value.get("error") {
        Some(Value::String(msg)) => Some(msg.clone()),
        Some(Value::Object(obj)) => obj
            .get("msg")
            .or_else(|| obj.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(Value::Object(obj.clone()).to_string())),
        _ => None,
    };
    from_error
        .or_else(|| value.get("msg").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| format!("request failed with status '{}'", status))
}

#[derive(Deserialize)]
struct PortsBody {
    ports: Vec<String>,
}

#[derive(Deserialize)]
struct SessionBody {
    session: SessionToken,
}

#[derive(Deserialize)]
struct RelayBody {
    relay_state: RelayState,
}

/// `{"ports": [...]}`
pub fn decode_ports(payload: Value) -> Result<Vec<String>, ApiError> {
    Ok(serde_json::from_value::<PortsBody>(payload)?.ports)
}

/// `{"session": ...}`
pub fn decode_session(payload: Value) -> Result<SessionToken, ApiError> {
    Ok(serde_json::from_value::<SessionBody>(payload)?.session)
}

/// `{"relay_state": ...}`
pub fn decode_relay(payload: Value) -> Result<RelayState, ApiError> {
    Ok(serde_json::from_value::<RelayBody>(payload)?.relay_state)
}

/// `{"temp_c": ..., "temp_v": ...}`
pub fn decode_temperature(payload: Value) -> Result<TempReading, ApiError> {
    Ok(serde_json::from_value(payload)?)
}

/// One entry of the remote listing. Timings are in seconds.
#[derive(Debug, Deserialize)]
struct RemoteEntry {
    port: String,
    baudrate: u32,
    heartbeat_rate: f64,
    in_buf_size: u32,
    min_read_sleep: f64,
    #[serde(default)]
    pin_config: PinConfig,
    read_interval: f64,
    read_serial_timeout: f64,
}

impl RemoteEntry {
    fn into_session(self) -> Result<RemoteSession, ApiError> {
        Ok(RemoteSession {
            heartbeat_rate: seconds("heartbeat_rate", self.heartbeat_rate)?,
            min_read_sleep: seconds("min_read_sleep", self.min_read_sleep)?,
            read_interval: seconds("read_interval", self.read_interval)?,
            read_serial_timeout: seconds("read_serial_timeout", self.read_serial_timeout)?,
            port: self.port,
            baudrate: self.baudrate,
            in_buf_size: self.in_buf_size,
            pins: self.pin_config,
        })
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, ApiError> {
    Duration::try_from_secs_f64(value)
        .map_err(|err| ApiError::Decode(format!("{}: {}", field, err)))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RemoteSet {
    Keyed(BTreeMap<String, RemoteEntry>),
    Listed(Vec<RemoteEntry>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RemotesBody {
    Wrapped { remotes: RemoteSet },
    Bare(Vec<RemoteEntry>),
}

/// `{"remotes": {key: {...}}}`, `{"remotes": [...]}` or a bare list.
///
/// Listed entries are keyed by `port/baudrate`.
pub fn decode_remotes(payload: Value) -> Result<BTreeMap<String, RemoteSession>, ApiError> {
    let set = match serde_json::from_value::<RemotesBody>(payload)? {
        RemotesBody::Wrapped { remotes } => remotes,
        RemotesBody::Bare(list) => RemoteSet::Listed(list),
    };
    match set {
        RemoteSet::Keyed(map) => map
            .into_iter()
            .map(|(key, entry)| Ok((key, entry.into_session()?)))
            .collect(),
        RemoteSet::Listed(list) => list
            .into_iter()
            .map(|entry| {
                let session = entry.into_session()?;
                Ok((session.key(), session))
            })
            .collect(),
    }
}
