//! Remote session parameters and pin configuration.
//!
//! A [`SessionParams`] is what a caller submits with an initialize command. It is
//! validated locally before anything is sent to the backend: pin modes must be
//! exactly `in` or `out`, pin kinds analog or digital, pin ids `<n>` or `a<n>`,
//! and the numeric parameters must sit inside the ranges the backend accepts.
//!
//! On a successful initialize the parameters are echoed into a
//! [`RemoteSession`], the locally held description of the bound remote.

use crate::error::ValidationError;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default serial speed for a freshly listed port.
pub const DEFAULT_BAUDRATE: u32 = 115_200;

const BAUDRATE_RANGE: (u64, u64) = (9_600, 115_200);
const IN_BUF_SIZE_RANGE: (u64, u64) = (64, 4_096);
const MILLIS_RANGE: (u64, u64) = (1, 3_600_000);

/// Direction of a remote pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    /// Pin is read by the remote and reported back.
    In,
    /// Pin is driven by the remote.
    Out,
}

impl PinMode {
    /// Wire token used in pin specification strings.
    pub fn as_str(self) -> &'static str {
        match self {
            PinMode::In => "in",
            PinMode::Out => "out",
        }
    }
}

/// Signal type of a remote pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PinKind {
    /// Analog pin
    Analog,
    /// Digital pin
    Digital,
}

impl PinKind {
    /// Single-letter wire token (`a` or `d`).
    pub fn as_str(self) -> &'static str {
        match self {
            PinKind::Analog => "a",
            PinKind::Digital => "d",
        }
    }

    fn parse(pin: &str, value: &str) -> Result<Self, ValidationError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "a" | "analog" => Ok(PinKind::Analog),
            "d" | "digital" => Ok(PinKind::Digital),
            _ => Err(ValidationError::PinKind {
                pin: pin.to_string(),
                value: value.to_string(),
            }),
        }
    }
}

/// Configuration of a single pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSpec {
    /// Input or output
    pub mode: PinMode,
    /// Analog or digital
    pub kind: PinKind,
}

/// Unvalidated pin entry as it arrives from a form or a JSON document.
///
/// `kind` may be omitted (digital is assumed); the backend's own listing calls
/// the field `ad`, which is accepted as an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPin {
    /// Expected to be `in` or `out`
    pub mode: String,
    /// Expected to be `a`/`analog` or `d`/`digital`
    #[serde(default, alias = "ad")]
    pub kind: Option<String>,
}

/// Ordered pin map, in the order the pins were submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinConfig {
    pins: Vec<(String, PinSpec)>,
}

impl PinConfig {
    /// Empty pin configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pin, rejecting malformed or duplicate ids.
    pub fn with_pin(
        mut self,
        id: &str,
        mode: PinMode,
        kind: PinKind,
    ) -> Result<Self, ValidationError> {
        self.push(id, PinSpec { mode, kind })?;
        Ok(self)
    }

    fn push(&mut self, id: &str, spec: PinSpec) -> Result<(), ValidationError> {
        let id = normalize_pin_id(id)?;
        if self.pins.iter().any(|(existing, _)| *existing == id) {
            return Err(ValidationError::DuplicatePin(id));
        }
        self.pins.push((id, spec));
        Ok(())
    }

    /// Validate a map of raw pin entries, e.g. `{"7": {"mode": "in", "kind": "d"}}`.
    pub fn from_raw<'a, I>(entries: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (&'a str, &'a RawPin)>,
    {
        let mut config = PinConfig::new();
        for (id, raw) in entries {
            let mode = parse_mode(id, &raw.mode)?;
            let kind = match raw.kind.as_deref() {
                Some(kind) => PinKind::parse(id, kind)?,
                None => PinKind::Digital,
            };
            config.push(id, PinSpec { mode, kind })?;
        }
        Ok(config)
    }

    /// Number of configured pins.
    pub fn len(&self) -> usize {
        self.pins.len()
    }

    /// True when no pins are configured.
    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    /// Look up a pin by id.
    pub fn get(&self, id: &str) -> Option<PinSpec> {
        self.pins
            .iter()
            .find(|(pin, _)| pin == id)
            .map(|(_, spec)| *spec)
    }

    /// Iterate pins in submission order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, PinSpec)> {
        self.pins.iter().map(|(id, spec)| (id.as_str(), *spec))
    }

    /// Comma-separated wire form, `id,mode,kind` per pin.
    pub fn to_query(&self) -> String {
        self.pins
            .iter()
            .map(|(id, spec)| format!("{},{},{}", id, spec.mode.as_str(), spec.kind.as_str()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parses the `id,mode,kind[,id,mode,kind...]` form used by the backend query string.
impl FromStr for PinConfig {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s
            .split(',')
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .collect();
        if fields.len() % 3 != 0 {
            return Err(ValidationError::PinFieldCount(fields.len()));
        }

        let mut config = PinConfig::new();
        for chunk in fields.chunks(3) {
            if let [id, mode, kind] = chunk {
                let mode = parse_mode(id, mode)?;
                let kind = PinKind::parse(id, kind)?;
                config.push(id, PinSpec { mode, kind })?;
            }
        }
        Ok(config)
    }
}

impl fmt::Display for PinConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}

impl Serialize for PinConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_query())
    }
}

struct PinConfigVisitor;

impl<'de> Visitor<'de> for PinConfigVisitor {
    type Value = PinConfig;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an `id,mode,kind` string or a map of pin id to {mode, kind}")
    }

    fn visit_str<E>(self, value: &str) -> Result<PinConfig, E>
    where
        E: de::Error,
    {
        value.parse().map_err(E::custom)
    }

    // Entries are kept in document order.
    fn visit_map<A>(self, mut map: A) -> Result<PinConfig, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut raw: Vec<(String, RawPin)> = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((id, pin)) = map.next_entry::<String, RawPin>()? {
            raw.push((id, pin));
        }
        PinConfig::from_raw(raw.iter().map(|(id, pin)| (id.as_str(), pin)))
            .map_err(de::Error::custom)
    }
}

/// Accepts either the `id,mode,kind` string or the backend listing's `{id: {mode, ad}}` map.
impl<'de> Deserialize<'de> for PinConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(PinConfigVisitor)
    }
}

fn parse_mode(pin: &str, value: &str) -> Result<PinMode, ValidationError> {
    match value {
        "in" => Ok(PinMode::In),
        "out" => Ok(PinMode::Out),
        _ => Err(ValidationError::PinMode {
            pin: pin.to_string(),
            value: value.to_string(),
        }),
    }
}

fn normalize_pin_id(id: &str) -> Result<String, ValidationError> {
    let id = id.trim().to_ascii_lowercase();
    let digits = id.strip_prefix('a').unwrap_or(&id);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::PinId(id));
    }
    Ok(id)
}

/// Parameters submitted with an initialize command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    /// Serial speed
    pub baudrate: u32,
    /// Pins to configure on the remote
    pub pins: PinConfig,
    /// Heartbeat period in milliseconds
    pub heartbeat_rate_ms: u64,
    /// Remote input buffer size in bytes
    pub in_buf_size: u32,
    /// Minimum sleep between reads in milliseconds
    pub min_read_sleep_ms: u64,
    /// Read loop interval in milliseconds
    pub read_interval_ms: u64,
    /// Serial read timeout in milliseconds
    pub read_serial_timeout_ms: u64,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            baudrate: DEFAULT_BAUDRATE,
            pins: PinConfig::new(),
            heartbeat_rate_ms: 100,
            in_buf_size: 128,
            min_read_sleep_ms: 5,
            read_interval_ms: 5,
            read_serial_timeout_ms: 100,
        }
    }
}

impl SessionParams {
    /// Default parameters at the given baudrate.
    pub fn with_baudrate(baudrate: u32) -> Self {
        Self {
            baudrate,
            ..Default::default()
        }
    }

    /// Replace the pin configuration.
    pub fn with_pins(mut self, pins: PinConfig) -> Self {
        self.pins = pins;
        self
    }

    /// Check numeric ranges. Pins are validated when the [`PinConfig`] is built.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("baudrate", u64::from(self.baudrate), BAUDRATE_RANGE)?;
        check_range("in_buf_size", u64::from(self.in_buf_size), IN_BUF_SIZE_RANGE)?;
        check_range("heartbeat_rate_ms", self.heartbeat_rate_ms, MILLIS_RANGE)?;
        check_range("min_read_sleep_ms", self.min_read_sleep_ms, MILLIS_RANGE)?;
        check_range("read_interval_ms", self.read_interval_ms, MILLIS_RANGE)?;
        check_range(
            "read_serial_timeout_ms",
            self.read_serial_timeout_ms,
            MILLIS_RANGE,
        )?;
        Ok(())
    }

    /// Query parameters for the initialize request, in backend naming.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("pins", self.pins.to_query()),
            ("heartbeatRate", self.heartbeat_rate_ms.to_string()),
            ("inBufSize", self.in_buf_size.to_string()),
            ("minReadSleep", self.min_read_sleep_ms.to_string()),
            ("readInterval", self.read_interval_ms.to_string()),
            ("readSerialTimeout", self.read_serial_timeout_ms.to_string()),
        ]
    }
}

fn check_range(name: &'static str, value: u64, (min, max): (u64, u64)) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            name,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Opaque session token handed out by the backend on a successful initialize.
///
/// The backend currently issues small integers; strings are accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Wrap a token value.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionToken {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(token) => Ok(SessionToken(token)),
            serde_json::Value::Number(token) => Ok(SessionToken(token.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "session token must be a string or number, got {}",
                other
            ))),
        }
    }
}

/// A configured, initialized connection bound to a port.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteSession {
    /// Port the remote is attached to
    pub port: String,
    /// Serial speed
    pub baudrate: u32,
    /// Heartbeat period
    pub heartbeat_rate: Duration,
    /// Remote input buffer size in bytes
    pub in_buf_size: u32,
    /// Minimum sleep between reads
    pub min_read_sleep: Duration,
    /// Read loop interval
    pub read_interval: Duration,
    /// Serial read timeout
    pub read_serial_timeout: Duration,
    /// Configured pins
    pub pins: PinConfig,
}

impl RemoteSession {
    /// Echo submitted parameters into a session description.
    pub fn from_params(port: &str, params: &SessionParams) -> Self {
        Self {
            port: port.to_string(),
            baudrate: params.baudrate,
            heartbeat_rate: Duration::from_millis(params.heartbeat_rate_ms),
            in_buf_size: params.in_buf_size,
            min_read_sleep: Duration::from_millis(params.min_read_sleep_ms),
            read_interval: Duration::from_millis(params.read_interval_ms),
            read_serial_timeout: Duration::from_millis(params.read_serial_timeout_ms),
            pins: params.pins.clone(),
        }
    }

    /// Composite identity, `port/baudrate`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.port, self.baudrate)
    }
}
