//! HTTP client tests against a local hyper server imitating the device backend.

use brewbot::api::{DeviceApi, HttpDeviceApi};
use brewbot::config::OrchestratorConfig;
use brewbot::error::ApiError;
use brewbot::events::{Actuator, Switch};
use brewbot::orchestrator::Orchestrator;
use brewbot::session::SessionParams;
use brewbot::store::{PortStatus, RelayState};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn backend(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let query: HashMap<String, String> = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let (status, body) = match req.uri().path() {
        "/api/list-ports" => (StatusCode::OK, json!({"ports": ["/dev/ttyUSB0", "COM3"]})),
        "/api/dev/ttyUSB0/9600/new" => match query.get("pins").map(String::as_str) {
            Some("7,in,d") if query.get("inBufSize").map(String::as_str) == Some("128") => {
                (StatusCode::OK, json!({"status": "success", "session": 3}))
            }
            _ => (
                StatusCode::BAD_REQUEST,
                json!({"status": "fail", "msg": "unexpected query"}),
            ),
        },
        "/api/COM3/115200/new" => (
            StatusCode::OK,
            json!({"status": "error", "error": "port already in use"}),
        ),
        "/api/dev/ttyUSB0/9600/shutdown" => (StatusCode::OK, json!({"status": "success"})),
        "/api/heat_plate" => (StatusCode::OK, json!({"relay_state": "off"})),
        "/api/heat_plate/on" => (
            StatusCode::OK,
            json!({"status": "success", "data": {"relay_state": true}}),
        ),
        "/api/motor/on" => (
            StatusCode::BAD_REQUEST,
            json!({"status": "error", "error": {"code": 400, "msg": "motor jammed"}}),
        ),
        "/api/motor" => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            (StatusCode::OK, json!({"relay_state": "on"}))
        }
        "/api/temp" => (StatusCode::OK, json!({"temp_c": 66.2, "temp_v": 1.93})),
        "/api/list-remotes" => (
            StatusCode::OK,
            json!({"remotes": {"/dev/ttyUSB0/9600": {
                "port": "/dev/ttyUSB0", "baudrate": 9600,
                "pin_config": {"7": {"mode": "in", "ad": "d"}},
                "in_buf_size": 128, "heartbeat_rate": 0.1, "read_interval": 0.005,
                "min_read_sleep": 0.005, "read_serial_timeout": 0.1
            }}}),
        ),
        _ => {
            return Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("<html>Not Found</html>"))
                .unwrap_or_default())
        }
    };

    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default())
}

async fn serve() -> SocketAddr {
    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(backend)) });
    let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
    let addr = server.local_addr();
    tokio::spawn(server);
    addr
}

async fn client(timeout: Duration) -> HttpDeviceApi {
    let addr = serve().await;
    HttpDeviceApi::new(&format!("http://{}/api", addr), timeout).unwrap()
}

#[tokio::test]
async fn decodes_bare_and_enveloped_payloads() {
    let api = client(Duration::from_secs(1)).await;

    assert_eq!(
        api.list_ports().await.unwrap(),
        vec!["/dev/ttyUSB0".to_string(), "COM3".to_string()]
    );
    assert_eq!(
        api.actuator_state(Actuator::HeatPlate).await.unwrap(),
        RelayState::Off
    );
    assert_eq!(
        api.send_actuator_command(Actuator::HeatPlate, Switch::On)
            .await
            .unwrap(),
        RelayState::On
    );
    let reading = api.sensor_state().await.unwrap();
    assert_eq!(reading.temp_c, Some(66.2));

    let remotes = api.list_remotes().await.unwrap();
    assert_eq!(remotes["/dev/ttyUSB0/9600"].pins.to_query(), "7,in,d");
}

#[tokio::test]
async fn init_sends_session_parameters_as_query() {
    let api = client(Duration::from_secs(1)).await;
    let params = SessionParams::with_baudrate(9600).with_pins("7,in,d".parse().unwrap());

    let session = api.init_port("/dev/ttyUSB0", &params).await.unwrap();
    assert_eq!(session.as_str(), "3");
    api.shutdown_port("/dev/ttyUSB0", 9600).await.unwrap();
}

#[tokio::test]
async fn error_status_is_an_application_failure() {
    let api = client(Duration::from_secs(1)).await;

    assert_eq!(
        api.send_actuator_command(Actuator::Motor, Switch::On).await,
        Err(ApiError::Application("motor jammed".into()))
    );
    assert_eq!(
        api.init_port("COM3", &SessionParams::default()).await,
        Err(ApiError::Application("port already in use".into()))
    );
    assert_eq!(
        api.shutdown_port("COM3", 115_200).await,
        Err(ApiError::Application("backend returned HTTP 404".into()))
    );
}

#[tokio::test]
async fn slow_backend_times_out() {
    let api = client(Duration::from_millis(100)).await;
    assert_eq!(
        api.actuator_state(Actuator::Motor).await,
        Err(ApiError::Timeout(Duration::from_millis(100)))
    );
}

#[tokio::test]
async fn unreachable_backend_is_a_transport_failure() {
    // Bind then drop a listener to get a port nobody is serving.
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let api = HttpDeviceApi::new(&format!("http://{}/api/", addr), Duration::from_secs(1)).unwrap();
    let err = api.list_ports().await.unwrap_err();
    assert!(err.is_transport(), "unexpected error: {:?}", err);
}

#[tokio::test]
async fn orchestrator_over_http() {
    let api = Arc::new(client(Duration::from_millis(500)).await);
    let handle = Orchestrator::spawn(api, &OrchestratorConfig::default());

    handle.fetch_ports().await.unwrap();
    handle.settle().await.unwrap();
    handle
        .init_port(
            "/dev/ttyUSB0",
            SessionParams::with_baudrate(9600).with_pins("7,in,d".parse().unwrap()),
        )
        .await
        .unwrap();
    handle.init_port("COM3", SessionParams::default()).await.unwrap();
    handle.set_relay(Actuator::HeatPlate, Switch::On).await.unwrap();
    handle.set_relay(Actuator::Motor, Switch::On).await.unwrap();
    handle.poll_temperature().await.unwrap();

    let store = handle.settle().await.unwrap();
    assert_eq!(store.ports["/dev/ttyUSB0"].status, PortStatus::Connected);
    assert_eq!(store.ports["COM3"].status, PortStatus::Error);
    assert_eq!(
        store.ports["COM3"].last_error.as_deref(),
        Some("port already in use")
    );
    assert_eq!(store.heat_plate.relay_state, RelayState::On);
    assert_eq!(store.motor.relay_state, RelayState::Unknown);
    assert_eq!(store.motor.last_error.as_deref(), Some("motor jammed"));
    assert!(store.temperature.reading.is_some());

    let body: Value = serde_json::to_value(&store).unwrap();
    assert_eq!(body["heat_plate"]["relay_state"], "on");

    handle.shutdown().await.unwrap();
}
