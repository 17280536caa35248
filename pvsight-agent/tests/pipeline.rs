//! Integration tests for the export pipeline.
//!
//! These tests start the agent against an in-memory property bus and a
//! local HTTP collector, then check what actually goes over the wire.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{Json, Router};
use axum::extract::{Form, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use parking_lot::Mutex;

use pvsight_agent::config::AgentConfig;
use pvsight_agent::exporter::ExportError;
use pvsight_agent::state::{MetricKey, Reading};
use pvsight_agent::{Agent, MemoryBus, StartupError, TickOutcome};

const SYSTEM: &str = "com.victronenergy.system";
const VEBUS: &str = "com.victronenergy.vebus.ttyO1";
const CHARGER_1: &str = "com.victronenergy.solarcharger.ttyO1";
const CHARGER_2: &str = "com.victronenergy.solarcharger.ttyO2";
const GRID: &str = "com.victronenergy.grid.cgwacs_ttyUSB0";

/// What the fake collector saw, and what it answers next.
#[derive(Clone, Default)]
struct Collector {
    hits: Arc<AtomicUsize>,
    forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
    headers: Arc<Mutex<Vec<HeaderMap>>>,
    script: Arc<Mutex<VecDeque<u16>>>,
    weather_status: Arc<Mutex<u16>>,
    weather_queries: Arc<Mutex<Vec<HashMap<String, String>>>>,
}

impl Collector {
    fn respond_with(&self, statuses: &[u16]) {
        self.script.lock().extend(statuses.iter().copied());
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn last_form(&self) -> HashMap<String, String> {
        self.forms.lock().last().cloned().expect("no upload received")
    }
}

async fn status_handler(
    State(collector): State<Collector>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> StatusCode {
    collector.hits.fetch_add(1, Ordering::SeqCst);
    collector.forms.lock().push(form);
    collector.headers.lock().push(headers);

    let code = collector.script.lock().pop_front().unwrap_or(200);
    StatusCode::from_u16(code).unwrap()
}

async fn weather_handler(
    State(collector): State<Collector>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    collector.weather_queries.lock().push(query);
    let code = *collector.weather_status.lock();
    if code == 200 {
        Json(serde_json::json!({ "main": { "temp": 14.5, "humidity": 80 } })).into_response()
    } else {
        StatusCode::from_u16(code).unwrap().into_response()
    }
}

async fn start_collector() -> (String, Collector) {
    let collector = Collector::default();
    *collector.weather_status.lock() = 200;

    let app = Router::new()
        .route("/status", post(status_handler))
        .route("/weather", get(weather_handler))
        .with_state(collector.clone());

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), collector)
}

/// Two chargers, one grid meter, the system service and one inverter.
fn installation() -> MemoryBus {
    let bus = MemoryBus::new();
    for service in [CHARGER_1, GRID, SYSTEM, VEBUS, CHARGER_2] {
        bus.add_service(service);
    }

    bus.set_value(CHARGER_1, "/Yield/User", 2.5);
    bus.set_value(CHARGER_2, "/Yield/User", 2.75);
    bus.set_value(GRID, "/Ac/L1/Energy/Forward", 2.0);

    bus.set_value(SYSTEM, "/VebusService", VEBUS);
    bus.set_value(SYSTEM, "/Dc/Pv/Power", 1450);
    bus.set_value(SYSTEM, "/Ac/Consumption/L1/Power", 612.9);

    bus.set_value(VEBUS, "/Energy/InverterToAcOut", 0.75);
    bus.set_value(VEBUS, "/Energy/InverterToAcIn1", 0.25);
    bus.set_value(VEBUS, "/Ac/Out/L1/V", 230.5);
    bus
}

fn config(base_url: &str, extra: &str) -> AgentConfig {
    let json = format!(
        r#"{{
            pvoutput: {{
                url: "{base_url}/status",
                api_key: "secret-key",
                system_id: "4242",
                timeout_secs: 5,
                retry: {{ max_retries: 3, backoff_base_ms: 1, max_backoff_ms: 10 }}
            }},
            timezone: "UTC",
            {extra}
        }}"#
    );
    let config: AgentConfig = json5::from_str(&json).unwrap();
    config.validate().unwrap();
    config
}

fn weather_config(base_url: &str) -> String {
    format!(
        r#"weather: {{ enabled: true, api_key: "owm-key", city_id: "2759794", url: "{base_url}/weather" }}"#
    )
}

async fn wait_for(agent: &Agent, key: &MetricKey, expected: Reading) {
    let state = agent.state();
    tokio::time::timeout(Duration::from_secs(2), async {
        while state.read().get(key) != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reading never arrived");
}

#[tokio::test]
async fn test_full_pipeline_uploads_expected_form() {
    let (base_url, collector) = start_collector().await;
    let bus = installation();
    let agent = Agent::start(Arc::new(bus), &config(&base_url, ""))
        .await
        .unwrap();

    let outcome = agent.pipeline().run_once().await;
    assert!(outcome.is_uploaded(), "unexpected outcome: {:?}", outcome);
    assert_eq!(collector.hits(), 1);

    let form = collector.last_form();
    assert_eq!(form["v1"], "5250");
    assert_eq!(form["v2"], "1450");
    assert_eq!(form["v3"], "3000");
    assert_eq!(form["v4"], "612");
    assert_eq!(form["v6"], "230.5");
    assert_eq!(form["c1"], "1");
    assert_eq!(form["d"].len(), 8);
    assert!(form["d"].chars().all(|c| c.is_ascii_digit()));
    assert_eq!(form["t"].len(), 5);
    assert_eq!(&form["t"][2..3], ":");
    assert!(!form.contains_key("v5"));

    let headers = collector.headers.lock().last().cloned().unwrap();
    assert_eq!(headers["x-apikey"], "secret-key");
    assert_eq!(headers["x-systemid"], "4242");

    agent.shutdown();
}

#[tokio::test]
async fn test_notifications_feed_next_tick() {
    let (base_url, collector) = start_collector().await;
    let bus = installation();
    let agent = Agent::start(Arc::new(bus.clone()), &config(&base_url, ""))
        .await
        .unwrap();

    bus.publish(SYSTEM, "/Dc/Pv/Power", 2100);
    bus.publish(CHARGER_2, "/Yield/User", 3.75);
    wait_for(&agent, &MetricKey::GeneratedPower, Reading::Integer(2100)).await;
    wait_for(
        &agent,
        &MetricKey::SolarYield(CHARGER_2.to_string()),
        Reading::Float(3.75),
    )
    .await;

    agent.pipeline().run_once().await;
    let form = collector.last_form();
    assert_eq!(form["v1"], "6250");
    assert_eq!(form["v2"], "2100");

    agent.shutdown();
}

#[tokio::test]
async fn test_custom_header_names() {
    let (base_url, collector) = start_collector().await;
    let mut config = config(&base_url, "");
    config.pvoutput.api_key_header = "X-Pvoutput-Apikey".to_string();
    config.pvoutput.system_id_header = "X-Pvoutput-SystemId".to_string();

    let agent = Agent::start(Arc::new(installation()), &config)
        .await
        .unwrap();
    agent.pipeline().run_once().await;

    let headers = collector.headers.lock().last().cloned().unwrap();
    assert_eq!(headers["x-pvoutput-apikey"], "secret-key");
    assert_eq!(headers["x-pvoutput-systemid"], "4242");
    assert!(!headers.contains_key("x-apikey"));

    agent.shutdown();
}

#[tokio::test]
async fn test_weather_enrichment() {
    let (base_url, collector) = start_collector().await;
    let agent = Agent::start(
        Arc::new(installation()),
        &config(&base_url, &weather_config(&base_url)),
    )
    .await
    .unwrap();

    let outcome = agent.pipeline().run_once().await;
    assert!(outcome.is_uploaded());
    assert_eq!(collector.last_form()["v5"], "14.5");

    let query = collector.weather_queries.lock().last().cloned().unwrap();
    assert_eq!(query["id"], "2759794");
    assert_eq!(query["units"], "metric");
    assert_eq!(query["appid"], "owm-key");

    agent.shutdown();
}

#[tokio::test]
async fn test_weather_failure_omits_temperature_only() {
    let (base_url, collector) = start_collector().await;
    *collector.weather_status.lock() = 500;

    let agent = Agent::start(
        Arc::new(installation()),
        &config(&base_url, &weather_config(&base_url)),
    )
    .await
    .unwrap();

    let outcome = agent.pipeline().run_once().await;
    assert!(outcome.is_uploaded());

    let form = collector.last_form();
    assert!(!form.contains_key("v5"));
    assert_eq!(form["v1"], "5250");
    assert_eq!(agent.pipeline().stats().weather_failures, 1);

    agent.shutdown();
}

#[tokio::test]
async fn test_transient_failures_retried_up_to_limit() {
    let (base_url, collector) = start_collector().await;
    collector.respond_with(&[502; 10]);

    let agent = Agent::start(Arc::new(installation()), &config(&base_url, ""))
        .await
        .unwrap();

    let outcome = agent.pipeline().run_once().await;
    match outcome {
        TickOutcome::Failed(ExportError::Rejected {
            status, attempts, ..
        }) => {
            assert_eq!(status, 502);
            assert_eq!(attempts, 4);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(collector.hits(), 4);

    let stats = agent.pipeline().stats();
    assert_eq!(stats.uploads_failed, 1);
    assert_eq!(stats.retries, 3);

    // The next tick is unaffected.
    let outcome = agent.pipeline().run_once().await;
    assert!(matches!(outcome, TickOutcome::Failed(_)));
    assert_eq!(collector.hits(), 8);

    agent.shutdown();
}

#[tokio::test]
async fn test_recovers_after_transient_failure() {
    let (base_url, collector) = start_collector().await;
    collector.respond_with(&[504, 500]);

    let agent = Agent::start(Arc::new(installation()), &config(&base_url, ""))
        .await
        .unwrap();

    match agent.pipeline().run_once().await {
        TickOutcome::Uploaded(receipt) => {
            assert_eq!(receipt.status, 200);
            assert_eq!(receipt.attempts, 3);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(collector.hits(), 3);

    agent.shutdown();
}

#[tokio::test]
async fn test_non_transient_status_is_not_retried() {
    let (base_url, collector) = start_collector().await;
    collector.respond_with(&[400]);

    let agent = Agent::start(Arc::new(installation()), &config(&base_url, ""))
        .await
        .unwrap();

    let outcome = agent.pipeline().run_once().await;
    assert!(matches!(
        outcome,
        TickOutcome::Failed(ExportError::Rejected { status: 400, attempts: 1, .. })
    ));
    assert_eq!(collector.hits(), 1);

    agent.shutdown();
}

#[tokio::test]
async fn test_no_solar_chargers() {
    let (base_url, collector) = start_collector().await;
    let bus = installation();
    bus.remove_service(CHARGER_1);
    bus.remove_service(CHARGER_2);

    let agent = Agent::start(Arc::new(bus), &config(&base_url, ""))
        .await
        .unwrap();
    assert!(agent.topology().solar_chargers.is_empty());

    assert!(agent.pipeline().run_once().await.is_uploaded());
    assert_eq!(collector.last_form()["v1"], "0");

    agent.shutdown();
}

#[tokio::test]
async fn test_missing_power_skips_upload() {
    let (base_url, collector) = start_collector().await;
    let bus = installation();
    bus.set_value(SYSTEM, "/Dc/Pv/Power", serde_json::Value::Null);

    let agent = Agent::start(Arc::new(bus), &config(&base_url, ""))
        .await
        .unwrap();

    let outcome = agent.pipeline().run_once().await;
    assert!(matches!(
        outcome,
        TickOutcome::Skipped(ExportError::MissingReading(_))
    ));
    assert_eq!(collector.hits(), 0);

    agent.shutdown();
}

#[tokio::test]
async fn test_missing_system_aborts_startup() {
    let bus = installation();
    bus.remove_service(SYSTEM);

    let result = Agent::start(Arc::new(bus), &config("http://127.0.0.1:1", "")).await;
    assert!(matches!(
        result,
        Err(StartupError::RequiredEndpointMissing(_))
    ));
}

#[tokio::test]
async fn test_unreachable_bus_aborts_startup() {
    let bus = installation();
    bus.set_unreachable(true);

    let result = Agent::start(Arc::new(bus), &config("http://127.0.0.1:1", "")).await;
    assert!(matches!(result, Err(StartupError::DiscoveryUnavailable(_))));
}

#[tokio::test]
async fn test_invalid_config_rejected_before_discovery() {
    let bus = installation();
    bus.set_unreachable(true);
    let bus = Arc::new(bus);

    let mut zero_interval = config("http://127.0.0.1:1", "");
    zero_interval.pvoutput.interval_secs = 0;
    let result = Agent::start(bus.clone(), &zero_interval).await;
    assert!(matches!(result, Err(StartupError::Config(_))));

    let mut zero_timeout = config("http://127.0.0.1:1", "");
    zero_timeout.pvoutput.timeout_secs = 0;
    let result = Agent::start(bus, &zero_timeout).await;
    assert!(matches!(result, Err(StartupError::Config(_))));
}
