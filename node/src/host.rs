use std::{
    collections::VecDeque,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use tempguard_common::{
    config::{default_api_base_url, KEY_API_BASE_URL, KEY_DEVICE_ID},
    plan_boot,
    provisioning::{
        associate_with_retry, provision, render_config_page, render_confirmation_page,
        CAPTIVE_PROBE_PATHS, PROVISION_RESTART_DELAY_MS,
    },
    BootMode, CommandEnvelope, DisplayError, HttpReply, KvStore, MemoryStore, Node, Poll,
    ProvisioningForm, ReadingReport, RemoteCommand, ReportTransport, RestartLatch, Screen,
    SensorError, SensorReader, StatusDisplay, StoreError, TransportError,
};

const DEFAULT_MAC: [u8; 6] = [0x24, 0x6f, 0x28, 0x1a, 0x2b, 0x3c];
const LOOP_IDLE_MS: u64 = 50;

#[derive(Clone)]
struct AppState {
    store: FileStore,
    restart: RestartLatch,
    collector: Collector,
}

/// JSON file standing in for the NVS partition.
#[derive(Clone)]
struct FileStore {
    path: Arc<PathBuf>,
    values: Arc<Mutex<MemoryStore>>,
}

#[derive(Clone, Default)]
struct Collector {
    inner: Arc<Mutex<CollectorState>>,
}

#[derive(Default)]
struct CollectorState {
    queued: VecDeque<RemoteCommand>,
    last_report: Option<ReadingReport>,
    received: u64,
}

#[derive(Debug, Serialize)]
struct CollectorStatus {
    received: u64,
    queued: Vec<String>,
    #[serde(rename = "lastReport")]
    last_report: Option<ReadingReport>,
}

#[derive(Debug, Serialize)]
struct QueuedResponse {
    queued: usize,
}

struct LoopbackTransport {
    collector: Collector,
    offline: bool,
}

#[derive(Default)]
struct SimulatedSensor {
    tick: u64,
}

struct LogDisplay;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("TEMPGUARD_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.tempguard"));
    let store = FileStore::open(data_dir.join("store.json"))?;
    let mac = std::env::var("TEMPGUARD_MAC")
        .ok()
        .and_then(|value| parse_mac(&value))
        .unwrap_or(DEFAULT_MAC);
    let station_reachable = env_flag("TEMPGUARD_STATION_REACHABLE", true);
    let collector_offline = env_flag("TEMPGUARD_COLLECTOR_OFFLINE", false);

    let app_state = AppState {
        store: store.clone(),
        restart: RestartLatch::default(),
        collector: Collector::default(),
    };

    let mut app = Router::new()
        .route("/", get(handle_config_page))
        .route("/configure", post(handle_configure))
        .route("/sensor-readings/", post(handle_sensor_reading))
        .route("/api/commands", post(handle_queue_command))
        .route("/api/collector", get(handle_collector_status));
    for path in CAPTIVE_PROBE_PATHS {
        app = app.route(path, get(handle_config_page));
    }
    let app = app.with_state(app_state.clone());

    let port = std::env::var("TEMPGUARD_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind provisioning server at {addr}"))?;
    info!("provisioning server listening on http://{addr}");

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!("provisioning server stopped: {err}");
        }
    });

    tokio::task::spawn_blocking(move || {
        run_sessions(app_state, mac, station_reachable, collector_offline)
    })
    .await
    .context("node loop panicked")?
}

/// Boots the node, runs its loop until it asks for a restart, then boots
/// again from the persisted store.
fn run_sessions(
    app_state: AppState,
    mac: [u8; 6],
    station_reachable: bool,
    collector_offline: bool,
) -> anyhow::Result<()> {
    loop {
        let mut store = app_state.store.clone();
        let plan = plan_boot(&mut store, mac).context("failed to load node config")?;

        let station_up = match &plan.mode {
            BootMode::Station { ssid, .. } => {
                info!("joining `{ssid}` (simulated)");
                associate_with_retry(
                    |_| {
                        if station_reachable {
                            Ok(())
                        } else {
                            Err("simulated beacon timeout")
                        }
                    },
                    |ms| thread::sleep(Duration::from_millis(ms)),
                )
            }
            BootMode::AccessPoint => false,
        };
        let station_planned = matches!(plan.mode, BootMode::Station { .. });

        let transport = LoopbackTransport {
            collector: app_state.collector.clone(),
            offline: collector_offline,
        };
        let mut node = Node::new(
            plan.config,
            store,
            SimulatedSensor::default(),
            LogDisplay,
            transport,
            app_state.restart.clone(),
            monotonic_ms(),
        );
        if station_planned && !station_up {
            node.enter_ap_fallback();
        }

        loop {
            match node.poll(monotonic_ms()) {
                Poll::Continue => thread::sleep(Duration::from_millis(LOOP_IDLE_MS)),
                Poll::Restart { delay_ms } => {
                    thread::sleep(Duration::from_millis(delay_ms));
                    info!("simulated restart");
                    break;
                }
            }
        }
    }
}

async fn handle_config_page(State(state): State<AppState>) -> axum::response::Response {
    match config_page(&state.store) {
        Ok(page) => Html(page).into_response(),
        Err(err) => {
            warn!("failed to render config page: {err}");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable")
        }
    }
}

async fn handle_configure(State(state): State<AppState>, body: Bytes) -> axum::response::Response {
    let mut store = state.store.clone();
    let result = ProvisioningForm::from_urlencoded(&body)
        .and_then(|form| provision(&mut store, &form).map(|()| form));

    match result {
        Ok(form) => {
            state.restart.request(PROVISION_RESTART_DELAY_MS);
            Html(render_confirmation_page(form.ssid.as_deref().unwrap_or_default()))
                .into_response()
        }
        Err(err) => {
            warn!("provisioning rejected: {err}");
            let status =
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
            text_response(status, &err.to_string())
        }
    }
}

async fn handle_sensor_reading(
    State(state): State<AppState>,
    Json(report): Json<ReadingReport>,
) -> impl IntoResponse {
    Json(state.collector.accept(report))
}

async fn handle_queue_command(
    State(state): State<AppState>,
    Json(envelope): Json<CommandEnvelope>,
) -> impl IntoResponse {
    let queued = state.collector.enqueue(envelope.into());
    Json(QueuedResponse { queued })
}

async fn handle_collector_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.collector.status())
}

fn config_page<S: KvStore>(store: &S) -> Result<String, StoreError> {
    let device_id = store.get_str(KEY_DEVICE_ID)?.unwrap_or_default();
    let api_base_url = store
        .get_str(KEY_API_BASE_URL)?
        .unwrap_or_else(|| default_api_base_url().to_string());
    Ok(render_config_page(&device_id, &api_base_url))
}

fn text_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        [("Content-Type", "text/plain; charset=utf-8")],
        message.to_string(),
    )
        .into_response()
}

impl FileStore {
    fn open(path: PathBuf) -> anyhow::Result<Self> {
        let values = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice::<MemoryStore>(&raw)
                .with_context(|| format!("invalid store file {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => MemoryStore::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path: Arc::new(path),
            values: Arc::new(Mutex::new(values)),
        })
    }

    fn values(&self) -> MutexGuard<'_, MemoryStore> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, values: &MemoryStore) -> Result<(), StoreError> {
        let backend = |err: &dyn std::fmt::Display| StoreError::Backend(err.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| backend(&err))?;
        }
        let payload = serde_json::to_vec_pretty(values).map_err(|err| backend(&err))?;
        std::fs::write(self.path.as_ref(), payload).map_err(|err| backend(&err))
    }
}

impl KvStore for FileStore {
    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.values().get_str(key)
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values();
        values.set_str(key, value)?;
        self.persist(&values)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        self.values().get_bool(key)
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        let mut values = self.values();
        values.set_bool(key, value)?;
        self.persist(&values)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values();
        values.remove(key)?;
        self.persist(&values)
    }
}

impl Collector {
    fn state(&self) -> MutexGuard<'_, CollectorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a reading and answers with the next queued command, if any.
    fn accept(&self, report: ReadingReport) -> serde_json::Value {
        let mut state = self.state();
        info!(
            "collector received {:.1} from {}",
            report.final_value, report.device_id
        );
        state.received = state.received.saturating_add(1);
        state.last_report = Some(report);

        match state.queued.pop_front() {
            Some(command) => serde_json::to_value(command.to_envelope())
                .unwrap_or_else(|_| serde_json::json!({ "status": "ok" })),
            None => serde_json::json!({ "status": "ok" }),
        }
    }

    fn enqueue(&self, command: RemoteCommand) -> usize {
        let mut state = self.state();
        info!("queued command `{}`", command.token());
        state.queued.push_back(command);
        state.queued.len()
    }

    fn status(&self) -> CollectorStatus {
        let state = self.state();
        CollectorStatus {
            received: state.received,
            queued: state
                .queued
                .iter()
                .map(|command| command.token().to_string())
                .collect(),
            last_report: state.last_report.clone(),
        }
    }
}

impl ReportTransport for LoopbackTransport {
    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<HttpReply, TransportError> {
        if self.offline {
            return Err(TransportError::Request(format!("{url}: collector offline")));
        }

        let report = match serde_json::from_slice::<ReadingReport>(body) {
            Ok(report) => report,
            Err(err) => {
                return Ok(HttpReply {
                    status: 400,
                    body: err.to_string().into_bytes(),
                })
            }
        };

        let reply = self.collector.accept(report);
        Ok(HttpReply {
            status: 200,
            body: serde_json::to_vec(&reply)
                .map_err(|err| TransportError::Request(err.to_string()))?,
        })
    }
}

impl SensorReader for SimulatedSensor {
    fn read(&mut self) -> Result<f32, SensorError> {
        self.tick = self.tick.saturating_add(1);
        Ok(21.0 + (self.tick % 8) as f32 * 0.3)
    }
}

impl StatusDisplay for LogDisplay {
    fn render(&mut self, screen: &Screen) -> Result<(), DisplayError> {
        info!("[display] {}", screen.lines().join(" | "));
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DisplayError> {
        info!("[display] cleared");
        Ok(())
    }
}

fn parse_mac(raw: &str) -> Option<[u8; 6]> {
    let mut mac = [0_u8; 6];
    let mut parts = raw.split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    parts.next().is_none().then_some(mac)
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.trim(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
