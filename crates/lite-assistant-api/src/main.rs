//! Lite Assistant - Tasmota automation server

use automation_engine::{ActionExecutor, AutomationEngine, ExecutionLog, Scheduler, TimerService};
use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Local;
use mqtt_protocol::MqttTransport;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tasmota_core::{DeviceStore, TasmotaNetwork};
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod automations;
mod config;
mod devices;
mod response;
mod websocket;

use config::AppConfig;
use response::{ok, Reply};

/// Delay before the startup discovery broadcast
const SCAN_DELAY: Duration = Duration::from_secs(2);

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub transport: Arc<MqttTransport>,
    pub network: Arc<TasmotaNetwork>,
    pub executor: Arc<ActionExecutor>,
    pub timers: Arc<TimerService>,
    pub automations: Arc<AutomationEngine>,
    pub scheduler: Arc<Scheduler>,
    pub log: Arc<ExecutionLog>,
}

/// System info response
#[derive(Serialize)]
struct SystemInfo {
    name: String,
    version: String,
    time: String,
    date: String,
    weekday: String,
    timezone: String,
    mqtt_connected: bool,
    devices: usize,
    automations: usize,
    schedules: usize,
    active_timers: usize,
}

/// Get system info
async fn system_info(State(state): State<AppState>) -> Reply {
    let now = Local::now();
    let timezone = std::env::var("TZ").unwrap_or_else(|_| now.format("UTC%:z").to_string());

    ok(SystemInfo {
        name: "Lite Assistant".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        time: now.format("%H:%M:%S").to_string(),
        date: now.format("%Y-%m-%d").to_string(),
        weekday: now.format("%A").to_string(),
        timezone,
        mqtt_connected: state.transport.is_connected(),
        devices: state.network.devices().list().len(),
        automations: state.automations.list().len(),
        schedules: state.scheduler.list().len(),
        active_timers: state.timers.active_count(),
    })
}

/// Health check
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "mqtt_connected": state.transport.is_connected(),
    }))
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| websocket::handle_socket(socket, state))
}

fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/system/info", get(system_info))
        .route("/devices", get(devices::list_devices))
        .route("/devices/scan", post(devices::scan_devices))
        .route("/devices/:id", get(devices::get_device))
        .route("/devices/:id/command", post(devices::send_command))
        .route("/devices/:id/switch", post(devices::switch_device))
        .route("/devices/:id/timers", post(devices::start_timer))
        .route("/devices/:id/timers/:switch", delete(devices::cancel_timer))
        .route(
            "/automations",
            get(automations::list_automations).post(automations::create_automation),
        )
        .route(
            "/automations/:id",
            get(automations::get_automation)
                .put(automations::update_automation)
                .delete(automations::delete_automation),
        )
        .route("/automations/:id/enable", post(automations::enable_automation))
        .route("/automations/:id/disable", post(automations::disable_automation))
        .route("/automations/:id/trigger", post(automations::trigger_automation))
        .route("/automations/:id/logs", get(automations::automation_logs))
        .route("/logs", get(automations::all_logs))
        .route(
            "/schedules",
            get(automations::list_schedules).post(automations::create_schedule),
        )
        .route(
            "/schedules/:id",
            get(automations::get_schedule)
                .put(automations::update_schedule)
                .delete(automations::delete_schedule),
        )
        .route("/schedules/:id/enable", post(automations::enable_schedule))
        .route("/schedules/:id/disable", post(automations::disable_schedule));

    Router::new()
        .nest("/api/v1", api)
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown requested");
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "lite_assistant_api=debug,automation_engine=debug,tasmota_core=info,mqtt_protocol=info,info"
                    .into()
            }),
        )
        .init();

    tracing::info!("Starting Lite Assistant API server");

    let config = AppConfig::from_env()?;
    tokio::fs::create_dir_all(&config.data_dir).await?;
    tracing::info!("Data directory: {}", config.data_dir.display());

    let transport = Arc::new(MqttTransport::connect(&config.mqtt)?);
    let devices = Arc::new(DeviceStore::load(config.devices_path()).await);
    let network = Arc::new(TasmotaNetwork::new(transport.clone(), devices));
    let executor = Arc::new(ActionExecutor::new(network.clone()));
    let timers = Arc::new(TimerService::new(executor.clone()));
    let log = Arc::new(ExecutionLog::load(config.logs_path()).await);
    let automations = Arc::new(
        AutomationEngine::new(executor.clone(), log.clone(), Some(config.automations_path())).await,
    );
    let scheduler = Arc::new(
        Scheduler::new(executor.clone(), timers.clone(), Some(config.schedules_path())).await,
    );

    tracing::info!(
        "Loaded {} devices, {} automations, {} schedules",
        network.devices().list().len(),
        automations.list().len(),
        scheduler.list().len()
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![
        network.start(transport.subscribe(), shutdown_rx.clone()),
        scheduler.start(shutdown_rx.clone()),
    ];
    tasks.extend(automations.start(transport.subscribe(), shutdown_rx.clone()));

    let scan_network = network.clone();
    tokio::spawn(async move {
        tokio::time::sleep(SCAN_DELAY).await;
        if let Err(e) = scan_network.scan().await {
            tracing::warn!("Initial device scan failed: {}", e);
        }
    });

    let state = AppState {
        transport: transport.clone(),
        network,
        executor,
        timers,
        automations,
        scheduler,
        log,
    };

    tracing::info!("Listening on http://{}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await?;

    // Listeners exit at their next await point
    futures::future::join_all(tasks).await;
    transport.disconnect().await;
    tracing::info!("Lite Assistant stopped");

    Ok(())
}
