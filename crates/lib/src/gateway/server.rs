//! Gateway HTTP server (single port).

use crate::clock::{Clock, SystemClock};
use crate::config::{self, Config};
use crate::dispatch::{AutomationEndpoint, Dispatcher, WebhookClient};
use crate::gateway::protocol::{
    require_number, ControlError, NumberBody, OperatorSignalBody, SendMessageBody,
};
use crate::metrics::Metrics;
use crate::ownership::{ConfigUpdate, OperatorAction, OwnershipEngine, OwnershipSettings};
use crate::persistence::{self, SnapshotStore};
use crate::relay::{self, Relay};
use crate::transport::{HttpBridgeTransport, MessagingTransport, TransportEvent, TransportHealth};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

const EVENT_QUEUE_CAPACITY: usize = 256;

/// External collaborators of the relay. Tests substitute them.
#[derive(Clone)]
pub struct Collaborators {
    pub automation: Arc<dyn AutomationEndpoint>,
    pub transport: Arc<dyn MessagingTransport>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Webhook automation client, HTTP transport bridge and the system clock.
    pub fn from_config(config: &Config) -> Self {
        Self {
            automation: Arc::new(WebhookClient::from_config(config)),
            transport: Arc::new(HttpBridgeTransport::new(config.transport.send_url.clone())),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Shared state for the gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub engine: OwnershipEngine,
    pub transport: Arc<dyn MessagingTransport>,
    pub transport_health: TransportHealth,
    /// Sender for transport events; the relay's processor task receives.
    pub events_tx: mpsc::Sender<TransportEvent>,
    pub started_at: Instant,
}

impl GatewayState {
    fn timestamp(&self) -> i64 {
        self.engine.now().timestamp_millis()
    }

    fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Control API routes.
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/operator-active", post(operator_active))
        .route("/force-bot-mode", post(force_bot_mode))
        .route("/conversation-state/:number", get(conversation_state))
        .route("/bot-message-sent", post(bot_message_sent))
        .route("/send-message", post(send_message))
        .route("/health", get(health_http))
        .route("/metrics", get(metrics_http))
        .route("/config", get(get_config).post(update_config))
        .route("/transport/events", post(transport_events))
        .with_state(state)
}

/// Run the relay with collaborators built from config. Blocks until shutdown (e.g. Ctrl+C).
/// `config_path` is used to resolve the snapshot file.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    let collaborators = Collaborators::from_config(&config);
    run_gateway_with(config, config_path, collaborators).await
}

/// Run the relay: restore the snapshot, start the event processor, reaper and backup loops,
/// then serve the control API. On shutdown all scheduled tasks are cancelled and a final
/// snapshot is written.
pub async fn run_gateway_with(
    config: Config,
    config_path: PathBuf,
    collaborators: Collaborators,
) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !is_loopback_bind(&bind) {
        log::warn!(
            "gateway: binding control api to {} (not loopback); it has no authentication",
            bind
        );
    }

    let metrics = Arc::new(Metrics::new());
    let dispatcher = Dispatcher::new(collaborators.automation.clone());
    let engine = OwnershipEngine::new(
        OwnershipSettings::from(&config.ownership),
        collaborators.clock.clone(),
        dispatcher.clone(),
        metrics,
    );

    let snapshots = SnapshotStore::new(config::resolve_backup_path(&config, &config_path));
    persistence::restore_on_startup(&engine, &snapshots).await;
    let expired = engine.expire_stale_operators().await;
    if !expired.is_empty() {
        log::info!(
            "bot: {} restored conversation(s) past the operator timeout handed over",
            expired.len()
        );
    }

    let transport_health = TransportHealth::new();
    let (events_tx, events_rx) = mpsc::channel::<TransportEvent>(EVENT_QUEUE_CAPACITY);
    let relay = Relay::new(engine.clone(), dispatcher, transport_health.clone());
    let background = vec![
        tokio::spawn(relay::run_event_loop(relay, events_rx)),
        tokio::spawn(relay::reaper_loop(
            engine.clone(),
            config.ownership.reap_interval(),
        )),
        tokio::spawn(persistence::backup_loop(
            engine.clone(),
            snapshots.clone(),
            config.backup.interval(),
        )),
    ];

    let state = GatewayState {
        config: Arc::new(config.clone()),
        engine: engine.clone(),
        transport: collaborators.transport,
        transport_health,
        events_tx,
        started_at: Instant::now(),
    };
    let app = build_router(state);

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway: relay control api listening on {}", bind_addr);
    log::info!(
        "gateway: endpoints /operator-active, /force-bot-mode, /conversation-state/:number, /bot-message-sent, /send-message, /health, /metrics, /config, /transport/events"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server exited")?;

    for handle in background {
        handle.abort();
    }
    let cancelled = engine.shutdown().await;
    log::info!("gateway: {} scheduled task(s) cancelled", cancelled);
    persistence::save_once(&engine, &snapshots).await;
    log::info!("gateway stopped");
    Ok(())
}

fn is_loopback_bind(bind: &str) -> bool {
    bind == "127.0.0.1" || bind == "::1" || bind == "localhost"
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, stopping relay");
}

/// POST /operator-active: operator CONNECT / TYPING / MESSAGE_SENT / DISCONNECT.
async fn operator_active(
    State(state): State<GatewayState>,
    Json(body): Json<OperatorSignalBody>,
) -> Result<Json<serde_json::Value>, ControlError> {
    let number = require_number(body.number)?;
    let action = OperatorAction::parse(body.action.as_deref());
    let conv = state.engine.on_operator_signal(&number, &action).await;
    log::info!(
        "operator: {} sent {:?} for {}",
        body.operator_id.as_deref().unwrap_or("?"),
        action,
        number
    );
    Ok(Json(json!({
        "success": true,
        "operatorActive": conv.operator_active,
        "timestamp": state.timestamp(),
    })))
}

/// POST /force-bot-mode: hand the conversation to the bot now.
async fn force_bot_mode(
    State(state): State<GatewayState>,
    Json(body): Json<NumberBody>,
) -> Result<Json<serde_json::Value>, ControlError> {
    let number = require_number(body.number)?;
    let conv = state.engine.force_bot_mode(&number).await;
    Ok(Json(json!({
        "success": true,
        "botActive": !conv.operator_active,
    })))
}

/// GET /conversation-state/:number
async fn conversation_state(
    State(state): State<GatewayState>,
    Path(number): Path<String>,
) -> Json<serde_json::Value> {
    let conv = state.engine.get_state(&number).await;
    let mut body = serde_json::to_value(&conv).unwrap_or_else(|_| json!({ "number": number }));
    body["timestamp"] = json!(state.timestamp());
    Json(body)
}

/// POST /bot-message-sent: the bot reply went out; clears the pending takeover request.
async fn bot_message_sent(
    State(state): State<GatewayState>,
    Json(body): Json<NumberBody>,
) -> Result<Json<serde_json::Value>, ControlError> {
    let number = require_number(body.number)?;
    state.engine.confirm_bot_message_sent(&number).await;
    Ok(Json(json!({ "success": true })))
}

/// POST /send-message: send through the transport (used by the automation).
async fn send_message(
    State(state): State<GatewayState>,
    Json(body): Json<SendMessageBody>,
) -> Result<Response, ControlError> {
    let (message, from_bot) = body.into_outgoing()?;
    match state.transport.send_message(&message).await {
        Ok(sent) => {
            if from_bot {
                state.engine.confirm_bot_message_sent(&message.to).await;
            }
            state.engine.metrics().message_sent();
            log::info!("outbound: message sent to {}", message.to);
            Ok(Json(json!({
                "success": true,
                "messageId": sent.message_id,
                "timestamp": state.timestamp(),
            }))
            .into_response())
        }
        Err(e) => {
            log::error!("outbound: sending to {} failed: {}", message.to, e);
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": "failed to send message",
                    "details": e.to_string(),
                })),
            )
                .into_response())
        }
    }
}

/// GET /health: 200 while the transport is usable, 503 after disconnect or auth failure.
async fn health_http(State(state): State<GatewayState>) -> Response {
    let transport = state.transport_health.get().await;
    let healthy = transport.is_healthy();
    let body = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "transport": transport,
        "activeConversations": state.engine.session_count().await,
        "uptime": state.uptime_secs(),
        "timestamp": state.timestamp(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// GET /metrics
async fn metrics_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let mut body = serde_json::to_value(state.engine.metrics().snapshot()).unwrap_or_else(|_| json!({}));
    body["activeConversations"] = json!(state.engine.session_count().await);
    body["uptime"] = json!(state.uptime_secs());
    body["timestamp"] = json!(state.timestamp());
    Json(body)
}

/// GET /config: live ownership settings.
async fn get_config(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let settings = state.engine.settings().await;
    Json(json!({
        "ownership": settings.view(),
        "backupIntervalMinutes": state.config.backup.interval_minutes,
        "reapIntervalMinutes": state.config.ownership.reap_interval_minutes,
    }))
}

/// POST /config: `{operatorTimeoutMinutes?, botDelaySeconds?}`.
async fn update_config(
    State(state): State<GatewayState>,
    Json(update): Json<ConfigUpdate>,
) -> Json<serde_json::Value> {
    let settings = state.engine.update_config(update).await;
    Json(json!({ "success": true, "config": settings.view() }))
}

/// POST /transport/events: the transport bridge reports a messaging event.
async fn transport_events(
    State(state): State<GatewayState>,
    Json(event): Json<TransportEvent>,
) -> StatusCode {
    if state.events_tx.send(event).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}
