// =============================================================================
// REST surface (§6) — `GET /health`, AI, Risk, Admin, Engines, Paper.
// =============================================================================
//
// Generalizes the teacher's `api/rest.rs` router shape (one handler per route,
// `AuthBearer` gating mutating endpoints, JSON in/out) onto the new
// `AppState`. Every handler returns `{ok, error, detail}` on failure per §7,
// via the single `ApiError` type below rather than the teacher's ad hoc
// `ExecutionResult` Display strings.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::app_state::AppState;
use crate::domain::GuardrailsPatch;
use crate::engine_manager::BatchAction;
use crate::errors::CoreError;
use crate::strategy_engine::StrategyProfile;
use crate::types::{Side, Symbol};

use super::auth::AuthBearer;
use super::ws::ws_handler;

// ---------------------------------------------------------------------------
// Uniform error envelope (§7)
// ---------------------------------------------------------------------------

pub struct ApiError {
    status: StatusCode,
    kind: String,
    detail: Option<String>,
}

impl ApiError {
    fn new(status: StatusCode, kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            status,
            kind: kind.into(),
            detail: Some(detail.into()),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_input", detail)
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        let status = match &e {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::PolicyRejected(_) => StatusCode::CONFLICT,
            CoreError::StalePrice(_) | CoreError::StaleFeatures { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: e.kind().to_string(),
            detail: Some(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "ok": false,
            "error": self.kind,
            "detail": self.detail,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_profile(raw: Option<&str>) -> StrategyProfile {
    match raw.map(str::to_lowercase).as_deref() {
        Some("scalp") => StrategyProfile::Scalp,
        Some("swing") => StrategyProfile::Swing,
        _ => StrategyProfile::Day,
    }
}

fn parse_side(raw: &str) -> Result<Side, ApiError> {
    match raw.to_lowercase().as_str() {
        "buy" => Ok(Side::Buy),
        "sell" => Ok(Side::Sell),
        "flat" => Ok(Side::Flat),
        other => Err(ApiError::bad_request(format!("unknown side: {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/ai/predict", get(ai_predict))
        .route("/ai/select", post(ai_select))
        .route(
            "/risk/guardrails",
            get(guardrails_get).post(guardrails_patch),
        )
        .route(
            "/risk/guardrails/trigger-cooldown",
            post(guardrails_trigger_cooldown),
        )
        .route(
            "/risk/guardrails/clear-cooldown",
            post(guardrails_clear_cooldown),
        )
        .route("/admin/kill", post(admin_kill))
        .route("/admin/unkill", post(admin_unkill))
        .route("/engines", get(engines_list))
        .route("/engines/batch", post(engines_batch))
        .route("/engines/:symbol/start", post(engines_start))
        .route("/engines/:symbol/stop", post(engines_stop))
        .route("/engines/:symbol/restart", post(engines_restart))
        .route("/paper/order", post(paper_order))
        .route("/paper/summary", get(paper_summary))
        .route("/paper/positions", get(paper_positions))
        .route("/paper/trades", get(paper_trades))
        .route("/paper/portfolio", get(paper_portfolio))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct HealthBody {
    ok: bool,
}

async fn health() -> Json<HealthBody> {
    Json(HealthBody { ok: true })
}

// ---------------------------------------------------------------------------
// AI / Model Provider
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PredictQuery {
    symbol: String,
    #[serde(default = "default_horizon")]
    h: String,
}

fn default_horizon() -> String {
    "60s".to_string()
}

async fn ai_predict(
    State(state): State<Arc<AppState>>,
    Query(q): Query<PredictQuery>,
) -> ApiResult<crate::domain::Prediction> {
    let symbol = Symbol::new(&q.symbol);
    let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let features = state.feature_cache.compute(&symbol, now_ns);
    let prediction = state
        .model_provider
        .predict(&symbol, &q.h, features.as_ref())
        .await;
    Ok(Json(prediction))
}

#[derive(Deserialize)]
struct SelectBody {
    name: String,
}

async fn ai_select(
    State(state): State<Arc<AppState>>,
    _auth: AuthBearer,
    Json(body): Json<SelectBody>,
) -> ApiResult<crate::model_provider::ActiveModel> {
    state.model_provider.select(body.name);
    Ok(Json(state.model_provider.active()))
}

// ---------------------------------------------------------------------------
// Risk & Guardrails
// ---------------------------------------------------------------------------

async fn guardrails_get(
    State(state): State<Arc<AppState>>,
) -> ApiResult<crate::risk::GuardrailsState> {
    Ok(Json(state.guardrails()))
}

async fn guardrails_patch(
    State(state): State<Arc<AppState>>,
    AuthBearer(actor): AuthBearer,
    Json(patch): Json<GuardrailsPatch>,
) -> ApiResult<crate::risk::GuardrailsState> {
    state.risk.set_guardrails(patch, &actor);
    Ok(Json(state.guardrails()))
}

#[derive(Deserialize, Default)]
struct CooldownBody {
    #[serde(default = "default_cooldown_minutes")]
    minutes: i64,
}

fn default_cooldown_minutes() -> i64 {
    15
}

async fn guardrails_trigger_cooldown(
    State(state): State<Arc<AppState>>,
    AuthBearer(actor): AuthBearer,
    body: Option<Json<CooldownBody>>,
) -> ApiResult<crate::risk::GuardrailsState> {
    let minutes = body
        .map(|b| b.0.minutes)
        .unwrap_or_else(default_cooldown_minutes);
    state.risk.trigger_cooldown(minutes, &actor);
    Ok(Json(state.guardrails()))
}

async fn guardrails_clear_cooldown(
    State(state): State<Arc<AppState>>,
    AuthBearer(actor): AuthBearer,
) -> ApiResult<crate::risk::GuardrailsState> {
    state.risk.clear_cooldown(&actor);
    Ok(Json(state.guardrails()))
}

// ---------------------------------------------------------------------------
// Admin (kill switch)
// ---------------------------------------------------------------------------

async fn admin_kill(
    State(state): State<Arc<AppState>>,
    AuthBearer(actor): AuthBearer,
) -> ApiResult<crate::risk::GuardrailsState> {
    state.risk.kill(&actor);
    Ok(Json(state.guardrails()))
}

async fn admin_unkill(
    State(state): State<Arc<AppState>>,
    AuthBearer(actor): AuthBearer,
) -> ApiResult<crate::risk::GuardrailsState> {
    state.risk.unkill(&actor);
    Ok(Json(state.guardrails()))
}

// ---------------------------------------------------------------------------
// Engines
// ---------------------------------------------------------------------------

async fn engines_list(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<crate::engine_manager::EngineSummary>> {
    Ok(Json(state.engines_summary()))
}

#[derive(Deserialize, Default)]
struct EngineActionBody {
    mode: Option<String>,
    #[serde(default)]
    params: serde_json::Value,
}

async fn engines_start(
    State(state): State<Arc<AppState>>,
    AuthBearer(_actor): AuthBearer,
    Path(symbol): Path<String>,
    body: Option<Json<EngineActionBody>>,
) -> ApiResult<crate::engine_manager::EngineSummary> {
    let profile = parse_profile(body.as_ref().and_then(|b| b.mode.as_deref()));
    let summary = state.engines.start(Symbol::new(&symbol), profile);
    Ok(Json(summary))
}

async fn engines_stop(
    State(state): State<Arc<AppState>>,
    AuthBearer(_actor): AuthBearer,
    Path(symbol): Path<String>,
) -> ApiResult<serde_json::Value> {
    let stopped = state.engines.stop(&Symbol::new(&symbol), false);
    Ok(Json(serde_json::json!({"ok": true, "stopped": stopped})))
}

async fn engines_restart(
    State(state): State<Arc<AppState>>,
    AuthBearer(_actor): AuthBearer,
    Path(symbol): Path<String>,
    body: Option<Json<EngineActionBody>>,
) -> ApiResult<crate::engine_manager::EngineSummary> {
    let sym = Symbol::new(&symbol);
    state.engines.stop(&sym, true);
    let profile = parse_profile(body.as_ref().and_then(|b| b.mode.as_deref()));
    let summary = state.engines.start(sym, profile);
    Ok(Json(summary))
}

#[derive(Deserialize)]
struct BatchBody {
    symbols: Vec<String>,
    action: String,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Serialize)]
struct BatchResultItem {
    symbol: String,
    ok: bool,
}

async fn engines_batch(
    State(state): State<Arc<AppState>>,
    AuthBearer(_actor): AuthBearer,
    Json(body): Json<BatchBody>,
) -> ApiResult<Vec<BatchResultItem>> {
    let action = match body.action.to_lowercase().as_str() {
        "start" => BatchAction::Start,
        "stop" => BatchAction::Stop,
        other => {
            return Err(ApiError::bad_request(format!(
                "unknown batch action: {other}"
            )))
        }
    };
    let profile = parse_profile(body.mode.as_deref());
    let symbols: Vec<Symbol> = body.symbols.iter().map(Symbol::new).collect();
    let results = state.engines.batch(symbols, action, profile);
    Ok(Json(
        results
            .into_iter()
            .map(|(symbol, ok)| BatchResultItem { symbol, ok })
            .collect(),
    ))
}

// ---------------------------------------------------------------------------
// Paper Execution
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct OrderBody {
    symbol: String,
    side: String,
    notional_usd: f64,
    client_request_id: Option<String>,
}

async fn paper_order(
    State(state): State<Arc<AppState>>,
    AuthBearer(_actor): AuthBearer,
    Json(body): Json<OrderBody>,
) -> ApiResult<crate::domain::Fill> {
    let side = parse_side(&body.side)?;
    if body.notional_usd <= 0.0 {
        return Err(ApiError::bad_request("notional_usd must be positive"));
    }
    let client_request_id = body
        .client_request_id
        .unwrap_or_else(|| ulid::Ulid::new().to_string());
    let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    let fill = state.paper.submit_order(
        Symbol::new(&body.symbol),
        side,
        body.notional_usd,
        client_request_id,
        now_ns,
    )?;
    Ok(Json(fill))
}

#[derive(Serialize)]
struct PaperSummary {
    positions: Vec<crate::domain::Position>,
    equity: Option<crate::domain::EquitySnapshot>,
    trade_count: usize,
}

async fn paper_summary(State(state): State<Arc<AppState>>) -> ApiResult<PaperSummary> {
    let positions = state.positions();
    let trades = state.trades(usize::MAX);
    Ok(Json(PaperSummary {
        positions,
        equity: state.equity(),
        trade_count: trades.len(),
    }))
}

async fn paper_positions(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<crate::domain::Position>> {
    Ok(Json(state.positions()))
}

#[derive(Deserialize, Default)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn paper_trades(
    State(state): State<Arc<AppState>>,
    Query(q): Query<LimitQuery>,
) -> ApiResult<Vec<crate::domain::Trade>> {
    Ok(Json(state.trades(q.limit.unwrap_or(100))))
}

#[derive(Serialize)]
struct Portfolio {
    positions: Vec<crate::domain::Position>,
    equity: Option<crate::domain::EquitySnapshot>,
}

async fn paper_portfolio(State(state): State<Arc<AppState>>) -> ApiResult<Portfolio> {
    Ok(Json(Portfolio {
        positions: state.positions(),
        equity: state.equity(),
    }))
}
