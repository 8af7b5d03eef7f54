//! HTTP surface for the core RPC operations and the websocket upgrade.
//!
//! Thin handlers over the fetch coordinator; every error kind maps onto a
//! status code here and nowhere else. Routing beyond this module (auth,
//! rate limiting, schema shaping) belongs to the ingress collaborators.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::errors::FetchError;
use crate::fetcher::DataFetcher;
use crate::models::{Interval, Market};
use crate::store::ScreenerQuery;
use crate::ws::{self, ConnectionManager, StreamService};

#[derive(Clone)]
pub struct ApiState {
    pub fetcher: Arc<DataFetcher>,
    pub connections: Arc<ConnectionManager>,
    pub streams: Arc<StreamService>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/symbols", get(get_symbols))
        .route("/api/symbols/refresh", post(post_refresh_symbols))
        .route("/api/ohlcv/:symbol", get(get_ohlcv))
        .route("/api/fundamentals/:symbol", get(get_fundamentals))
        .route("/api/corporate-actions/:symbol", get(get_corporate_actions))
        .route("/api/annual-earnings/:symbol", get(get_annual_earnings))
        .route("/api/screener", get(get_screener))
        .route("/api/cache/invalidate/:symbol", post(post_invalidate_symbol))
        .route("/api/cache/stats", get(get_cache_stats))
        .route("/api/ws/stats", get(get_ws_stats))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

/// Map coordinator failures onto client-visible statuses.
fn error_response(err: FetchError) -> Response {
    let (status, code) = match &err {
        FetchError::InputInvalid(_) => (StatusCode::BAD_REQUEST, "input_invalid"),
        FetchError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
        FetchError::StoreConflict(_) => (StatusCode::CONFLICT, "store_conflict"),
        FetchError::CacheUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "cache_unavailable"),
        FetchError::CircuitOpen { .. } => (StatusCode::SERVICE_UNAVAILABLE, "circuit_open"),
        FetchError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_failed"),
        FetchError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    let body = Json(json!({
        "error_code": code,
        "error_message": err.to_string(),
    }));
    let mut response = (status, body).into_response();
    if status == StatusCode::SERVICE_UNAVAILABLE {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, header::HeaderValue::from_static("30"));
    }
    response
}

async fn get_health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
struct MarketQuery {
    market: Option<String>,
}

fn parse_market(raw: Option<&str>) -> Result<Market, Response> {
    let raw = raw.unwrap_or("A_share");
    Market::parse(raw)
        .ok_or_else(|| error_response(FetchError::InputInvalid(format!("unknown market: {raw}"))))
}

async fn get_symbols(
    State(state): State<ApiState>,
    Query(query): Query<MarketQuery>,
) -> Response {
    let market = match parse_market(query.market.as_deref()) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    match state.fetcher.get_symbol_list(market).await {
        Ok(symbols) => Json(symbols).into_response(),
        Err(err) => error_response(err),
    }
}

async fn post_refresh_symbols(
    State(state): State<ApiState>,
    Query(query): Query<MarketQuery>,
) -> Response {
    let market = match parse_market(query.market.as_deref()) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    match state.fetcher.force_refresh_symbol_list(market).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct OhlcvQuery {
    interval: Option<String>,
    trade_date: Option<String>,
}

async fn get_ohlcv(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
    Query(query): Query<OhlcvQuery>,
) -> Response {
    let interval_raw = query.interval.as_deref().unwrap_or("daily");
    let Some(interval) = Interval::parse(interval_raw) else {
        return error_response(FetchError::InputInvalid(format!(
            "unknown interval: {interval_raw}"
        )));
    };
    let trade_date = match &query.trade_date {
        None => None,
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(d) => Some(d),
            Err(_) => {
                return error_response(FetchError::InputInvalid(format!(
                    "unparseable trade_date: {raw}"
                )))
            }
        },
    };

    match state.fetcher.get_ohlcv(&symbol, interval, trade_date).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_fundamentals(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
) -> Response {
    match state.fetcher.get_fundamentals(&symbol).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_corporate_actions(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
) -> Response {
    match state.fetcher.get_corporate_actions(&symbol).await {
        Ok(actions) => Json(actions).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_annual_earnings(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
) -> Response {
    match state.fetcher.get_annual_earnings(&symbol).await {
        Ok(earnings) => Json(earnings).into_response(),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ScreenerParams {
    market: Option<String>,
    min_pe: Option<f64>,
    max_pe: Option<f64>,
    min_pb: Option<f64>,
    max_pb: Option<f64>,
    min_market_cap: Option<f64>,
    max_market_cap: Option<f64>,
    min_dividend_yield: Option<f64>,
    limit: Option<usize>,
}

async fn get_screener(
    State(state): State<ApiState>,
    Query(params): Query<ScreenerParams>,
) -> Response {
    let market = match parse_market(params.market.as_deref()) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    let query = ScreenerQuery {
        min_pe: params.min_pe,
        max_pe: params.max_pe,
        min_pb: params.min_pb,
        max_pb: params.max_pb,
        min_market_cap: params.min_market_cap,
        max_market_cap: params.max_market_cap,
        min_dividend_yield: params.min_dividend_yield,
        limit: params.limit.unwrap_or(100).min(1_000),
    };
    match state.fetcher.screen_metrics(market, query).await {
        Ok(hits) => Json(hits).into_response(),
        Err(err) => error_response(err),
    }
}

async fn post_invalidate_symbol(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
) -> Response {
    match state.fetcher.invalidate_symbol(&symbol).await {
        Ok(purged) => Json(json!({"purged": purged})).into_response(),
        Err(err) => error_response(err),
    }
}

async fn get_cache_stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({"l1": state.fetcher.cache().l1_stats()}))
}

async fn get_ws_stats(State(state): State<ApiState>) -> Json<serde_json::Value> {
    Json(json!({
        "connections": state.connections.stats(),
        "active_streams": state.streams.active_workers(),
    }))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    client_id: Option<String>,
}

async fn ws_upgrade(
    State(state): State<ApiState>,
    Query(query): Query<WsQuery>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| {
        ws::serve_socket(socket, state.connections, state.streams, query.client_id, None)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_statuses_follow_the_policy() {
        let resp = error_response(FetchError::InputInvalid("bad".into()));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = error_response(FetchError::StoreUnavailable("down".into()));
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.headers().contains_key(header::RETRY_AFTER));

        let resp = error_response(FetchError::CircuitOpen {
            symbol: "AAPL".into(),
        });
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp = error_response(FetchError::Internal("bug".into()));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn market_defaults_to_a_share() {
        assert_eq!(parse_market(None).unwrap(), Market::AShare);
        assert_eq!(parse_market(Some("US_stock")).unwrap(), Market::UsStock);
        assert!(parse_market(Some("NASDAQ")).is_err());
    }
}
