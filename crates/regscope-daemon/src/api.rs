//! REST API handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use regscope_core::{parse_hex_address, RegisterMap};
use regscope_link::{
    CatalogError, ConnectError, ConnectionStatus, DeviceConfig, DisconnectError, IoError,
    MapSummary,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

fn error_response(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(ApiError::new(msg))).into_response()
}

fn io_status(_error: &IoError) -> StatusCode {
    StatusCode::SERVICE_UNAVAILABLE
}

fn catalog_status(error: &CatalogError) -> StatusCode {
    match error {
        CatalogError::MapNotLoaded => StatusCode::PRECONDITION_FAILED,
        CatalogError::UnknownAddress(_) => StatusCode::NOT_FOUND,
        CatalogError::NotWritable(_) => StatusCode::FORBIDDEN,
        CatalogError::InvalidBit { .. } => StatusCode::BAD_REQUEST,
        CatalogError::InvalidMap(_) => StatusCode::UNPROCESSABLE_ENTITY,
        CatalogError::Io(e) => io_status(e),
    }
}

fn connect_status(error: &ConnectError) -> StatusCode {
    match error {
        ConnectError::AlreadyConnected | ConnectError::ConnectInProgress => StatusCode::CONFLICT,
        ConnectError::Unreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn disconnect_status(error: &DisconnectError) -> StatusCode {
    match error {
        DisconnectError::InProgress => StatusCode::CONFLICT,
        DisconnectError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn catalog_error(error: CatalogError) -> Response {
    error_response(catalog_status(&error), error.to_string())
}

fn parse_address(raw: &str) -> Result<u16, Response> {
    parse_hex_address(raw).ok_or_else(|| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("Invalid register address: {}", raw),
        )
    })
}

/// Accept a slave address as a hex string or a number
fn deserialize_slave<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    #[derive(Deserialize)]
    struct Hex(#[serde(with = "regscope_core::register::hex_address")] u16);

    Ok(Option::<Hex>::deserialize(deserializer)?.map(|h| h.0))
}

/// Session status
#[derive(Serialize)]
pub struct StatusResponse {
    pub session: Uuid,
    pub connection: ConnectionStatus,
    pub map: Option<MapSummary>,
}

/// Get connection status and the loaded map summary
pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let map = state.session.catalog().await.map().map(MapSummary::from);
    Json(StatusResponse {
        session: state.session.id(),
        connection: state.session.connection().status(),
        map,
    })
}

/// Connect to the device in the body, or the configured one
pub async fn connect(
    State(state): State<Arc<AppState>>,
    body: Option<Json<DeviceConfig>>,
) -> impl IntoResponse {
    let device = match body {
        Some(Json(device)) => device,
        None => state.config.to_device_config(),
    };

    info!(device = %device.device_path, "Connect requested");

    match state.connect(device).await {
        Ok(()) => Json(state.session.connection().status()).into_response(),
        Err(e) => error_response(connect_status(&e), e.to_string()),
    }
}

/// Disconnect from the device
pub async fn disconnect(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Disconnect requested");

    match state.session.disconnect().await {
        Ok(()) => Json(state.session.connection().status()).into_response(),
        Err(e) => error_response(disconnect_status(&e), e.to_string()),
    }
}

/// Forget the last recorded error
pub async fn clear_error(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.session.connection().clear_error();
    Json(state.session.connection().status())
}

/// Get the loaded register map
pub async fn get_map(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let catalog = state.session.catalog().await;
    match catalog.map() {
        Some(map) => Json(map.clone()).into_response(),
        None => catalog_error(CatalogError::MapNotLoaded),
    }
}

/// Replace the register map
pub async fn put_map(
    State(state): State<Arc<AppState>>,
    Json(map): Json<RegisterMap>,
) -> impl IntoResponse {
    info!(name = %map.name, registers = map.registers.len(), "Register map upload");

    match state.session.load_map(map).await {
        Ok(()) => {
            let summary = state.session.catalog().await.map().map(MapSummary::from);
            Json(summary).into_response()
        }
        Err(e) => catalog_error(e),
    }
}

/// List register definitions with their cached values
pub async fn list_registers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.session.snapshot().await;
    if snapshot.map.is_none() {
        return catalog_error(CatalogError::MapNotLoaded);
    }
    Json(snapshot.registers).into_response()
}

/// Get one register definition with its cached value
pub async fn get_register(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> impl IntoResponse {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(response) => return response,
    };

    if state.session.catalog().await.map().is_none() {
        return catalog_error(CatalogError::MapNotLoaded);
    }
    match state.session.register(address).await {
        Some(register) => Json(register).into_response(),
        None => catalog_error(CatalogError::UnknownAddress(address)),
    }
}

/// Optional slave override in the query string
#[derive(Deserialize)]
pub struct SlaveQuery {
    slave: Option<String>,
}

/// Read a register from the device
pub async fn read_register(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Query(query): Query<SlaveQuery>,
) -> impl IntoResponse {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(response) => return response,
    };
    let slave = match query.slave.as_deref().map(parse_address).transpose() {
        Ok(s) => s,
        Err(response) => return response,
    };

    match state
        .session
        .read_observation(address, state.slave_for(slave))
        .await
    {
        Ok(observation) => Json(observation).into_response(),
        Err(e) => catalog_error(e),
    }
}

/// Write request body
#[derive(Deserialize)]
pub struct WriteRequest {
    /// Logical value for the register
    value: u32,
    #[serde(default, deserialize_with = "deserialize_slave")]
    slave: Option<u16>,
}

/// Write a logical value to a register
pub async fn write_register(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Json(req): Json<WriteRequest>,
) -> impl IntoResponse {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(response) => return response,
    };

    match state
        .session
        .write_value(address, req.value, state.slave_for(req.slave))
        .await
    {
        Ok(observation) => Json(observation).into_response(),
        Err(e) => catalog_error(e),
    }
}

/// Bit write request body
#[derive(Deserialize)]
pub struct WriteBitRequest {
    value: bool,
    #[serde(default, deserialize_with = "deserialize_slave")]
    slave: Option<u16>,
}

/// Set or clear one bit of a register
pub async fn write_register_bit(
    State(state): State<Arc<AppState>>,
    Path((address, bit)): Path<(String, u8)>,
    Json(req): Json<WriteBitRequest>,
) -> impl IntoResponse {
    let address = match parse_address(&address) {
        Ok(a) => a,
        Err(response) => return response,
    };

    match state
        .session
        .write_bit(address, bit, req.value, state.slave_for(req.slave))
        .await
    {
        Ok(observation) => Json(observation).into_response(),
        Err(e) => catalog_error(e),
    }
}
