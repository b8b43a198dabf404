//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mibridge_core::{DeviceId, StateValue};
use mibridge_platform::{BindingError, Characteristic};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

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

fn not_found(what: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(ApiError::new(format!("{} not found", what)))).into_response()
}

struct BindingErrorResponse(BindingError);

impl IntoResponse for BindingErrorResponse {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            BindingError::UnknownAccessory(_) | BindingError::UnsupportedCharacteristic { .. } => {
                StatusCode::NOT_FOUND
            }
            BindingError::InvalidValue { .. } => StatusCode::BAD_REQUEST,
            BindingError::ReadOnly(_) => StatusCode::METHOD_NOT_ALLOWED,
            BindingError::CommandFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(ApiError::new(self.0.to_string()))).into_response()
    }
}

/// Characteristic value
#[derive(Debug, Serialize, Deserialize)]
pub struct ValueBody {
    pub value: Option<StateValue>,
}

/// List all accessories
pub async fn list_accessories(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.accessories().await)
}

/// Get a specific accessory by id
pub async fn get_accessory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(id) = DeviceId::new(id) else {
        return not_found("Accessory");
    };
    match state.accessory(&id).await {
        Some(view) => Json(view).into_response(),
        None => not_found("Accessory"),
    }
}

/// Read a characteristic from cached state
pub async fn read_characteristic(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
) -> impl IntoResponse {
    let (Some(id), Some(characteristic)) = (DeviceId::new(id), Characteristic::from_name(&name)) else {
        return not_found("Characteristic");
    };
    match state.platform.bindings().read(&id, characteristic).await {
        Ok(value) => Json(ValueBody { value }).into_response(),
        Err(e) => BindingErrorResponse(e).into_response(),
    }
}

/// Write a characteristic through to the device
pub async fn write_characteristic(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
    Json(body): Json<ValueBody>,
) -> impl IntoResponse {
    let (Some(id), Some(characteristic)) = (DeviceId::new(id), Characteristic::from_name(&name)) else {
        return not_found("Characteristic");
    };
    let Some(value) = body.value else {
        return (StatusCode::BAD_REQUEST, Json(ApiError::new("Missing value"))).into_response();
    };

    info!(device = %id, characteristic = %characteristic, "Characteristic write requested");
    match state.platform.bindings().write(&id, characteristic, value).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => BindingErrorResponse(e).into_response(),
    }
}
