//! Store inspection endpoint.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use tokio::sync::oneshot;

use crate::error::{AppError, Result};
use crate::websocket::{HostEvent, StoreInspection};
use crate::AppState;

/// Create store routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/stores/{store_id}", get(inspect_handler))
}

/// GET /stores/{store_id} - Structure hash, validation result and dump.
async fn inspect_handler(
    State(state): State<AppState>,
    Path(store_id): Path<String>,
) -> Result<Json<StoreInspection>> {
    let (reply, response) = oneshot::channel();
    state
        .events
        .send(HostEvent::Inspect {
            store_id: store_id.clone(),
            reply,
        })
        .map_err(|_| AppError::Internal("game loop stopped".to_string()))?;

    match response.await {
        Ok(Some(inspection)) => Ok(Json(inspection)),
        Ok(None) => Err(AppError::NotFound(format!("store {}", store_id))),
        Err(_) => Err(AppError::Internal("game loop dropped the request".to_string())),
    }
}
