//! Service description at `/`

use std::collections::BTreeMap;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct IndexResponse {
    pub message: &'static str,
    pub endpoints: BTreeMap<String, String>,
}

/// List the mounted upload endpoints
pub async fn index(State(state): State<AppState>) -> Json<IndexResponse> {
    let mut endpoints: BTreeMap<String, String> = state
        .mounts()
        .iter()
        .map(|mount| (mount.name.clone(), mount.path.clone()))
        .collect();
    endpoints.insert("health".to_string(), "/health".to_string());

    Json(IndexResponse {
        message: "TUS Upload Server",
        endpoints,
    })
}
