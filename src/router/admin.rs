//! Administrative session management.

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::Result;
use crate::identity::Identity;

#[derive(Debug, Serialize, Deserialize)]
pub struct Revoked {
    pub revoked: u64,
}

/// Handler closing every session of `identity_id`.
pub async fn revoke(
    State(state): State<AppState>,
    Extension(admin): Extension<Identity>,
    Path(identity_id): Path<String>,
) -> Result<Json<Revoked>> {
    let revoked = state.rotator.revoke_identity(&identity_id).await?;
    tracing::info!(admin_id = %admin.id, %identity_id, revoked, "sessions revoked by admin");

    Ok(Json(Revoked { revoked }))
}
