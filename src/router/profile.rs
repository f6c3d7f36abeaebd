use axum::{Extension, Json};

use crate::identity::Identity;

/// Handler returning the authenticated identity.
pub async fn handler(Extension(identity): Extension<Identity>) -> Json<Identity> {
    Json(identity)
}
