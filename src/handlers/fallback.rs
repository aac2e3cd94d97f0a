//! Catch-all for paths no route group claims.

use axum::http::Uri;

use crate::error::AppError;

/// Plain 404 envelope. Runs no pipeline, so unknown paths never spend quota
/// or touch the store.
pub async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("No route for {}", uri.path()))
}
