//! Survey endpoints, the owned resource behind the ownership check.
//!
//! Store layout:
//!
//! - `survey:{id}` - JSON survey record
//! - `survey:{id}:owner` - owner subject id, read by the ownership step

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::Authenticated;
use crate::models::{ApiResponse, CreateSurveyRequest, SurveyResponse};
use crate::state::AppState;

const MAX_TITLE_LEN: usize = 200;

pub fn survey_key(id: &str) -> String {
    format!("survey:{id}")
}

pub fn survey_owner_key(id: &str) -> String {
    format!("survey:{id}:owner")
}

/// Create a survey owned by the caller.
#[instrument(skip_all, fields(subject_id = %identity.subject_id))]
pub async fn create_survey(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(payload): Json<CreateSurveyRequest>,
) -> AppResult<(StatusCode, Json<ApiResponse<SurveyResponse>>)> {
    let title = payload.title.trim();
    if title.is_empty() {
        return Err(AppError::Validation("title must not be empty".to_string()));
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(AppError::Validation(format!(
            "title must be at most {MAX_TITLE_LEN} characters"
        )));
    }

    let survey = SurveyResponse {
        id: Uuid::new_v4().to_string(),
        title: title.to_string(),
        owner_id: identity.subject_id,
        created_at: Utc::now(),
    };
    let record = serde_json::to_string(&survey)
        .map_err(|e| AppError::Internal(format!("Failed to encode survey: {e}")))?;

    state.store.set(&survey_key(&survey.id), &record, None).await?;
    state
        .store
        .set(&survey_owner_key(&survey.id), &survey.owner_id, None)
        .await?;

    info!(survey_id = %survey.id, "Created survey");

    Ok((StatusCode::CREATED, Json(ApiResponse::ok(survey))))
}

/// Delete a survey. The ownership step has already checked the caller.
#[instrument(skip(state))]
pub async fn delete_survey(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.store.delete(&survey_key(&id)).await?;
    state.store.delete(&survey_owner_key(&id)).await?;

    info!(survey_id = %id, "Deleted survey");

    Ok(StatusCode::NO_CONTENT)
}
