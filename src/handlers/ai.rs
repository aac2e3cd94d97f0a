//! Question suggestions for survey authors.
//!
//! Stands in for a paid model call: the endpoint exists so the `ai` quota
//! class guards something. Suggestions are generated from templates.

use axum::Json;
use tracing::{debug, instrument};

use crate::error::{AppError, AppResult};
use crate::middleware::Authenticated;
use crate::models::{ApiResponse, SuggestionRequest, SuggestionResponse};

const MAX_SUGGESTIONS: usize = 10;
const MAX_TOPIC_LEN: usize = 100;

const TEMPLATES: [&str; MAX_SUGGESTIONS] = [
    "How satisfied are you with {topic}?",
    "How often do you use {topic}?",
    "What do you like most about {topic}?",
    "What would you change about {topic}?",
    "How likely are you to recommend {topic} to a friend?",
    "How does {topic} compare to alternatives you have tried?",
    "What problem does {topic} solve for you?",
    "How easy was it to get started with {topic}?",
    "Which feature of {topic} do you use least?",
    "Is there anything else you would like to tell us about {topic}?",
];

#[instrument(skip_all, fields(subject_id = %identity.subject_id))]
pub async fn suggest_questions(
    Authenticated(identity): Authenticated,
    Json(payload): Json<SuggestionRequest>,
) -> AppResult<Json<ApiResponse<SuggestionResponse>>> {
    let topic = payload.topic.trim();
    if topic.is_empty() || topic.chars().count() > MAX_TOPIC_LEN {
        return Err(AppError::Validation(format!(
            "topic must be between 1 and {MAX_TOPIC_LEN} characters"
        )));
    }
    if payload.count == 0 || payload.count > MAX_SUGGESTIONS {
        return Err(AppError::Validation(format!(
            "count must be between 1 and {MAX_SUGGESTIONS}"
        )));
    }

    let suggestions: Vec<String> = TEMPLATES
        .iter()
        .take(payload.count)
        .map(|template| template.replace("{topic}", topic))
        .collect();

    debug!(count = suggestions.len(), "Generated suggestions");

    Ok(Json(ApiResponse::ok(SuggestionResponse {
        topic: topic.to_string(),
        suggestions,
    })))
}
