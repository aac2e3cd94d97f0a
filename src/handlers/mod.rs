mod admin;
mod ai;
mod auth;
mod fallback;
mod health;
pub mod surveys;

pub use admin::stats;
pub use ai::suggest_questions;
pub use auth::{csrf_token, login, me, signup};
pub use fallback::not_found;
pub use health::{health_check, readiness_check};
pub use surveys::{create_survey, delete_survey};
