mod api;

pub use api::{
    ApiResponse, CircuitStats, CreateSurveyRequest, CsrfTokenResponse, HealthResponse,
    LoginResponse, MeResponse, RateLimitView, SignupResponse, StatsResponse, SuggestionRequest,
    SuggestionResponse, SurveyResponse, UserView,
};
