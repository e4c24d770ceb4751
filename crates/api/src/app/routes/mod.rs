use axum::{
    routing::{get, post},
    Router,
};

pub mod auth;
pub mod jobs;
pub mod parser;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/admin/jobs/stats", get(jobs::stats))
        .route("/admin/jobs/:key", get(jobs::status))
        .route("/admin/parser/autoupdate", get(parser::state))
        .route("/admin/parser/autoupdate/run", post(parser::run_once))
        .route(
            "/admin/parser/settings",
            get(parser::settings).post(parser::update_settings),
        )
        .route("/auth/rate-limit/login", get(auth::login_status))
}
