// Route definitions for the lxchecker API

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::{handlers, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/subjects/:subject/assignments", post(handlers::create_assignment))
        .route(
            "/subjects/:subject/assignments/:assignment",
            get(handlers::get_assignment),
        )
        .route(
            "/subjects/:subject/assignments/:assignment/submissions",
            post(handlers::create_submission).get(handlers::list_submissions),
        )
        .route(
            "/subjects/:subject/assignments/:assignment/submissions/:submission",
            get(handlers::get_submission),
        )
        .route(
            "/subjects/:subject/assignments/:assignment/submissions/:submission/upload",
            get(handlers::download_upload),
        )
        .route(
            "/subjects/:subject/assignments/:assignment/submissions/:submission/grade",
            post(handlers::grade_submission),
        )
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
}
