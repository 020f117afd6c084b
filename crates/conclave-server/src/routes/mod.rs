pub mod http;
pub mod ws;

use axum::Router;

use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new().merge(http::router()).merge(ws::router())
}
