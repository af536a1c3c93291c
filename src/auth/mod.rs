use crate::state::AppState;
use axum::Router;

pub mod cookies;
pub mod csrf;
mod dto;
pub mod extractors;
pub mod handlers;
pub mod linker;
pub mod password;
pub mod services;
pub mod session;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(handlers::auth_routes())
        .merge(handlers::me_routes())
}
