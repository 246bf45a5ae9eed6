pub mod error;
pub mod health;
pub mod middleware;
pub mod rooms;
pub mod websocket;

use axum::{
    routing::{delete, get},
    Router,
};
use roomcast_sfu::{PeerFactory, RoomDirectory};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<RoomDirectory>,
    pub peer_factory: Arc<dyn PeerFactory>,
    /// WebSocket frame cap, in bytes
    pub max_message_size: usize,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::create_health_router())
        .route("/api/rooms", get(rooms::list_rooms))
        .route("/api/rooms/{room_id}", get(rooms::get_room))
        .route("/api/rooms/{room_id}/join-check", get(rooms::join_check))
        .route(
            "/api/rooms/{room_id}/participants/me",
            delete(rooms::leave_room),
        )
        .route("/ws/live/{room_id}", get(websocket::live_handler))
        .route("/ws/live/{room_id}/viewer", get(websocket::viewer_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
