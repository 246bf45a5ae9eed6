// Roomcast API Library
//
// HTTP and WebSocket surface of the room coordinator

pub mod http;

pub use http::{create_router, AppState};
