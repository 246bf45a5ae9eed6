// Room inspection and membership HTTP handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use roomcast_sfu::{DirectoryStats, RoomId, RoomSnapshot};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{middleware::AuthUser, AppError, AppResult, AppState};

/// One row of the room listing
#[derive(Debug, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub participants: usize,
    pub tracks: usize,
    pub lobby_connections: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomListResponse {
    pub rooms: Vec<RoomSummary>,
    pub stats: DirectoryStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JoinCheckResponse {
    pub room_id: RoomId,
    pub can_join: bool,
}

/// List live rooms
pub async fn list_rooms(State(state): State<AppState>) -> Json<RoomListResponse> {
    let rooms = state
        .directory
        .snapshots()
        .into_iter()
        .map(|snapshot| RoomSummary {
            room_id: snapshot.room_id,
            participants: snapshot.participants.len(),
            tracks: snapshot.tracks.len(),
            lobby_connections: snapshot.lobby_connections,
        })
        .collect();

    Json(RoomListResponse {
        rooms,
        stats: state.directory.stats(),
    })
}

/// Get one room's participants and tracks
pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> AppResult<Json<RoomSnapshot>> {
    let room_id = RoomId::new(room_id);
    let room = state
        .directory
        .get(&room_id)
        .ok_or_else(|| AppError::not_found(format!("Room {room_id} not found")))?;
    Ok(Json(room.snapshot()))
}

/// Check whether the caller can join without replacing a live session
pub async fn join_check(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    auth: AuthUser,
) -> AppResult<Json<JoinCheckResponse>> {
    let room_id = RoomId::new(room_id);
    if !state.directory.can_join(&room_id, &auth.user_id) {
        return Err(AppError::conflict(format!(
            "{} already has an active session in room {room_id}",
            auth.user_id
        )));
    }
    Ok(Json(JoinCheckResponse {
        room_id,
        can_join: true,
    }))
}

/// Leave a room: the caller's socket gets `close` and its session is torn down
pub async fn leave_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    auth: AuthUser,
) -> AppResult<StatusCode> {
    let room_id = RoomId::new(room_id);
    state.directory.leave(&room_id, &auth.user_id).await?;
    info!(room_id = %room_id, peer_id = %auth.user_id, "Participant left over HTTP");
    Ok(StatusCode::NO_CONTENT)
}
