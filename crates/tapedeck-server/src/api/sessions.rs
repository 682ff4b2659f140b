use crate::error::{AppError, Result};
use crate::state::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use tapedeck_protocol::{is_uuid_like, IngestRequest, PlaybackRequest, SessionDescription};
use uuid::Uuid;

/// Response header carrying the id of a new recording
pub const RECORDING_ID_HEADER: &str = "x-recording-id";

/// Accept a publishing peer and record its tracks
pub async fn ingest(
    State(state): State<AppState>,
    Json(input): Json<IngestRequest>,
) -> Result<impl IntoResponse> {
    let encoded = input.offer().ok_or_else(|| {
        AppError::BadRequest("Parameter 'param' not found or not a string".to_string())
    })?;
    let offer = SessionDescription::decode_offer(encoded)?;

    let (id, answer) = state.sessions.start_ingest(&offer).await?;

    Ok(([(RECORDING_ID_HEADER, id.to_string())], answer.encode()?))
}

/// Replay a stored recording to a viewing peer
pub async fn playback(
    State(state): State<AppState>,
    Json(input): Json<PlaybackRequest>,
) -> Result<String> {
    let encoded = input.offer().ok_or_else(|| {
        AppError::BadRequest("Parameter 'base' not found or not a string".to_string())
    })?;
    let relay = input.relay_server().ok_or_else(|| {
        AppError::BadRequest(
            "Parameters 'url', 'username' and 'credential' are required".to_string(),
        )
    })?;
    let recording = input.recording.as_deref().map(parse_recording).transpose()?;
    let offer = SessionDescription::decode_offer(encoded)?;

    let (_, answer) = state
        .sessions
        .start_playback(&offer, &relay, recording)
        .await?;

    Ok(answer.encode()?)
}

fn parse_recording(name: &str) -> Result<Uuid> {
    let invalid = || AppError::BadRequest(format!("Invalid recording id '{}'", name));
    if !is_uuid_like(name) {
        return Err(invalid());
    }
    Uuid::parse_str(name).map_err(|_| invalid())
}
