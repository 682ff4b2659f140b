use crate::error::Result;
use crate::state::AppState;
use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};
use tapedeck_protocol::RecordingList;

pub async fn list_recordings(State(state): State<AppState>) -> Result<Response> {
    let uuids = state.store.list_recordings().await?;

    if uuids.is_empty() {
        return Ok("No UUID folders found.".into_response());
    }

    Ok(Json(RecordingList { uuids }).into_response())
}
