use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::time::Duration;
use tapedeck_media::MediaError;
use tapedeck_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Malformed offer: {0}")]
    MalformedOffer(String),

    #[error("Remote description rejected: {0}")]
    RemoteDescriptionRejected(String),

    #[error("Unable to handle codec {0}")]
    UnsupportedCodec(String),

    #[error("Could not find a video or audio recording in {0}")]
    NoMediaAvailable(String),

    #[error("Negotiation timed out waiting for {0}")]
    NegotiationTimeout(&'static str),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Container error: {0}")]
    Media(#[from] MediaError),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl From<ProtocolError> for AppError {
    fn from(err: ProtocolError) -> Self {
        AppError::MalformedOffer(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::BadRequest(_)
            | AppError::MalformedOffer(_)
            | AppError::RemoteDescriptionRejected(_)
            | AppError::UnsupportedCodec(_) => StatusCode::BAD_REQUEST,
            AppError::NoMediaAvailable(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::NegotiationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Media(_) | AppError::WebRtc(_) | AppError::Io(_) => {
                tracing::error!("Request failed: {}", self);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Plain text body, no envelope
        (status, self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Failure of a background pipeline. Logged against its session, never
/// returned to an HTTP caller.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("container error: {0}")]
    Media(#[from] MediaError),

    #[error("transport error: {0}")]
    Transport(#[from] webrtc::Error),

    #[error("peer did not connect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("session closed before media could flow")]
    SessionClosed,
}
