use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("invalid session description JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected an offer, got {0}")]
    NotAnOffer(String),

    #[error("session description has no SDP")]
    EmptySdp,
}
