use base64::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ProtocolError;

/// Kind of a session description
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SdpType::Offer => "offer",
            SdpType::Pranswer => "pranswer",
            SdpType::Answer => "answer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(name)
    }
}

/// Session description in the shape browsers serialize it: `{type, sdp}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// JSON-serialize, then base64 (standard alphabet) encode
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let json = serde_json::to_vec(self)?;
        Ok(BASE64_STANDARD.encode(json))
    }

    pub fn decode(encoded: &str) -> Result<Self, ProtocolError> {
        let json = BASE64_STANDARD.decode(encoded.trim())?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Decode and check that the payload is a non-empty offer
    pub fn decode_offer(encoded: &str) -> Result<Self, ProtocolError> {
        let description = Self::decode(encoded)?;
        if description.sdp_type != SdpType::Offer {
            return Err(ProtocolError::NotAnOffer(description.sdp_type.to_string()));
        }
        if description.sdp.trim().is_empty() {
            return Err(ProtocolError::EmptySdp);
        }
        Ok(description)
    }
}

/// Syntactic UUID check: 36 characters with exactly four hyphens
pub fn is_uuid_like(name: &str) -> bool {
    name.len() == 36 && name.matches('-').count() == 4
}
