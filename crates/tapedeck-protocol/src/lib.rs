//! Tapedeck Protocol
//!
//! Payloads exchanged with browsers: session descriptions in their
//! base64(JSON) envelope and the bodies of the HTTP endpoints.

pub mod error;
pub mod messages;
pub mod types;

pub use error::ProtocolError;
pub use messages::*;
pub use types::*;
