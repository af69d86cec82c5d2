use thiserror::Error;

use wormhole_proto::ClientError;
use wormhole_store::StoreError;

/// Everything a per-message handler can fail with.
///
/// Only the [`RelayError::Client`] arm is allowed to reach the wire with its
/// own text; the rest is logged and masked to `internal` (spec-level split
/// between protocol errors and server faults).
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("malformed client frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("no available nameplate ids")]
    NoAvailableNameplates,
}

impl RelayError {
    pub fn is_client(&self) -> bool {
        matches!(self, RelayError::Client(_))
    }

    /// The text sent in an `error` frame for this failure.
    pub fn wire_text(&self) -> String {
        match self {
            RelayError::Client(e) => e.to_string(),
            _ => "internal".to_string(),
        }
    }
}
