use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Which peer mutation an engine-rejected IPC blob was attempting, so the
/// control API can report a fixed per-operation message instead of leaking
/// the engine's own parse error to the client.
#[derive(Debug, Clone, Copy)]
pub enum PeerOp {
    Add,
    Remove,
}

impl std::fmt::Display for PeerOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerOp::Add => write!(f, "add"),
            PeerOp::Remove => write!(f, "remove"),
        }
    }
}

/// The hub's top-level error type.
///
/// Each variant maps to exactly one of the error kinds a fatal startup failure,
/// a control-API HTTP response, or a log line can surface, never more than one.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Malformed keys, invalid prefixes, overlaps discovered while assembling config.
    #[error("configuration error: {0}")]
    Config(String),

    /// UDP port unavailable, or an HTTP listener failed to bind.
    #[error("bind error: {0}")]
    Bind(#[source] std::io::Error),

    /// The crypto engine rejected an IPC blob, at startup or for a non-peer
    /// control-API operation (e.g. rendering the redacted config).
    #[error("engine error: {0}")]
    Engine(String),

    /// The engine rejected a `PUT`/`POST`/`DELETE /peers` IPC blob; reported to
    /// the client as `failed to add peer` / `failed to remove peer`, with the
    /// engine's own error going only to the log.
    #[error("failed to {op} peer: {detail}")]
    PeerMutation { op: PeerOp, detail: String },

    /// A control-API precondition failed: bad base64, overlap with an existing peer.
    #[error("{0}")]
    Validation(String),

    /// Missing/invalid bearer token, or a wrong admin password.
    #[error("unauthorized")]
    Auth,

    /// Peer UDP I/O failure. Never surfaced to a client; only ever logged.
    #[error("transient I/O error: {0}")]
    TransientIo(#[source] std::io::Error),
}

impl HubError {
    fn status(&self) -> StatusCode {
        match self {
            HubError::Config(_) | HubError::Bind(_) | HubError::TransientIo(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            HubError::Engine(_) | HubError::PeerMutation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            HubError::Validation(_) => StatusCode::BAD_REQUEST,
            HubError::Auth => StatusCode::UNAUTHORIZED,
        }
    }

    /// The message a client actually sees. Never the engine's own detail for
    /// `Engine`/`PeerMutation` — that goes to the log only.
    fn client_message(&self) -> String {
        match self {
            HubError::Auth => "invalid credentials".to_string(),
            HubError::Engine(_) => "engine operation failed".to_string(),
            HubError::PeerMutation { op, .. } => format!("failed to {op} peer"),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        if matches!(self, HubError::TransientIo(_)) {
            tracing::debug!(error = %self, "transient I/O error");
        } else {
            tracing::warn!(error = %self, "request failed");
        }

        let message = self.client_message();
        (self.status(), Json(ErrorBody { error: message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_mutation_message_hides_the_engine_detail() {
        let add = HubError::PeerMutation { op: PeerOp::Add, detail: "invalid public_key: oops".to_string() };
        assert_eq!(add.client_message(), "failed to add peer");

        let remove = HubError::PeerMutation { op: PeerOp::Remove, detail: "malformed IPC line".to_string() };
        assert_eq!(remove.client_message(), "failed to remove peer");
    }

    #[test]
    fn peer_mutation_is_a_server_error() {
        let err = HubError::PeerMutation { op: PeerOp::Add, detail: String::new() };
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
