//! Error kinds surfaced by the hub core.
//!
//! Each kind has a stable problem-details title so it survives a trip through a
//! `ResponseMessage.error` or an RFC7807 body and comes back as the same variant.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// Missing or invalid token, or the client lacks permission.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown group, connection, agent or affordance.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid role for the subject, malformed envelope, unknown operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An RPC exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Socket read/write failure or lost connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Converter could not map, handler panicked, persistence failed.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type HubResult<T> = std::result::Result<T, HubError>;

impl HubError {
    /// Problem-details title for this kind.
    pub fn title(&self) -> &'static str {
        match self {
            HubError::Unauthorized(_) => "Unauthorized",
            HubError::NotFound(_) => "NotFound",
            HubError::InvalidArgument(_) => "InvalidArgument",
            HubError::Timeout(_) => "Timeout",
            HubError::Transport(_) => "TransportError",
            HubError::Internal(_) => "Internal",
        }
    }

    /// The message without the kind prefix.
    pub fn detail(&self) -> &str {
        match self {
            HubError::Unauthorized(s)
            | HubError::NotFound(s)
            | HubError::InvalidArgument(s)
            | HubError::Timeout(s)
            | HubError::Transport(s)
            | HubError::Internal(s) => s,
        }
    }

    /// HTTP status used when this error is written as a problem-details reply.
    pub fn status_code(&self) -> u16 {
        match self {
            HubError::Unauthorized(_) => 401,
            HubError::NotFound(_) => 404,
            HubError::InvalidArgument(_) => 400,
            HubError::Timeout(_) => 504,
            HubError::Transport(_) => 502,
            HubError::Internal(_) => 500,
        }
    }

    /// Rebuild an error from a problem title and detail. Unknown titles become `Internal`.
    pub fn from_title(title: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match title {
            "Unauthorized" => HubError::Unauthorized(detail),
            "NotFound" => HubError::NotFound(detail),
            "InvalidArgument" => HubError::InvalidArgument(detail),
            "Timeout" => HubError::Timeout(detail),
            "TransportError" => HubError::Transport(detail),
            "Internal" => HubError::Internal(detail),
            other if detail.is_empty() => HubError::Internal(other.to_string()),
            other => HubError::Internal(format!("{}: {}", other, detail)),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, HubError::Unauthorized(_))
    }
}

impl From<std::io::Error> for HubError {
    fn from(e: std::io::Error) -> Self {
        HubError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::InvalidArgument(e.to_string())
    }
}

impl From<serde_yaml::Error> for HubError {
    fn from(e: serde_yaml::Error) -> Self {
        HubError::Internal(e.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(e: reqwest::Error) -> Self {
        if e.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            HubError::Unauthorized(e.to_string())
        } else {
            HubError::Transport(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match &e {
            WsError::Http(resp) if resp.status().as_u16() == 401 => {
                HubError::Unauthorized(e.to_string())
            }
            _ => HubError::Transport(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_round_trips_every_kind() {
        let all = [
            HubError::Unauthorized("a".into()),
            HubError::NotFound("b".into()),
            HubError::InvalidArgument("c".into()),
            HubError::Timeout("d".into()),
            HubError::Transport("e".into()),
            HubError::Internal("f".into()),
        ];
        for e in all {
            assert_eq!(HubError::from_title(e.title(), e.detail()), e);
        }
    }

    #[test]
    fn unknown_title_is_internal() {
        let e = HubError::from_title("Teapot", "short and stout");
        assert_eq!(e, HubError::Internal("Teapot: short and stout".into()));
    }

    #[test]
    fn status_codes() {
        assert_eq!(HubError::Unauthorized(String::new()).status_code(), 401);
        assert_eq!(HubError::InvalidArgument(String::new()).status_code(), 400);
        assert_eq!(HubError::Internal(String::new()).status_code(), 500);
    }
}
