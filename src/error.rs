use thiserror::Error;

pub type ConsoleResult<T> = Result<T, ConsoleError>;

/// Failure taxonomy shared by every tier and repository.
///
/// `Transport` and `Validation` are the only variants the router treats as
/// recoverable on a non-terminal tier; everything else reaches the caller.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("backend unreachable: {0}")]
    Transport(String),
    #[error("invalid backend configuration: {0}")]
    Validation(String),
    #[error("instance quota exceeded (limit {limit})")]
    QuotaExceeded { limit: u32 },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("pairing aborted: {0}")]
    PairingAborted(String),
    #[error("local store failure: {0}")]
    Store(String),
}

impl ConsoleError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Validation(_))
    }

    /// Stable short code used in HTTP error bodies and log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Validation(_) => "validation",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NotFound(_) => "not_found",
            Self::PairingAborted(_) => "pairing_aborted",
            Self::Store(_) => "store",
        }
    }
}

impl From<reqwest::Error> for ConsoleError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::Validation(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_validation_fall_back() {
        assert!(ConsoleError::transport("down").is_fallback_eligible());
        assert!(ConsoleError::validation("bad url").is_fallback_eligible());
        assert!(!ConsoleError::not_found("inst-1").is_fallback_eligible());
        assert!(!ConsoleError::QuotaExceeded { limit: 3 }.is_fallback_eligible());
        assert!(!ConsoleError::PermissionDenied("x".into()).is_fallback_eligible());
    }

    #[test]
    fn quota_message_carries_limit() {
        let err = ConsoleError::QuotaExceeded { limit: 7 };
        assert!(err.to_string().contains('7'));
        assert_eq!(err.code(), "quota_exceeded");
    }
}
