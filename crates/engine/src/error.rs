//! Error kinds visible to the engine and the retry policy built on them.

use thiserror::Error;

/// Classification of a download/scan error, per spec §7.
///
/// `Cancelled` is deliberately not constructed from a failed call — it's the
/// normal outcome of pause/cancel/skip and is represented separately from
/// `EngineError` at the call sites that care (see `worker_pool`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectionLost,
    FileReferenceExpired,
    PeerInvalid,
    FloodWait(u32),
    IntegrityError,
    DiskError,
    Stuck,
    Unknown,
}

impl ErrorKind {
    /// Retryable set per spec §4.2: `{ConnectionLost, FileReferenceExpired, FloodWait, Unknown}`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionLost
                | ErrorKind::FileReferenceExpired
                | ErrorKind::FloodWait(_)
                | ErrorKind::Unknown
        )
    }

    pub fn is_flood_wait(&self) -> bool {
        matches!(self, ErrorKind::FloodWait(_))
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ConnectionLost => write!(f, "connection lost"),
            ErrorKind::FileReferenceExpired => write!(f, "file reference expired"),
            ErrorKind::PeerInvalid => write!(f, "peer invalid"),
            ErrorKind::FloodWait(n) => write!(f, "flood wait ({n}s)"),
            ErrorKind::IntegrityError => write!(f, "integrity error"),
            ErrorKind::DiskError => write!(f, "disk error"),
            ErrorKind::Stuck => write!(f, "stuck download"),
            ErrorKind::Unknown => write!(f, "unknown error"),
        }
    }
}

/// Top-level error type threaded through download call sites.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind}: {message}")]
    Classified { kind: ErrorKind, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("item not found: {0}")]
    ItemNotFound(String),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn classified(kind: ErrorKind, message: impl Into<String>) -> Self {
        EngineError::Classified {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> Option<&ErrorKind> {
        match self {
            EngineError::Classified { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

/// Classifies a raw error message into an [`ErrorKind`], mirroring the
/// original's `classify_error` (keyword matching over the stringified
/// exception, since the MTProto client contract only gives us `Display`).
pub fn classify(message: &str, flood_wait_seconds: Option<u32>) -> ErrorKind {
    if let Some(n) = flood_wait_seconds {
        return ErrorKind::FloodWait(n);
    }
    let lower = message.to_lowercase();
    if lower.contains("file reference") {
        return ErrorKind::FileReferenceExpired;
    }
    if lower.contains("peer_id_invalid") || lower.contains("peer invalid") || lower.contains("channel_invalid") || lower.contains("channel_private") {
        return ErrorKind::PeerInvalid;
    }
    if lower.contains("flood") {
        return ErrorKind::FloodWait(30);
    }
    const CONNECTION_KEYWORDS: &[&str] = &[
        "connection",
        "disconnect",
        "timeout",
        "reset",
        "network",
        "eof",
        "broken pipe",
        "connection lost",
    ];
    if CONNECTION_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return ErrorKind::ConnectionLost;
    }
    ErrorKind::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_flood_wait() {
        assert_eq!(classify("flood wait of 30 seconds", None), ErrorKind::FloodWait(30));
        assert_eq!(classify("anything", Some(12)), ErrorKind::FloodWait(12));
    }

    #[test]
    fn classifies_file_reference_expired() {
        assert_eq!(
            classify("FILE_REFERENCE_EXPIRED", None),
            ErrorKind::FileReferenceExpired
        );
    }

    #[test]
    fn classifies_peer_invalid() {
        assert_eq!(classify("PEER_ID_INVALID", None), ErrorKind::PeerInvalid);
    }

    #[test]
    fn classifies_connection_lost() {
        assert_eq!(classify("Connection reset by peer", None), ErrorKind::ConnectionLost);
    }

    #[test]
    fn classifies_unknown() {
        assert_eq!(classify("something weird happened", None), ErrorKind::Unknown);
    }

    #[test]
    fn retryable_set_matches_spec() {
        assert!(ErrorKind::ConnectionLost.is_retryable());
        assert!(ErrorKind::FileReferenceExpired.is_retryable());
        assert!(ErrorKind::FloodWait(5).is_retryable());
        assert!(ErrorKind::Unknown.is_retryable());
        assert!(!ErrorKind::PeerInvalid.is_retryable());
        assert!(!ErrorKind::IntegrityError.is_retryable());
    }
}
