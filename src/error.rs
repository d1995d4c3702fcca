use thiserror::Error;

/// Crate-wide error type.
///
/// Errors are categorized by failure kind, not by the module that produced
/// them. Remote failures carry the rendered remote cause chain as a string so
/// callers can inspect the cause without the remote types being available.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("join rejected by {rejected_by}: {reason}")]
    JoinRejected { reason: String, rejected_by: String },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("remote failure: {0}")]
    Remote(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("coordination error: {0}")]
    Coordination(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ClusterError {
    /// True for failures that a failover policy may reasonably retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClusterError::Io(_)
                | ClusterError::Network(_)
                | ClusterError::Timeout(_)
                | ClusterError::ChannelClosed(_)
        )
    }

    /// True when the error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClusterError::Timeout(_))
    }
}

// `std::io::Error` is not clonable; the clone degrades it to a Network error
// carrying the rendered message.
impl Clone for ClusterError {
    fn clone(&self) -> Self {
        match self {
            ClusterError::Configuration(s) => ClusterError::Configuration(s.clone()),
            ClusterError::Io(e) => ClusterError::Network(e.to_string()),
            ClusterError::Codec(s) => ClusterError::Codec(s.clone()),
            ClusterError::Network(s) => ClusterError::Network(s.clone()),
            ClusterError::Timeout(s) => ClusterError::Timeout(s.clone()),
            ClusterError::ChannelClosed(s) => ClusterError::ChannelClosed(s.clone()),
            ClusterError::JoinRejected {
                reason,
                rejected_by,
            } => ClusterError::JoinRejected {
                reason: reason.clone(),
                rejected_by: rejected_by.clone(),
            },
            ClusterError::IllegalState(s) => ClusterError::IllegalState(s.clone()),
            ClusterError::Messaging(s) => ClusterError::Messaging(s.clone()),
            ClusterError::Remote(s) => ClusterError::Remote(s.clone()),
            ClusterError::Lock(s) => ClusterError::Lock(s.clone()),
            ClusterError::Coordination(s) => ClusterError::Coordination(s.clone()),
            ClusterError::Internal(s) => ClusterError::Internal(s.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClusterError::Timeout("t".into()).is_transient());
        assert!(ClusterError::Network("n".into()).is_transient());
        assert!(ClusterError::ChannelClosed("c".into()).is_transient());
        assert!(!ClusterError::Configuration("c".into()).is_transient());
        assert!(!ClusterError::IllegalState("s".into()).is_transient());
    }

    #[test]
    fn test_clone_degrades_io() {
        let err = ClusterError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        match err.clone() {
            ClusterError::Network(msg) => assert!(msg.contains("reset")),
            other => panic!("unexpected clone: {:?}", other),
        }
    }

    #[test]
    fn test_join_rejected_display() {
        let err = ClusterError::JoinRejected {
            reason: "cluster name mismatch".into(),
            rejected_by: "node-a".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("node-a"));
        assert!(rendered.contains("cluster name mismatch"));
    }
}
