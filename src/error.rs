use tonic::{Code, Status};

/// Errors that abort an upload attempt.
///
/// None of them is retried here; the caller decides whether to start a fresh
/// attempt.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The declared or accumulated size passed the hard limit.
    #[error("file is too large: {0}")]
    SizeLimitExceeded(String),

    /// Missing or malformed metadata, or a message out of order.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("request is canceled")]
    Cancelled,

    #[error("deadline is exceeded")]
    DeadlineExceeded,

    /// Opening, creating, reading or writing a local file failed.
    #[error("{context}: {source}")]
    LocalIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Sending or receiving on the wire failed.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl RpcError {
    pub fn size_limit(size: u64, limit: u64) -> Self {
        Self::SizeLimitExceeded(format!("{} > {}", size, limit))
    }

    pub fn local_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::LocalIo {
            context: context.into(),
            source,
        }
    }

    /// Whether a fresh attempt could reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::DeadlineExceeded | Self::Transport(_)
        )
    }
}

impl RpcError {
    /// The status a receiver answers with when this error ends the stream.
    pub fn to_status(&self) -> Status {
        match self {
            Self::SizeLimitExceeded(msg) => Status::invalid_argument(msg.as_str()),
            Self::ProtocolViolation(msg) => Status::failed_precondition(msg.as_str()),
            Self::Cancelled => Status::cancelled("Request is canceled."),
            Self::DeadlineExceeded => Status::deadline_exceeded("Deadline is exceeded."),
            Self::LocalIo { .. } => Status::internal(self.to_string()),
            Self::Transport(msg) => Status::unavailable(msg.as_str()),
        }
    }
}

impl From<RpcError> for Status {
    fn from(err: RpcError) -> Self {
        err.to_status()
    }
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        match status.code() {
            Code::InvalidArgument => Self::SizeLimitExceeded(status.message().to_string()),
            Code::FailedPrecondition => Self::ProtocolViolation(status.message().to_string()),
            Code::Cancelled => Self::Cancelled,
            Code::DeadlineExceeded => Self::DeadlineExceeded,
            code => Self::Transport(format!("{:?}: {}", code, status.message())),
        }
    }
}

impl From<tonic::transport::Error> for RpcError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_keeps_kind() {
        let status: Status = RpcError::size_limit(11, 10).into();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(matches!(
            RpcError::from(status),
            RpcError::SizeLimitExceeded(msg) if msg == "11 > 10"
        ));

        let status: Status = RpcError::ProtocolViolation("no metadata".into()).into();
        assert!(matches!(
            RpcError::from(status),
            RpcError::ProtocolViolation(_)
        ));

        let status: Status = RpcError::DeadlineExceeded.into();
        assert!(matches!(RpcError::from(status), RpcError::DeadlineExceeded));

        let status: Status = RpcError::Cancelled.into();
        assert!(matches!(RpcError::from(status), RpcError::Cancelled));
    }

    #[test]
    fn test_local_io_is_internal_on_the_wire() {
        let err = RpcError::local_io(
            "failed to create file",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_transient());
        let status: Status = err.into();
        assert_eq!(status.code(), Code::Internal);
        assert!(matches!(RpcError::from(status), RpcError::Transport(_)));
    }
}
