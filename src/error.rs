use thiserror::Error;
use tonic::{Code, Status};

pub type DriverResult<T> = Result<T, DriverError>;

/// Failures surfaced by the driver core.
///
/// Every variant maps onto exactly one gRPC status code; the message always
/// names the operation and the resource involved.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name} already exists: {reason}")]
    AlreadyExists { kind: &'static str, name: String, reason: String },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    #[error("kubernetes api error while trying to {op}: {source}")]
    Kube {
        op: String,
        #[source]
        source: kube::Error,
    },

    #[error("command {command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("i/o error while trying to {op}: {source}")]
    Io {
        op: String,
        #[source]
        source: std::io::Error,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl DriverError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound { kind, name: name.into() }
    }

    pub fn already_exists(
        kind: &'static str,
        name: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::AlreadyExists { kind, name: name.into(), reason: reason.into() }
    }

    pub fn kube(op: impl Into<String>, source: kube::Error) -> Self {
        Self::Kube { op: op.into(), source }
    }

    pub fn io(op: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { op: op.into(), source }
    }

    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::NotFound { .. } => Code::NotFound,
            Self::AlreadyExists { .. } => Code::AlreadyExists,
            Self::PermissionDenied(_) => Code::PermissionDenied,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::Kube { .. } | Self::Command { .. } | Self::Io { .. } | Self::Internal(_) => {
                Code::Internal
            }
        }
    }
}

impl From<DriverError> for Status {
    fn from(err: DriverError) -> Self {
        let code = err.code();
        match code {
            Code::Internal => tracing::error!(error = %err, "request failed"),
            _ => tracing::debug!(error = %err, ?code, "request rejected"),
        }
        Status::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = DriverError::not_found("StorageClass", "fast");
        assert_eq!(err.to_string(), "StorageClass fast not found");
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_already_exists_message() {
        let err = DriverError::already_exists("DataVolume", "pvc-1", "size differs");
        assert_eq!(err.to_string(), "DataVolume pvc-1 already exists: size differs");
    }

    #[test]
    fn test_status_codes() {
        let cases = vec![
            (DriverError::InvalidArgument("x".into()), Code::InvalidArgument),
            (DriverError::PermissionDenied("x".into()), Code::PermissionDenied),
            (DriverError::FailedPrecondition("x".into()), Code::FailedPrecondition),
            (DriverError::Unimplemented("ListVolumes"), Code::Unimplemented),
            (DriverError::Internal("x".into()), Code::Internal),
            (
                DriverError::Command { command: "mkfs.ext4".into(), stderr: "boom".into() },
                Code::Internal,
            ),
        ];

        for (err, code) in cases {
            let status: Status = err.into();
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn test_status_keeps_message() {
        let status: Status = DriverError::Unimplemented("GetCapacity").into();
        assert_eq!(status.message(), "GetCapacity is not implemented");
    }
}
