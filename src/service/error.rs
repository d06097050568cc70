use thiserror::Error;

use crate::object_store::key::KeyError;
use crate::object_store::{ObjectRef, ObjectStoreError};
use crate::policy::PolicyViolation;
use crate::storage::models::VariantKind;
use crate::storage::ConnectorError;
use crate::variants::PipelineError;

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Authorization,
    Conflict,
    Unsupported,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error("Invalid storage location: {0}")]
    InvalidLocation(#[from] KeyError),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("File '{0}' not found")]
    FileNotFound(String),
    #[error("Variant '{kind}' of file '{file_uid}' not found")]
    VariantNotFound { file_uid: String, kind: VariantKind },
    #[error("Object '{0}' does not exist in storage")]
    ObjectMissing(ObjectRef),
    #[error("Not permitted to access file '{0}'")]
    Forbidden(String),
    #[error("Upload was issued for '{expected}' but finalize named '{actual}'")]
    LocationConflict { expected: ObjectRef, actual: ObjectRef },
    #[error("{0}")]
    InvalidState(String),
    #[error("Storage backend does not support {0}")]
    CapabilityMissing(&'static str),
    #[error("Storage error: {0}")]
    Storage(ObjectStoreError),
    #[error(transparent)]
    Persistence(#[from] ConnectorError),
    #[error("Image processing failed: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("Storage operation '{0}' timed out")]
    Timeout(&'static str),
    #[error("Request was cancelled")]
    Cancelled,
}

impl From<ObjectStoreError> for ServiceError {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::Unsupported(op) => ServiceError::CapabilityMissing(op),
            other => ServiceError::Storage(other),
        }
    }
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Policy(_)
            | ServiceError::InvalidLocation(_)
            | ServiceError::InvalidRequest(_) => ErrorKind::Validation,
            ServiceError::Pipeline(PipelineError::Decode(_)) => ErrorKind::Validation,
            ServiceError::FileNotFound(_)
            | ServiceError::VariantNotFound { .. }
            | ServiceError::ObjectMissing(_) => ErrorKind::NotFound,
            ServiceError::Forbidden(_) => ErrorKind::Authorization,
            ServiceError::LocationConflict { .. } | ServiceError::InvalidState(_) => {
                ErrorKind::Conflict
            }
            ServiceError::CapabilityMissing(_) => ErrorKind::Unsupported,
            ServiceError::Storage(_)
            | ServiceError::Persistence(_)
            | ServiceError::Pipeline(_)
            | ServiceError::Timeout(_)
            | ServiceError::Cancelled => ErrorKind::Infrastructure,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Policy(violation) => match violation {
                PolicyViolation::UnknownPurpose(_) | PolicyViolation::NoPolicy(_) => {
                    "invalid_purpose"
                }
                PolicyViolation::MimeNotAllowed { .. } => "mime_not_allowed",
                PolicyViolation::TooLarge { .. } => "file_too_large",
                PolicyViolation::Empty => "empty_file",
            },
            ServiceError::InvalidLocation(_) => "invalid_location",
            ServiceError::InvalidRequest(_) => "invalid_request",
            ServiceError::FileNotFound(_) => "file_not_found",
            ServiceError::VariantNotFound { .. } => "variant_not_found",
            ServiceError::ObjectMissing(_) => "object_missing",
            ServiceError::Forbidden(_) => "forbidden",
            ServiceError::LocationConflict { .. } => "location_conflict",
            ServiceError::InvalidState(_) => "invalid_state",
            ServiceError::CapabilityMissing(_) => "capability_missing",
            ServiceError::Storage(_) => "storage_error",
            ServiceError::Persistence(_) => "persistence_error",
            ServiceError::Pipeline(PipelineError::Decode(_)) => "invalid_image",
            ServiceError::Pipeline(_) => "pipeline_error",
            ServiceError::Timeout(_) => "timeout",
            ServiceError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Purpose;

    #[test]
    fn test_client_errors_have_distinct_codes() {
        let errors = [
            ServiceError::from(PolicyViolation::UnknownPurpose("x".into())),
            ServiceError::from(PolicyViolation::MimeNotAllowed {
                purpose: Purpose::Avatar,
                mime_type: "text/html".into(),
            }),
            ServiceError::from(PolicyViolation::TooLarge {
                purpose: Purpose::Avatar,
                size: 10,
                max: 5,
            }),
            ServiceError::FileNotFound("f".into()),
            ServiceError::VariantNotFound {
                file_uid: "f".into(),
                kind: VariantKind::Web,
            },
            ServiceError::ObjectMissing(ObjectRef::new("files", "f")),
            ServiceError::Forbidden("f".into()),
        ];
        let mut codes: Vec<&str> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            ServiceError::from(PolicyViolation::Empty).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ServiceError::ObjectMissing(ObjectRef::new("files", "f")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(ServiceError::Forbidden("f".into()).kind(), ErrorKind::Authorization);
        assert_eq!(
            ServiceError::from(ObjectStoreError::Backend("boom".into())).kind(),
            ErrorKind::Infrastructure
        );
    }

    #[test]
    fn test_unsupported_storage_maps_to_capability_missing() {
        let err = ServiceError::from(ObjectStoreError::Unsupported("copy"));
        assert!(matches!(err, ServiceError::CapabilityMissing("copy")));
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}
