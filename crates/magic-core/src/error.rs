//! Typed registry and dispatch errors, with their mappings onto the two
//! wire vocabularies.

use thiserror::Error;

use magic_mih::Status;
use magic_proto::{MagicStatus, ResultCode};

/// A failed registry operation. Every failure leaves registry state
/// exactly as it was before the call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("link {0} is not in the configured datalink catalog")]
    NotInCatalog(String),
    #[error("link {0} is already registered")]
    AlreadyRegistered(String),
    #[error("link {0} is not registered")]
    LinkNotFound(String),
    #[error("registry full")]
    CapacityExceeded,
    #[error("invalid capabilities: {0}")]
    InvalidCapabilities(&'static str),
    #[error("qos not supported: {0}")]
    QosNotSupported(&'static str),
    #[error("no free bearer slot")]
    NoFreeBearer,
    #[error("invalid bearer id {0}")]
    InvalidBearer(u8),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("invalid session state transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

impl RegistryError {
    /// South-bound status for a confirm primitive.
    pub fn to_mih_status(&self) -> Status {
        match self {
            RegistryError::NotInCatalog(_) | RegistryError::LinkNotFound(_) => {
                Status::LinkNotAvailable
            }
            RegistryError::AlreadyRegistered(_) => Status::Failure,
            RegistryError::CapacityExceeded | RegistryError::NoFreeBearer => {
                Status::InsufficientResources
            }
            RegistryError::InvalidCapabilities(_) => Status::Failure,
            RegistryError::QosNotSupported(_) => Status::QosNotSupported,
            RegistryError::InvalidBearer(_) => Status::InvalidBearer,
            RegistryError::SessionNotFound(_) | RegistryError::InvalidTransition { .. } => {
                Status::Failure
            }
        }
    }

    /// North-bound result/status pair for an answer.
    pub fn to_north_codes(&self) -> (ResultCode, MagicStatus) {
        match self {
            RegistryError::NotInCatalog(_) | RegistryError::LinkNotFound(_) => {
                (ResultCode::ServiceUnavailable, MagicStatus::LinkNotAvailable)
            }
            RegistryError::CapacityExceeded | RegistryError::NoFreeBearer => (
                ResultCode::InsufficientResources,
                MagicStatus::InsufficientResources,
            ),
            RegistryError::QosNotSupported(_) => {
                (ResultCode::InvalidRequest, MagicStatus::QosNotSupported)
            }
            RegistryError::InvalidBearer(_) => {
                (ResultCode::InvalidRequest, MagicStatus::InvalidBearer)
            }
            _ => (ResultCode::InvalidRequest, MagicStatus::Failure),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mih_status_mapping() {
        assert_eq!(
            RegistryError::NoFreeBearer.to_mih_status(),
            Status::InsufficientResources
        );
        assert_eq!(
            RegistryError::InvalidBearer(9).to_mih_status(),
            Status::InvalidBearer
        );
        assert_eq!(
            RegistryError::QosNotSupported("zero rates").to_mih_status(),
            Status::QosNotSupported
        );
    }

    #[test]
    fn north_mapping() {
        let (rc, ms) = RegistryError::CapacityExceeded.to_north_codes();
        assert_eq!(rc, ResultCode::InsufficientResources);
        assert_eq!(ms, MagicStatus::InsufficientResources);
    }
}
