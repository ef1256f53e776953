use std::fmt::Display;

use serde::{Deserialize, Serialize};
use ufprint::{
    device::{ConfirmationToken, DeviceId, FingerLabel},
    error::{DeleteError, Error, PolicyError, ProtocolError},
    policy::{PolicyTarget, TargetStatus},
};

use crate::authority::Action;

pub const PROTOCOL_VERSION: u32 = 1;

/// Correlation id of responses to requests that could not be decoded.
pub const UNCORRELATED_ID: u64 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum HelperOp {
    EnableTarget(PolicyTarget),
    DisableTarget(PolicyTarget),
    QueryTargetStatus(PolicyTarget),
    AdminDeleteFinger {
        device: DeviceId,
        finger: FingerLabel,
        confirmation: ConfirmationToken,
    },
    AdminDeleteAllFingers {
        device: DeviceId,
        confirmation: ConfirmationToken,
    },
}

impl HelperOp {
    #[must_use]
    pub fn action(&self) -> Action {
        match self {
            Self::EnableTarget(_) | Self::DisableTarget(_) => Action::PolicyModify,
            Self::QueryTargetStatus(_) => Action::PolicyQuery,
            Self::AdminDeleteFinger { .. } | Self::AdminDeleteAllFingers { .. } => Action::FingersDelete,
        }
    }

    fn validate(&self) -> Result<(), ErrorKind> {
        match self {
            Self::AdminDeleteFinger {
                finger, confirmation, ..
            } if !confirmation.confirms_finger(*finger) => Err(ErrorKind::ConfirmationRequired),
            Self::AdminDeleteAllFingers { device, confirmation } if !confirmation.confirms_all(device) => {
                Err(ErrorKind::ConfirmationRequired)
            }
            _ => Ok(()),
        }
    }

    /// What a `Denied` answer means for this operation.
    #[must_use]
    pub fn denied_error(&self) -> Error {
        match self {
            Self::EnableTarget(_) | Self::DisableTarget(_) => PolicyError::Denied.into(),
            Self::QueryTargetStatus(_) => ProtocolError::Unauthorized.into(),
            Self::AdminDeleteFinger { .. } | Self::AdminDeleteAllFingers { .. } => DeleteError::Denied.into(),
        }
    }
}

impl Display for HelperOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EnableTarget(t) => write!(f, "EnableTarget({t})"),
            Self::DisableTarget(t) => write!(f, "DisableTarget({t})"),
            Self::QueryTargetStatus(t) => write!(f, "QueryTargetStatus({t})"),
            Self::AdminDeleteFinger { device, finger, .. } => write!(f, "AdminDeleteFinger({device}, {finger})"),
            Self::AdminDeleteAllFingers { device, .. } => write!(f, "AdminDeleteAllFingers({device})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelperRequest {
    pub version: u32,
    pub id: u64,
    pub op: HelperOp,
}

impl HelperRequest {
    #[must_use]
    pub fn new(id: u64, op: HelperOp) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            op,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorKind> {
        if self.version != PROTOCOL_VERSION {
            return Err(ErrorKind::VersionMismatch);
        }

        if self.id == UNCORRELATED_ID {
            return Err(ErrorKind::SchemaInvalid);
        }

        self.op.validate()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    Done,
    Status(TargetStatus),
}

/// Failure kinds that may cross the boundary. No free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    // fingers
    NotFound,
    DeviceBusy,
    ConfirmationRequired,
    BiometricUnavailable,
    // policy
    PolicyCorrupted,
    IoFailure,
    AtomicReplaceFailed,
    VerificationFailed,
    // protocol
    SchemaInvalid,
    VersionMismatch,
    Unavailable,
}

impl From<PolicyError> for ErrorKind {
    fn from(value: PolicyError) -> Self {
        match value {
            PolicyError::PolicyCorrupted => Self::PolicyCorrupted,
            PolicyError::IoFailure | PolicyError::Denied => Self::IoFailure,
            PolicyError::AtomicReplaceFailed => Self::AtomicReplaceFailed,
            PolicyError::VerificationFailed => Self::VerificationFailed,
        }
    }
}

impl From<DeleteError> for ErrorKind {
    fn from(value: DeleteError) -> Self {
        match value {
            DeleteError::NotFound => Self::NotFound,
            DeleteError::DeviceBusy | DeleteError::Denied => Self::DeviceBusy,
            DeleteError::ConfirmationRequired => Self::ConfirmationRequired,
            DeleteError::Unavailable => Self::BiometricUnavailable,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(value: ErrorKind) -> Self {
        match value {
            ErrorKind::NotFound => DeleteError::NotFound.into(),
            ErrorKind::DeviceBusy => DeleteError::DeviceBusy.into(),
            ErrorKind::ConfirmationRequired => DeleteError::ConfirmationRequired.into(),
            ErrorKind::BiometricUnavailable => DeleteError::Unavailable.into(),
            ErrorKind::PolicyCorrupted => PolicyError::PolicyCorrupted.into(),
            ErrorKind::IoFailure => PolicyError::IoFailure.into(),
            ErrorKind::AtomicReplaceFailed => PolicyError::AtomicReplaceFailed.into(),
            ErrorKind::VerificationFailed => PolicyError::VerificationFailed.into(),
            ErrorKind::SchemaInvalid => ProtocolError::SchemaInvalid.into(),
            ErrorKind::VersionMismatch => ProtocolError::VersionMismatch.into(),
            ErrorKind::Unavailable => ProtocolError::Unavailable.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelperResult {
    Success(Payload),
    Denied,
    Failed(ErrorKind),
}

impl Display for HelperResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success(p) => write!(f, "Success({p:?})"),
            Self::Denied => write!(f, "Denied"),
            Self::Failed(k) => write!(f, "Failed({k:?})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelperResponse {
    pub id: u64,
    pub result: HelperResult,
}

impl HelperResponse {
    #[must_use]
    pub fn new(id: u64, result: HelperResult) -> Self {
        Self { id, result }
    }

    /// Answer to a frame that never decoded into a request.
    #[must_use]
    pub fn undecodable() -> Self {
        Self::new(UNCORRELATED_ID, HelperResult::Failed(ErrorKind::SchemaInvalid))
    }
}
