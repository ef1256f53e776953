use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("An enrollment is already in progress")]
    AlreadyEnrolling,
    #[error("No active enrollment session")]
    NoActiveSession,
    #[error("Finger is already enrolled on this device")]
    InvalidFinger,
    #[error("Device holds no more fingerprints for this user")]
    DeviceFull,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteError {
    #[error("Fingerprint not found")]
    NotFound,
    #[error("Device is busy")]
    DeviceBusy,
    #[error("Deletion denied")]
    Denied,
    #[error("Deletion requires an explicit confirmation")]
    ConfirmationRequired,
    #[error("Biometric service unavailable")]
    Unavailable,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyError {
    #[error("Policy file is corrupted, please review it manually")]
    PolicyCorrupted,
    #[error("Policy file I/O failure")]
    IoFailure,
    #[error("Atomic replace of the policy file failed")]
    AtomicReplaceFailed,
    #[error("Policy file did not verify after commit")]
    VerificationFailed,
    #[error("Policy change denied")]
    Denied,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("Request does not match the helper schema")]
    SchemaInvalid,
    #[error("Caller is not authorized")]
    Unauthorized,
    #[error("Helper did not answer in time")]
    Timeout,
    #[error("Helper protocol version mismatch")]
    VersionMismatch,
    #[error("Helper unavailable")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum Error {
    //
    // 1st party
    //
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Delete(#[from] DeleteError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Unknown finger: {0}")]
    UnknownFinger(String),
    #[error("Unknown policy target: {0}")]
    UnknownTarget(String),
    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid confirmation token")]
    InvalidConfirmation,
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    #[error("No fingerprint device available")]
    NoDevice,
    #[error("Unable to read peer credentials")]
    ClientPidNotFound,
    #[error("Unable to read start time of process {0}")]
    ProcessStartTime(u32),
    #[error("No user with uid {0}")]
    UnknownUser(u32),

    //
    // 2d party
    //
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Casting(#[from] std::num::TryFromIntError),

    //
    // 3rd party
    //
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Bus(#[from] zbus::Error),
    #[error(transparent)]
    JoinFailure(#[from] tokio::task::JoinError),
}
