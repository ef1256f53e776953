use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::Error;

const DEVICE_PATH_PREFIX: &str = "/net/reactivated/Fprint/Device/";
const CONFIRM_FINGER_PREFIX: &str = "delete:";
const CONFIRM_ALL_PREFIX: &str = "delete-all:";
const CONFIRM_MAX_LEN: usize = 128;

/// Finger names understood by fprintd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FingerLabel {
    LeftThumb,
    LeftIndex,
    LeftMiddle,
    LeftRing,
    LeftLittle,
    RightThumb,
    RightIndex,
    RightMiddle,
    RightRing,
    RightLittle,
}

impl FingerLabel {
    pub const ALL: [Self; 10] = [
        Self::LeftThumb,
        Self::LeftIndex,
        Self::LeftMiddle,
        Self::LeftRing,
        Self::LeftLittle,
        Self::RightThumb,
        Self::RightIndex,
        Self::RightMiddle,
        Self::RightRing,
        Self::RightLittle,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeftThumb => "left-thumb",
            Self::LeftIndex => "left-index-finger",
            Self::LeftMiddle => "left-middle-finger",
            Self::LeftRing => "left-ring-finger",
            Self::LeftLittle => "left-little-finger",
            Self::RightThumb => "right-thumb",
            Self::RightIndex => "right-index-finger",
            Self::RightMiddle => "right-middle-finger",
            Self::RightRing => "right-ring-finger",
            Self::RightLittle => "right-little-finger",
        }
    }

    /// "right-index-finger" -> "Right index finger"
    #[must_use]
    pub fn display_name(self) -> String {
        let spaced = self.as_str().replace('-', " ");
        let mut chars = spaced.chars();
        match chars.next() {
            Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
            None => spaced,
        }
    }
}

impl FromStr for FingerLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();

        Self::ALL
            .into_iter()
            .find(|f| {
                let name = f.as_str();
                name == wanted || name.strip_suffix("-finger") == Some(wanted)
            })
            .ok_or_else(|| Error::UnknownFinger(wanted.to_string()))
    }
}

impl TryFrom<String> for FingerLabel {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FingerLabel> for String {
    fn from(value: FingerLabel) -> Self {
        value.as_str().to_string()
    }
}

impl Display for FingerLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// fprintd device object path. Only `/net/reactivated/Fprint/Device/<n>` is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix(DEVICE_PATH_PREFIX) {
            Some(index) if !index.is_empty() && index.len() <= 8 && index.bytes().all(|b| b.is_ascii_digit()) => {
                Ok(Self(s.to_string()))
            }
            _ => Err(Error::InvalidDeviceId(s.to_string())),
        }
    }
}

impl TryFrom<String> for DeviceId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.0
    }
}

impl Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    Press,
    Swipe,
}

/// Immutable snapshot of a reader, refreshed on every enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub scan_type: ScanType,
    /// accepted scans needed before the daemon verifies the template
    pub enroll_stages: u32,
    /// prints one user may keep on this reader
    pub max_templates: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrolledFinger {
    pub device: DeviceId,
    pub finger: FingerLabel,
    pub index: usize,
}

/// Proof that the user explicitly asked for a deletion. A token names the exact
/// operand it confirms, so a token for one finger can't delete another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConfirmationToken(String);

impl ConfirmationToken {
    #[must_use]
    pub fn for_finger(finger: FingerLabel) -> Self {
        Self(format!("{CONFIRM_FINGER_PREFIX}{finger}"))
    }

    #[must_use]
    pub fn for_all(device: &DeviceId) -> Self {
        Self(format!("{CONFIRM_ALL_PREFIX}{device}"))
    }

    #[must_use]
    pub fn confirms_finger(&self, finger: FingerLabel) -> bool {
        self.0.strip_prefix(CONFIRM_FINGER_PREFIX) == Some(finger.as_str())
    }

    #[must_use]
    pub fn confirms_all(&self, device: &DeviceId) -> bool {
        self.0.strip_prefix(CONFIRM_ALL_PREFIX) == Some(device.as_str())
    }
}

impl TryFrom<String> for ConfirmationToken {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let well_formed = value.len() <= CONFIRM_MAX_LEN
            && value.bytes().all(|b| b.is_ascii_graphic())
            && (value.starts_with(CONFIRM_FINGER_PREFIX) || value.starts_with(CONFIRM_ALL_PREFIX));

        if well_formed {
            Ok(Self(value))
        } else {
            Err(Error::InvalidConfirmation)
        }
    }
}

impl From<ConfirmationToken> for String {
    fn from(value: ConfirmationToken) -> Self {
        value.0
    }
}
