//! Configuration status codes shared by every config status message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status code carried in the first byte of a config status message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigStatus {
    /// 0x00
    Success,
    /// 0x01
    InvalidAddress,
    /// 0x02
    InvalidModel,
    /// 0x03
    InvalidAppKeyIndex,
    /// 0x04
    InvalidNetKeyIndex,
    /// 0x05
    InsufficientResources,
    /// 0x06
    KeyIndexAlreadyStored,
    /// 0x07
    InvalidPublishParameters,
    /// 0x08
    NotASubscribeModel,
    /// 0x09
    StorageFailure,
    /// 0x0A
    FeatureNotSupported,
    /// 0x0B
    CannotUpdate,
    /// 0x0C
    CannotRemove,
    /// 0x0D
    CannotBind,
    /// 0x0E
    TemporarilyUnableToChangeState,
    /// 0x0F
    CannotSet,
    /// 0x10
    UnspecifiedError,
    /// 0x11
    InvalidBinding,
    /// Reserved for future use, kept verbatim
    Rfu(u8),
}

impl ConfigStatus {
    /// Wire value
    pub fn code(self) -> u8 {
        match self {
            ConfigStatus::Success => 0x00,
            ConfigStatus::InvalidAddress => 0x01,
            ConfigStatus::InvalidModel => 0x02,
            ConfigStatus::InvalidAppKeyIndex => 0x03,
            ConfigStatus::InvalidNetKeyIndex => 0x04,
            ConfigStatus::InsufficientResources => 0x05,
            ConfigStatus::KeyIndexAlreadyStored => 0x06,
            ConfigStatus::InvalidPublishParameters => 0x07,
            ConfigStatus::NotASubscribeModel => 0x08,
            ConfigStatus::StorageFailure => 0x09,
            ConfigStatus::FeatureNotSupported => 0x0A,
            ConfigStatus::CannotUpdate => 0x0B,
            ConfigStatus::CannotRemove => 0x0C,
            ConfigStatus::CannotBind => 0x0D,
            ConfigStatus::TemporarilyUnableToChangeState => 0x0E,
            ConfigStatus::CannotSet => 0x0F,
            ConfigStatus::UnspecifiedError => 0x10,
            ConfigStatus::InvalidBinding => 0x11,
            ConfigStatus::Rfu(code) => code,
        }
    }
}

impl From<u8> for ConfigStatus {
    fn from(code: u8) -> Self {
        match code {
            0x00 => ConfigStatus::Success,
            0x01 => ConfigStatus::InvalidAddress,
            0x02 => ConfigStatus::InvalidModel,
            0x03 => ConfigStatus::InvalidAppKeyIndex,
            0x04 => ConfigStatus::InvalidNetKeyIndex,
            0x05 => ConfigStatus::InsufficientResources,
            0x06 => ConfigStatus::KeyIndexAlreadyStored,
            0x07 => ConfigStatus::InvalidPublishParameters,
            0x08 => ConfigStatus::NotASubscribeModel,
            0x09 => ConfigStatus::StorageFailure,
            0x0A => ConfigStatus::FeatureNotSupported,
            0x0B => ConfigStatus::CannotUpdate,
            0x0C => ConfigStatus::CannotRemove,
            0x0D => ConfigStatus::CannotBind,
            0x0E => ConfigStatus::TemporarilyUnableToChangeState,
            0x0F => ConfigStatus::CannotSet,
            0x10 => ConfigStatus::UnspecifiedError,
            0x11 => ConfigStatus::InvalidBinding,
            other => ConfigStatus::Rfu(other),
        }
    }
}

impl fmt::Display for ConfigStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigStatus::Success => "success",
            ConfigStatus::InvalidAddress => "invalid address",
            ConfigStatus::InvalidModel => "invalid model",
            ConfigStatus::InvalidAppKeyIndex => "invalid app key index",
            ConfigStatus::InvalidNetKeyIndex => "invalid net key index",
            ConfigStatus::InsufficientResources => "insufficient resources",
            ConfigStatus::KeyIndexAlreadyStored => "key index already stored",
            ConfigStatus::InvalidPublishParameters => "invalid publish parameters",
            ConfigStatus::NotASubscribeModel => "not a subscribe model",
            ConfigStatus::StorageFailure => "storage failure",
            ConfigStatus::FeatureNotSupported => "feature not supported",
            ConfigStatus::CannotUpdate => "cannot update",
            ConfigStatus::CannotRemove => "cannot remove",
            ConfigStatus::CannotBind => "cannot bind",
            ConfigStatus::TemporarilyUnableToChangeState => "temporarily unable to change state",
            ConfigStatus::CannotSet => "cannot set",
            ConfigStatus::UnspecifiedError => "unspecified error",
            ConfigStatus::InvalidBinding => "invalid binding",
            ConfigStatus::Rfu(code) => return write!(f, "rfu ({:#04x})", code),
        };
        f.write_str(name)
    }
}

/// Leading status byte embedded by each config status message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusEnvelope {
    /// Decoded status code
    pub code: ConfigStatus,
}

impl StatusEnvelope {
    /// Wrap a status code
    pub fn new(code: ConfigStatus) -> Self {
        Self { code }
    }

    /// A successful status
    pub fn success() -> Self {
        Self::new(ConfigStatus::Success)
    }
}

impl From<u8> for StatusEnvelope {
    fn from(code: u8) -> Self {
        Self::new(ConfigStatus::from(code))
    }
}

/// Shared accessor over every config status message
pub trait StatusMessage {
    /// The embedded envelope
    fn envelope(&self) -> &StatusEnvelope;

    /// Status code
    fn status(&self) -> ConfigStatus {
        self.envelope().code
    }

    /// Whether the node reported success
    fn is_successful(&self) -> bool {
        self.status() == ConfigStatus::Success
    }
}
