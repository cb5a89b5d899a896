//! Error types for the fan controller

use crate::hardware::PinId;
use thiserror::Error;

/// Result type alias for the fan controller
pub type Result<T> = std::result::Result<T, FanError>;

/// Main error type for the fan controller
#[derive(Error, Debug)]
pub enum FanError {
    #[error("Fan {id} does not exist (bank has {fan_count} fans)")]
    FanIdOutOfRange { id: usize, fan_count: usize },

    #[error("Duty {percent}% outside allowed range {min}-{max}%")]
    DutyOutOfRange { percent: u8, min: u8, max: u8 },

    #[error("{name} {value} is out of range")]
    ValueOutOfRange { name: &'static str, value: f64 },

    #[error("Fan {id}: measurement window not complete")]
    NotReady { id: usize },

    #[error("RPM undefined for {pulses_per_revolution} pulses per revolution")]
    UndefinedConversion { pulses_per_revolution: u32 },

    #[error("Fan {id}: feedback input unavailable")]
    FeedbackUnavailable { id: usize },

    #[error("Driver error on {pin}: {message}")]
    Driver { pin: PinId, message: String },

    #[error("Expected {expected} speeds, got {actual}")]
    SpeedListLength { expected: usize, actual: usize },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FanError {
    /// Fan id, duty or threshold outside its configured bounds
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            FanError::FanIdOutOfRange { .. }
                | FanError::DutyOutOfRange { .. }
                | FanError::ValueOutOfRange { .. }
        )
    }

    /// Recoverable: the caller may retry once the window closes
    pub fn is_not_ready(&self) -> bool {
        matches!(self, FanError::NotReady { .. })
    }

    pub(crate) fn driver(pin: PinId, message: impl std::fmt::Display) -> Self {
        FanError::Driver {
            pin,
            message: message.to_string(),
        }
    }
}
