//! Outbound device commands.

use crate::error::CommandError;
use std::fmt;
use std::str::FromStr;

/// Normalized instruction sent to a device.
///
/// The text is trimmed and internal whitespace runs collapse to one space.
/// Equality and display use the literal normalized text.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceCommand {
    text: String,
}

impl DeviceCommand {
    /// Command from free text
    pub fn raw(text: &str) -> Result<Self, CommandError> {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if normalized.is_empty() {
            return Err(CommandError::Empty);
        }
        Ok(Self { text: normalized })
    }

    /// Drive digital output `index` to `state`
    pub fn set_digital_output(index: u8, state: bool) -> Self {
        Self {
            text: format!("setdigout {} {}", index, u8::from(state)),
        }
    }

    /// Request device information
    pub fn get_info() -> Self {
        Self {
            text: "getinfo".to_string(),
        }
    }

    /// Request device status
    pub fn get_status() -> Self {
        Self {
            text: "getstatus".to_string(),
        }
    }

    /// Reboot the device
    pub fn reset() -> Self {
        Self {
            text: "cpureset".to_string(),
        }
    }

    /// Literal command text
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for DeviceCommand {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::raw(s)
    }
}
