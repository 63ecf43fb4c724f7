use derive_try_from_primitive::*;
use std::fmt::{self, Display};

/// Status byte reported by the controller in a `SendData` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum TransmitStatus {
    Ok = 0x00,
    NoAck = 0x01,
    Fail = 0x02,
    NotIdle = 0x03,
    NoRoute = 0x04,
}

impl TransmitStatus {
    /// `Fail` and `NotIdle` both mean the network layer refused the frame
    pub fn is_network_busy(&self) -> bool {
        matches!(self, TransmitStatus::Fail | TransmitStatus::NotIdle)
    }
}

/// Transmit option bits sent with every `SendData`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TransmitOptions(u8);

impl TransmitOptions {
    pub const ACK: u8 = 0x01;
    pub const LOW_POWER: u8 = 0x02;
    pub const AUTO_ROUTE: u8 = 0x04;
    pub const NO_ROUTE: u8 = 0x10;
    pub const EXPLORE: u8 = 0x20;

    pub fn none() -> Self {
        Self(0)
    }

    pub fn with_explore(self) -> Self {
        Self(self.0 | Self::EXPLORE)
    }

    pub fn with_low_power(self) -> Self {
        Self(self.0 | Self::LOW_POWER)
    }

    pub fn as_byte(&self) -> u8 {
        self.0
    }
}

impl Default for TransmitOptions {
    /// Every frame requests an ACK and automatic routing
    fn default() -> Self {
        Self(Self::ACK | Self::AUTO_ROUTE)
    }
}

impl fmt::Debug for TransmitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransmitOptions({:#04x})", self.0)
    }
}

impl Display for TransmitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.0 & Self::ACK != 0 {
            names.push("ACK");
        }
        if self.0 & Self::LOW_POWER != 0 {
            names.push("LowPower");
        }
        if self.0 & Self::AUTO_ROUTE != 0 {
            names.push("AutoRoute");
        }
        if self.0 & Self::NO_ROUTE != 0 {
            names.push("NoRoute");
        }
        if self.0 & Self::EXPLORE != 0 {
            names.push("Explore");
        }
        write!(f, "{}", names.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = TransmitOptions::default();
        assert_eq!(opts.as_byte(), 0x05);
        assert_eq!(opts.with_explore().as_byte(), 0x25);
    }

    #[test]
    fn test_status_classification() {
        assert!(TransmitStatus::Fail.is_network_busy());
        assert!(TransmitStatus::NotIdle.is_network_busy());
        assert!(!TransmitStatus::NoAck.is_network_busy());
        assert_eq!(TransmitStatus::try_from(0x04), Ok(TransmitStatus::NoRoute));
    }
}
