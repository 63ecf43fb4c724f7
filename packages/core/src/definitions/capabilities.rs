use derive_try_from_primitive::*;
use std::fmt::Display;

/// Role flags reported by `GetControllerCapabilities`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControllerCaps(u8);

impl ControllerCaps {
    pub const SECONDARY: u8 = 0x01;
    pub const ON_OTHER_NETWORK: u8 = 0x02;
    pub const SIS_PRESENT: u8 = 0x04;
    pub const REAL_PRIMARY: u8 = 0x08;
    pub const SUC: u8 = 0x10;

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub fn is_secondary(&self) -> bool {
        self.0 & Self::SECONDARY != 0
    }

    pub fn is_on_other_network(&self) -> bool {
        self.0 & Self::ON_OTHER_NETWORK != 0
    }

    /// Whether a SUC ID Server is available on the network
    pub fn has_sis(&self) -> bool {
        self.0 & Self::SIS_PRESENT != 0
    }

    pub fn was_real_primary(&self) -> bool {
        self.0 & Self::REAL_PRIMARY != 0
    }

    pub fn is_suc(&self) -> bool {
        self.0 & Self::SUC != 0
    }
}

/// Capability flags reported by `SerialApiGetInitData`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InitCaps(u8);

impl InitCaps {
    pub const SLAVE: u8 = 0x01;
    pub const TIMER_SUPPORT: u8 = 0x02;
    pub const SECONDARY: u8 = 0x04;
    pub const SUC: u8 = 0x08;

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub fn is_slave(&self) -> bool {
        self.0 & Self::SLAVE != 0
    }

    pub fn has_timer_support(&self) -> bool {
        self.0 & Self::TIMER_SUPPORT != 0
    }

    pub fn is_primary(&self) -> bool {
        self.0 & Self::SECONDARY == 0
    }

    pub fn is_suc(&self) -> bool {
        self.0 & Self::SUC != 0
    }
}

/// Protocol library variant baked into the controller firmware, reported as
/// the last byte of the `GetVersion` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum LibraryType {
    Unknown = 0,
    StaticController = 1,
    Controller = 2,
    EnhancedSlave = 3,
    Slave = 4,
    Installer = 5,
    RoutingSlave = 6,
    BridgeController = 7,
    DeviceUnderTest = 8,
}

impl LibraryType {
    pub fn is_bridge(&self) -> bool {
        *self == LibraryType::BridgeController
    }
}

impl Display for LibraryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LibraryType::Unknown => "Unknown",
            LibraryType::StaticController => "Static Controller",
            LibraryType::Controller => "Controller",
            LibraryType::EnhancedSlave => "Enhanced Slave",
            LibraryType::Slave => "Slave",
            LibraryType::Installer => "Installer",
            LibraryType::RoutingSlave => "Routing Slave",
            LibraryType::BridgeController => "Bridge Controller",
            LibraryType::DeviceUnderTest => "Device under Test",
        };
        write!(f, "{}", name)
    }
}

/// Bitmap of the 256 possible function IDs a controller can support,
/// reported by `GetSerialApiCapabilities`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApiMask([u8; 32]);

impl ApiMask {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut mask = [0u8; 32];
        let len = bytes.len().min(32);
        mask[..len].copy_from_slice(&bytes[..len]);
        Self(mask)
    }

    pub fn supports(&self, function: u8) -> bool {
        if function == 0 {
            return false;
        }
        let index = (function - 1) as usize;
        self.0[index >> 3] & (1 << (index & 0x07)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_mask() {
        // Function 0x01 is bit 0 of byte 0, function 0x09 is bit 0 of byte 1
        let mask = ApiMask::from_bytes(&[0x01, 0x01]);
        assert!(mask.supports(0x01));
        assert!(mask.supports(0x09));
        assert!(!mask.supports(0x02));
        assert!(!mask.supports(0x00));
    }

    #[test]
    fn test_controller_caps() {
        let caps = ControllerCaps::from_byte(ControllerCaps::SUC | ControllerCaps::SIS_PRESENT);
        assert!(caps.is_suc());
        assert!(caps.has_sis());
        assert!(!caps.is_secondary());
    }
}
