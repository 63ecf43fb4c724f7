/// Frequent-listening ("FLiRS") wakeup cadence of an otherwise sleeping node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequentListening {
    Every250ms,
    Every1000ms,
}

/// Protocol-level facts about a node, reported by `GetNodeProtocolInfo`.
/// These are known to the controller without talking to the node itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeProtocolInfo {
    pub listening: bool,
    pub routing: bool,
    pub max_baud_rate: u32,
    pub version: u8,
    pub frequent_listening: Option<FrequentListening>,
    pub beaming: bool,
    pub security: bool,
    pub basic_class: u8,
    pub generic_class: u8,
    pub specific_class: u8,
}

// Capability byte
const CAP_LISTENING: u8 = 0x80;
const CAP_ROUTING: u8 = 0x40;
const CAP_BAUD_MASK: u8 = 0x38;
const CAP_BAUD_40K: u8 = 0x10;
const CAP_VERSION_MASK: u8 = 0x07;

// Security byte
const SEC_SECURITY: u8 = 0x01;
const SEC_BEAM_CAPABILITY: u8 = 0x10;
const SEC_SENSOR_250MS: u8 = 0x20;
const SEC_SENSOR_1000MS: u8 = 0x40;

impl NodeProtocolInfo {
    /// Parse the 6-byte payload of a `GetNodeProtocolInfo` response:
    /// capability, security, reserved, basic, generic, specific.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 6 {
            return None;
        }
        let capability = payload[0];
        let security = payload[1];

        let frequent_listening = if security & SEC_SENSOR_250MS != 0 {
            Some(FrequentListening::Every250ms)
        } else if security & SEC_SENSOR_1000MS != 0 {
            Some(FrequentListening::Every1000ms)
        } else {
            None
        };

        Some(Self {
            listening: capability & CAP_LISTENING != 0,
            routing: capability & CAP_ROUTING != 0,
            max_baud_rate: if capability & CAP_BAUD_MASK == CAP_BAUD_40K {
                40_000
            } else {
                9_600
            },
            version: (capability & CAP_VERSION_MASK) + 1,
            frequent_listening,
            beaming: security & SEC_BEAM_CAPABILITY != 0,
            security: security & SEC_SECURITY != 0,
            basic_class: payload[3],
            generic_class: payload[4],
            specific_class: payload[5],
        })
    }

    /// A node that neither listens permanently nor wakes on beams must be
    /// addressed through its wakeup window.
    pub fn can_sleep(&self) -> bool {
        !self.listening && self.frequent_listening.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listening_node() {
        // Listening, routing, 40k, version 3; no security flags
        let payload = hex::decode("d2000004100100").unwrap();
        let info = NodeProtocolInfo::parse(&payload).unwrap();
        assert!(info.listening);
        assert!(info.routing);
        assert_eq!(info.max_baud_rate, 40_000);
        assert_eq!(info.version, 3);
        assert!(!info.can_sleep());
        assert_eq!(info.basic_class, 0x04);
        assert_eq!(info.generic_class, 0x10);
    }

    #[test]
    fn test_parse_sleeping_sensor() {
        // Not listening, no frequent listening: the node can sleep
        let payload = hex::decode("530000042001").unwrap();
        let info = NodeProtocolInfo::parse(&payload).unwrap();
        assert!(!info.listening);
        assert!(info.can_sleep());

        // A 250ms FLiRS sensor does not count as sleeping
        let payload = hex::decode("532000042001").unwrap();
        let info = NodeProtocolInfo::parse(&payload).unwrap();
        assert_eq!(info.frequent_listening, Some(FrequentListening::Every250ms));
        assert!(!info.can_sleep());
    }

    #[test]
    fn test_parse_short_payload() {
        assert_eq!(NodeProtocolInfo::parse(&[0x00, 0x00]), None);
    }
}
