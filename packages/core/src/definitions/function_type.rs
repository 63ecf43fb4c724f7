use derive_try_from_primitive::*;

/// The function IDs of the Z-Wave Serial API that this driver knows how to
/// issue or handle. The framing layer carries the raw byte; this enumeration
/// exists for dispatch and for constructing outbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum FunctionType {
    SerialApiGetInitData = 0x02,

    /// The controller relays a wireless application frame from a node
    ApplicationCommandHandler = 0x04,

    GetControllerCapabilities = 0x05,
    GetSerialApiCapabilities = 0x07,

    SerialApiSoftReset = 0x08,

    SendData = 0x13,
    GetVersion = 0x15,
    SendDataAbort = 0x16,

    /// Get Home ID and the controller's own node ID
    MemoryGetId = 0x20,

    GetNodeProtocolInfo = 0x41,
    /// Reset the controller to factory defaults
    SetDefault = 0x42,

    ReplicationCommandComplete = 0x44,
    ReplicationSendData = 0x45,
    AssignReturnRoute = 0x46,
    DeleteReturnRoute = 0x47,
    RequestNodeNeighborUpdate = 0x48,
    /// Node information frame received, or node awake/alive state changed
    ApplicationUpdate = 0x49,

    AddNodeToNetwork = 0x4a,
    RemoveNodeFromNetwork = 0x4b,
    CreateNewPrimary = 0x4c,
    ControllerChange = 0x4d,

    SetLearnMode = 0x50,
    AssignSucReturnRoute = 0x51,
    EnableSuc = 0x52,
    RequestNetworkUpdate = 0x53,
    SetSucNodeId = 0x54,
    DeleteSucReturnRoute = 0x55,
    GetSucNodeId = 0x56,

    RequestNodeInfo = 0x60,
    RemoveFailedNodeId = 0x61,
    IsFailedNodeId = 0x62,
    ReplaceFailedNode = 0x63,

    /// Read a node's neighbor bitmap from the controller
    GetRoutingInfo = 0x80,
}

impl FunctionType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::try_from(byte).ok()
    }
}

#[test]
fn test_from_byte() {
    assert_eq!(FunctionType::from_byte(0x13), Some(FunctionType::SendData));
    assert_eq!(FunctionType::from_byte(0x15), Some(FunctionType::GetVersion));
    // Unknown IDs are carried as raw bytes by the codec, never decoded here
    assert_eq!(FunctionType::from_byte(0xee), None);
}
