//! Status bytes and mode arguments used by the controller-administration
//! functions (inclusion, exclusion, learn mode, failed-node handling).

/// Modes for `AddNodeToNetwork`. OR with [`OPTION_HIGH_POWER`] to include at
/// full RF power.
pub mod add_node {
    pub const ANY: u8 = 0x01;
    pub const CONTROLLER: u8 = 0x02;
    pub const SLAVE: u8 = 0x03;
    pub const EXISTING: u8 = 0x04;
    pub const STOP: u8 = 0x05;
    pub const STOP_FAILED: u8 = 0x06;

    // Status bytes in the callback
    pub const STATUS_LEARN_READY: u8 = 0x01;
    pub const STATUS_NODE_FOUND: u8 = 0x02;
    pub const STATUS_ADDING_SLAVE: u8 = 0x03;
    pub const STATUS_ADDING_CONTROLLER: u8 = 0x04;
    pub const STATUS_PROTOCOL_DONE: u8 = 0x05;
    pub const STATUS_DONE: u8 = 0x06;
    pub const STATUS_FAILED: u8 = 0x07;
}

/// Modes and callback status bytes for `RemoveNodeFromNetwork`.
pub mod remove_node {
    pub const ANY: u8 = 0x01;
    pub const CONTROLLER: u8 = 0x02;
    pub const SLAVE: u8 = 0x03;
    pub const STOP: u8 = 0x05;

    pub const STATUS_LEARN_READY: u8 = 0x01;
    pub const STATUS_NODE_FOUND: u8 = 0x02;
    pub const STATUS_REMOVING_SLAVE: u8 = 0x03;
    pub const STATUS_REMOVING_CONTROLLER: u8 = 0x04;
    pub const STATUS_DONE: u8 = 0x06;
    pub const STATUS_FAILED: u8 = 0x07;
}

/// Start/stop arguments shared by `CreateNewPrimary` and `ControllerChange`.
pub mod new_controller {
    pub const START: u8 = 0x02;
    pub const STOP: u8 = 0x05;
    pub const STOP_FAILED: u8 = 0x06;

    pub const STATUS_LEARN_READY: u8 = 0x01;
    pub const STATUS_NODE_FOUND: u8 = 0x02;
    pub const STATUS_IN_PROGRESS: u8 = 0x03;
    pub const STATUS_DONE: u8 = 0x06;
    pub const STATUS_FAILED: u8 = 0x07;
}

/// Arguments and callback status bytes for `SetLearnMode`.
pub mod learn_mode {
    pub const ENABLE: u8 = 0x01;
    pub const DISABLE: u8 = 0x00;

    pub const STATUS_STARTED: u8 = 0x01;
    pub const STATUS_DONE: u8 = 0x06;
    pub const STATUS_FAILED: u8 = 0x07;
}

/// Return codes of the failed-node functions.
pub mod failed_node {
    // RemoveFailedNodeId response
    pub const REMOVE_STARTED: u8 = 0x00;
    pub const NOT_PRIMARY: u8 = 0x02;
    pub const NO_CALLBACK: u8 = 0x04;
    pub const NOT_FOUND: u8 = 0x08;
    pub const REMOVE_BUSY: u8 = 0x10;
    pub const REMOVE_FAIL: u8 = 0x20;

    // RemoveFailedNodeId callback
    pub const NODE_OK: u8 = 0x00;
    pub const NODE_REMOVED: u8 = 0x01;
    pub const NODE_NOT_REMOVED: u8 = 0x02;

    // ReplaceFailedNode callback
    pub const REPLACE_WAITING: u8 = 0x03;
    pub const REPLACE_DONE: u8 = 0x04;
    pub const REPLACE_FAILED: u8 = 0x05;
}

/// `ApplicationUpdate` status bytes.
pub mod app_update {
    pub const NODE_INFO_RECEIVED: u8 = 0x84;
    pub const NODE_INFO_REQ_DONE: u8 = 0x82;
    pub const NODE_INFO_REQ_FAILED: u8 = 0x81;
    pub const ROUTING_PENDING: u8 = 0x80;
    pub const NEW_ID_ASSIGNED: u8 = 0x40;
    pub const DELETE_DONE: u8 = 0x20;
    pub const SUC_ID: u8 = 0x10;
}

/// `RequestNodeNeighborUpdate` callback status bytes.
pub mod neighbor_update {
    pub const STARTED: u8 = 0x21;
    pub const DONE: u8 = 0x22;
    pub const FAILED: u8 = 0x23;
}

/// Include at normal power (default) or full power.
pub const OPTION_HIGH_POWER: u8 = 0x80;
/// Ask the protocol to use network-wide inclusion.
pub const OPTION_NETWORK_WIDE: u8 = 0x40;
