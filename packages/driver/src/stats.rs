/// Driver-global transport and transaction counters. A snapshot of these is
/// exposed to the host; the live copy is only ever written by the driver and
/// serial tasks.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DriverStats {
    /// Number of SOF bytes received
    pub sof_count: u32,
    /// Number of unsolicited frames received while a transaction was pending
    pub ack_waiting: u32,
    /// Number of reads aborted due to timeouts
    pub read_aborts: u32,
    /// Number of frames with a bad checksum
    pub bad_checksum: u32,
    /// Number of frames successfully read
    pub read_count: u32,
    /// Number of frames successfully written
    pub write_count: u32,
    pub can_count: u32,
    pub nak_count: u32,
    pub ack_count: u32,
    /// Number of bytes received out of framing
    pub oof_count: u32,
    /// Number of messages dropped after exhausting their attempts
    pub dropped: u32,
    /// Number of messages retransmitted
    pub retries: u32,
    /// Number of unexpected callbacks and unknown function IDs
    pub callbacks: u32,
    /// Number of sends that failed with a bad route
    pub bad_routes: u32,
    /// Number of sends that were never acknowledged by the target
    pub no_ack: u32,
    /// Number of network-busy replies
    pub net_busy: u32,
    /// Number of messages the controller refused to put on the network
    pub non_delivery: u32,
    /// Number of frames received with a routed-busy status
    pub routed_busy: u32,
    pub broadcast_read_count: u32,
    pub broadcast_write_count: u32,
}

/// Per-node traffic counters, kept inside the node table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NodeStats {
    pub sent: u32,
    pub sent_failed: u32,
    pub retries: u32,
    pub received: u32,
    pub received_unsolicited: u32,
}
