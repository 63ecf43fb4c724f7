use bytes::{BufMut, Bytes, BytesMut};
use typed_builder::TypedBuilder;
use zwire_core::prelude::*;
use zwire_serial::frame::DataFrame;

/// How often a message is written to the port before it is given up on.
pub const MAX_SEND_ATTEMPTS: u8 = 3;

/// A self-describing outbound frame: the wire bytes plus everything the
/// transaction machine needs to recognize the exchange's completion.
#[derive(Debug, Clone, TypedBuilder)]
pub struct Message {
    frame: DataFrame,
    /// The node this frame is ultimately addressed to; unspecified for
    /// frames that only concern the controller itself
    #[builder(default, setter(into))]
    target_node: NodeId,
    /// Function ID of the response that completes this exchange; 0 means no
    /// reply beyond the ACK
    #[builder(default = 0)]
    expected_reply: u8,
    /// When the expected reply is an application command, the command class
    /// it must carry
    #[builder(default = 0)]
    expected_command_class: u8,
    /// Whether the last payload byte is a callback-id slot, filled in at
    /// send time
    #[builder(default = false)]
    needs_callback_id: bool,
    #[builder(default = 0, setter(skip))]
    callback_id: u8,
    #[builder(default = 0, setter(skip))]
    send_attempts: u8,
    #[builder(default = MAX_SEND_ATTEMPTS)]
    max_attempts: u8,
}

/// Queue dedup treats two messages with byte-equal frames as the same,
/// regardless of callback ids (those are assigned at send time).
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.frame == other.frame
    }
}

impl Eq for Message {}

impl Message {
    /// A request without payload, e.g. one of the init handshake frames
    pub fn request(function: FunctionType) -> Self {
        Self::builder()
            .frame(DataFrame::request(function, Bytes::new()))
            .build()
    }

    /// A request whose reply is the response frame of the same function
    pub fn request_expecting_response(function: FunctionType, payload: impl Into<Bytes>) -> Self {
        Self::builder()
            .frame(DataFrame::request(function, payload))
            .expected_reply(function as u8)
            .build()
    }

    /// A `SendData` command carrying an opaque command-class payload.
    /// Completes with the controller's `SendData` response and callback.
    pub fn send_data(node: NodeId, cc_payload: &[u8], options: TransmitOptions) -> Self {
        Self::builder()
            .frame(DataFrame::request(
                FunctionType::SendData,
                send_data_payload(node, cc_payload, options),
            ))
            .target_node(node)
            .expected_reply(FunctionType::SendData as u8)
            .needs_callback_id(true)
            .build()
    }

    /// A `SendData` query that is only complete once the addressed node has
    /// answered with a report of the same command class.
    pub fn send_data_expecting_report(
        node: NodeId,
        cc_payload: &[u8],
        options: TransmitOptions,
    ) -> Self {
        Self::builder()
            .frame(DataFrame::request(
                FunctionType::SendData,
                send_data_payload(node, cc_payload, options),
            ))
            .target_node(node)
            .expected_reply(FunctionType::ApplicationCommandHandler as u8)
            .expected_command_class(cc_payload.first().copied().unwrap_or(0))
            .needs_callback_id(true)
            .build()
    }

    /// The NoOperation probe used by `test_network` and failed-node checks
    pub fn no_op(node: NodeId) -> Self {
        Self::send_data(node, &[0x00], TransmitOptions::default())
    }

    pub fn frame(&self) -> &DataFrame {
        &self.frame
    }

    pub fn function(&self) -> u8 {
        self.frame.function
    }

    pub fn target_node(&self) -> NodeId {
        self.target_node
    }

    pub fn expected_reply(&self) -> u8 {
        self.expected_reply
    }

    pub fn expected_command_class(&self) -> u8 {
        self.expected_command_class
    }

    pub fn expects_reply(&self) -> bool {
        self.expected_reply != 0
    }

    pub fn expects_callback(&self) -> bool {
        self.needs_callback_id
    }

    pub fn callback_id(&self) -> u8 {
        self.callback_id
    }

    /// Fill the callback-id slot (the last payload byte) with the given id
    pub fn set_callback_id(&mut self, id: u8) {
        debug_assert!(self.needs_callback_id);
        self.callback_id = id;
        if self.frame.payload.is_empty() {
            return;
        }
        let mut payload = BytesMut::from(&self.frame.payload[..]);
        let last = payload.len() - 1;
        payload[last] = id;
        self.frame.payload = payload.freeze();
    }

    pub fn send_attempts(&self) -> u8 {
        self.send_attempts
    }

    pub fn record_attempt(&mut self) {
        self.send_attempts = self.send_attempts.saturating_add(1);
    }

    /// Undo the attempt accounting for a NAK/CAN, which does not count
    pub fn forget_attempt(&mut self) {
        self.send_attempts = self.send_attempts.saturating_sub(1);
    }

    pub fn attempts_left(&self) -> bool {
        self.send_attempts < self.max_attempts
    }

    pub fn to_bytes(&self) -> Bytes {
        self.frame.to_bytes()
    }
}

fn send_data_payload(node: NodeId, cc_payload: &[u8], options: TransmitOptions) -> Bytes {
    let mut payload = BytesMut::with_capacity(cc_payload.len() + 4);
    payload.put_u8(node.into());
    payload.put_u8(cc_payload.len() as u8);
    payload.put_slice(cc_payload);
    payload.put_u8(options.as_byte());
    // Callback-id slot, filled right before the frame goes out
    payload.put_u8(0);
    payload.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_data_layout() {
        // SetLevel(99) on the multilevel switch class, node 5
        let msg = Message::send_data(NodeId::new(5), &[0x26, 0x01, 0x63], TransmitOptions::default());
        assert_eq!(msg.function(), 0x13);
        assert_eq!(msg.frame().payload[..], hex::decode("05032601630500").unwrap());
        assert!(msg.expects_callback());
        assert_eq!(msg.expected_reply(), 0x13);
    }

    #[test]
    fn test_callback_id_patch() {
        let mut msg = Message::no_op(NodeId::new(9));
        msg.set_callback_id(0x42);
        assert_eq!(msg.callback_id(), 0x42);
        assert_eq!(*msg.frame().payload.last().unwrap(), 0x42);
    }

    #[test]
    fn test_equality_ignores_metadata() {
        let a = Message::send_data(NodeId::new(2), &[0x25, 0x02], TransmitOptions::default());
        let mut b = Message::send_data(NodeId::new(2), &[0x25, 0x02], TransmitOptions::default());
        assert_eq!(a, b);
        b.record_attempt();
        // Attempt counters are metadata, not identity
        assert_eq!(a, b);
        // A different frame is a different message
        let c = Message::send_data(NodeId::new(3), &[0x25, 0x02], TransmitOptions::default());
        assert_ne!(a, c);
    }

    #[test]
    fn test_attempt_accounting() {
        let mut msg = Message::no_op(NodeId::new(1));
        assert!(msg.attempts_left());
        msg.record_attempt();
        msg.record_attempt();
        msg.record_attempt();
        assert!(!msg.attempts_left());
        msg.forget_attempt();
        assert!(msg.attempts_left());
    }
}
