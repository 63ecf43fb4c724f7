use crate::message::Message;
use std::time::Duration;
use tokio::time::Instant;
use zwire_core::definitions::{FrameType, FunctionType, NodeId};
use zwire_serial::frame::DataFrame;

/// How long the controller gets to ACK a written frame.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(1);
/// How long a whole exchange may stay pending before the retry/drop arm runs.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    AwaitingAck,
    AwaitingReply,
    AwaitingCallback,
}

/// What an ACK did to the pending transaction.
#[derive(Debug, PartialEq)]
pub enum AckOutcome {
    /// No frame was waiting for an ACK
    NotWaiting,
    /// The exchange continues with a reply and/or callback
    Advanced,
    /// The exchange is complete
    Done(Message),
}

/// What an inbound data frame meant to the pending transaction.
#[derive(Debug, PartialEq)]
pub enum FrameOutcome {
    /// Not related to the pending exchange (or nothing pending)
    Unrelated,
    /// The expected reply arrived; a callback is still outstanding
    ReplyMatched,
    /// The exchange is complete
    Done(Message),
    /// A callback echoing a foreign id
    StrayCallback,
}

/// What the timeout arm decided.
#[derive(Debug, PartialEq)]
pub enum TimeoutOutcome {
    None,
    /// Write the frame again
    Resend(Message),
    /// Attempts exhausted
    Drop(Message),
}

/// Tracks the single in-flight exchange. All expected-reply bookkeeping lives
/// in one place so that "idle" is unambiguous: `current` is `Some` exactly
/// while a frame is in flight.
pub struct Transaction {
    state: TransactionState,
    current: Option<Message>,
    ack_deadline: Option<Instant>,
    overall_deadline: Option<Instant>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            state: TransactionState::Idle,
            current: None,
            ack_deadline: None,
            overall_deadline: None,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == TransactionState::Idle
    }

    pub fn current_node(&self) -> Option<NodeId> {
        self.current
            .as_ref()
            .map(|msg| msg.target_node())
            .filter(|id| id.is_valid())
    }

    /// The message was just written to the port; start waiting for its ACK
    pub fn on_send(&mut self, mut msg: Message, now: Instant) {
        debug_assert!(self.is_idle(), "only one message may be in flight");
        msg.record_attempt();
        self.current = Some(msg);
        self.state = TransactionState::AwaitingAck;
        self.ack_deadline = Some(now + ACK_TIMEOUT);
        self.overall_deadline = Some(now + TRANSACTION_TIMEOUT);
    }

    pub fn on_ack(&mut self) -> AckOutcome {
        if self.state != TransactionState::AwaitingAck {
            return AckOutcome::NotWaiting;
        }
        self.ack_deadline = None;
        let msg = self.current.as_ref().expect("non-idle without message");
        if msg.expects_reply() {
            self.state = TransactionState::AwaitingReply;
            AckOutcome::Advanced
        } else if msg.expects_callback() {
            self.state = TransactionState::AwaitingCallback;
            AckOutcome::Advanced
        } else {
            AckOutcome::Done(self.finish())
        }
    }

    /// NAK and CAN both mean "write it again"; neither counts as an attempt
    pub fn on_nak_or_can(&mut self) -> Option<Message> {
        if self.state != TransactionState::AwaitingAck {
            return None;
        }
        let mut msg = self.finish();
        msg.forget_attempt();
        Some(msg)
    }

    pub fn on_frame(&mut self, frame: &DataFrame) -> FrameOutcome {
        match self.state {
            TransactionState::AwaitingReply => {
                let msg = self.current.as_ref().expect("non-idle without message");
                if !reply_matches(msg, frame) {
                    return FrameOutcome::Unrelated;
                }
                if msg.expects_callback() {
                    self.state = TransactionState::AwaitingCallback;
                    FrameOutcome::ReplyMatched
                } else {
                    FrameOutcome::Done(self.finish())
                }
            }
            TransactionState::AwaitingCallback => {
                let msg = self.current.as_ref().expect("non-idle without message");
                if !looks_like_callback(msg, frame) {
                    return FrameOutcome::Unrelated;
                }
                if frame.payload.first() == Some(&msg.callback_id()) {
                    FrameOutcome::Done(self.finish())
                } else {
                    FrameOutcome::StrayCallback
                }
            }
            _ => FrameOutcome::Unrelated,
        }
    }

    /// Run the retry/drop arm. `now` is compared against the 1 s ACK deadline
    /// and the 5 s overall deadline.
    pub fn on_timeout(&mut self, now: Instant) -> TimeoutOutcome {
        if self.is_idle() {
            return TimeoutOutcome::None;
        }
        let ack_elapsed = self
            .ack_deadline
            .map(|deadline| now >= deadline)
            .unwrap_or(false);
        let overall_elapsed = self
            .overall_deadline
            .map(|deadline| now >= deadline)
            .unwrap_or(false);
        if !ack_elapsed && !overall_elapsed {
            return TimeoutOutcome::None;
        }

        let msg = self.finish();
        if msg.attempts_left() {
            TimeoutOutcome::Resend(msg)
        } else {
            TimeoutOutcome::Drop(msg)
        }
    }

    /// Abandon the in-flight message, e.g. after the controller refused it
    pub fn abort(&mut self) -> Option<Message> {
        if self.is_idle() {
            return None;
        }
        Some(self.finish())
    }

    /// The next instant the driver loop must wake up at for this transaction
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            TransactionState::Idle => None,
            TransactionState::AwaitingAck => match (self.ack_deadline, self.overall_deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            _ => self.overall_deadline,
        }
    }

    fn finish(&mut self) -> Message {
        self.state = TransactionState::Idle;
        self.ack_deadline = None;
        self.overall_deadline = None;
        self.current.take().expect("non-idle without message")
    }
}

fn reply_matches(msg: &Message, frame: &DataFrame) -> bool {
    if frame.function != msg.expected_reply() {
        return false;
    }
    if msg.expected_reply() == FunctionType::ApplicationCommandHandler as u8 {
        // Application commands arrive as requests; they must come from the
        // addressed node and carry the awaited command class.
        // Payload: status, source node, length, class, command...
        frame.frame_type == FrameType::Request
            && frame.payload.len() >= 4
            && NodeId::new(frame.payload[1]) == msg.target_node()
            && frame.payload[3] == msg.expected_command_class()
    } else if msg.expected_reply() == FunctionType::ApplicationUpdate as u8 {
        // Node information also arrives as a request: status, source node, ...
        // A request-failed status carries no node id and still ends the wait.
        frame.frame_type == FrameType::Request
            && (frame.payload.get(1).copied().map(NodeId::new) == Some(msg.target_node())
                || frame.payload.first() == Some(&zwire_core::definitions::app_update::NODE_INFO_REQ_FAILED))
    } else {
        frame.frame_type == FrameType::Response
    }
}

fn looks_like_callback(msg: &Message, frame: &DataFrame) -> bool {
    frame.frame_type == FrameType::Request
        && frame.function == msg.function()
        && !frame.payload.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use zwire_core::definitions::TransmitOptions;

    fn now() -> Instant {
        Instant::now()
    }

    fn send_data_msg() -> Message {
        let mut msg = Message::send_data(
            NodeId::new(5),
            &[0x26, 0x01, 0x63],
            TransmitOptions::default(),
        );
        msg.set_callback_id(0x42);
        msg
    }

    fn send_data_response(ok: bool) -> DataFrame {
        DataFrame::response(FunctionType::SendData, vec![ok as u8])
    }

    fn send_data_callback(id: u8) -> DataFrame {
        DataFrame::request(FunctionType::SendData, vec![id, 0x00, 0x00, 0x02])
    }

    #[test]
    fn test_full_exchange() {
        let mut txn = Transaction::new();
        txn.on_send(send_data_msg(), now());
        assert_eq!(txn.state(), TransactionState::AwaitingAck);

        assert_eq!(txn.on_ack(), AckOutcome::Advanced);
        assert_eq!(txn.state(), TransactionState::AwaitingReply);

        assert_eq!(txn.on_frame(&send_data_response(true)), FrameOutcome::ReplyMatched);
        assert_eq!(txn.state(), TransactionState::AwaitingCallback);

        // A callback with a foreign id is a stray, the exchange stays pending
        assert_eq!(txn.on_frame(&send_data_callback(0x41)), FrameOutcome::StrayCallback);
        assert_eq!(txn.state(), TransactionState::AwaitingCallback);

        match txn.on_frame(&send_data_callback(0x42)) {
            FrameOutcome::Done(msg) => assert_eq!(msg.callback_id(), 0x42),
            other => panic!("expected Done, got {:?}", other),
        }
        assert!(txn.is_idle());
    }

    #[test]
    fn test_ack_only_exchange() {
        let mut txn = Transaction::new();
        let msg = Message::request(FunctionType::SerialApiSoftReset);
        txn.on_send(msg, now());
        match txn.on_ack() {
            AckOutcome::Done(_) => {}
            other => panic!("expected Done, got {:?}", other),
        }
        assert!(txn.is_idle());
    }

    #[test]
    fn test_nak_does_not_count_as_attempt() {
        let mut txn = Transaction::new();
        txn.on_send(send_data_msg(), now());
        let msg = txn.on_nak_or_can().expect("resend after NAK");
        assert_eq!(msg.send_attempts(), 0);
        assert!(txn.is_idle());

        // Resend goes through the normal send path again
        txn.on_send(msg, now());
        assert_eq!(txn.on_ack(), AckOutcome::Advanced);
    }

    #[test]
    fn test_ack_timeout_resends_until_exhausted() {
        let mut txn = Transaction::new();
        let start = now();
        txn.on_send(send_data_msg(), start);

        // Nothing due before the ACK deadline
        assert_eq!(txn.on_timeout(start), TimeoutOutcome::None);

        let mut resends = 0;
        loop {
            match txn.on_timeout(start + ACK_TIMEOUT) {
                TimeoutOutcome::Resend(msg) => {
                    resends += 1;
                    txn.on_send(msg, start);
                }
                TimeoutOutcome::Drop(msg) => {
                    assert_eq!(msg.send_attempts(), 3);
                    break;
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(resends, 2);
        assert!(txn.is_idle());
    }

    #[test]
    fn test_overall_timeout_while_awaiting_reply() {
        let mut txn = Transaction::new();
        let start = now();
        txn.on_send(send_data_msg(), start);
        txn.on_ack();
        assert_eq!(txn.state(), TransactionState::AwaitingReply);

        // The 1 s ACK deadline no longer applies once the ACK arrived
        assert_eq!(txn.on_timeout(start + ACK_TIMEOUT), TimeoutOutcome::None);

        match txn.on_timeout(start + TRANSACTION_TIMEOUT) {
            TimeoutOutcome::Resend(_) => {}
            other => panic!("expected Resend, got {:?}", other),
        }
    }

    #[test]
    fn test_unrelated_frame_keeps_waiting() {
        let mut txn = Transaction::new();
        txn.on_send(send_data_msg(), now());
        txn.on_ack();

        let unrelated = DataFrame::response(FunctionType::GetVersion, Bytes::new());
        assert_eq!(txn.on_frame(&unrelated), FrameOutcome::Unrelated);
        assert_eq!(txn.state(), TransactionState::AwaitingReply);
    }

    #[test]
    fn test_application_command_reply_matching() {
        let mut txn = Transaction::new();
        let mut msg = Message::send_data_expecting_report(
            NodeId::new(9),
            &[0x26, 0x02],
            TransmitOptions::default(),
        );
        msg.set_callback_id(1);
        txn.on_send(msg, now());
        txn.on_ack();

        // Report from the wrong node
        let wrong_node = DataFrame::request(
            FunctionType::ApplicationCommandHandler,
            vec![0x00, 0x08, 0x03, 0x26, 0x03, 0x63],
        );
        assert_eq!(txn.on_frame(&wrong_node), FrameOutcome::Unrelated);

        // Report with the wrong command class
        let wrong_class = DataFrame::request(
            FunctionType::ApplicationCommandHandler,
            vec![0x00, 0x09, 0x03, 0x25, 0x03, 0x63],
        );
        assert_eq!(txn.on_frame(&wrong_class), FrameOutcome::Unrelated);

        let report = DataFrame::request(
            FunctionType::ApplicationCommandHandler,
            vec![0x00, 0x09, 0x03, 0x26, 0x03, 0x63],
        );
        assert_eq!(txn.on_frame(&report), FrameOutcome::ReplyMatched);
    }
}
