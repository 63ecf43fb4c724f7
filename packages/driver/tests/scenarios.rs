//! End-to-end exercises of the driver loop against a scripted controller on
//! the other end of an in-memory byte pipe.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use zwire_core::prelude::*;
use zwire_driver::{Driver, DriverOptions, Message, Notification, QueueBand};
use zwire_logging::NullSink;
use zwire_serial::frame::DataFrame;

const ACK: u8 = 0x06;
const NAK: u8 = 0x15;

fn hex(s: &str) -> Vec<u8> {
    hex::decode(s).unwrap()
}

/// The controller side of the pipe: reads what the driver writes, frame by
/// frame, and plays back scripted answers.
struct Stick {
    stream: DuplexStream,
}

impl Stick {
    async fn read_byte(&mut self) -> u8 {
        let mut byte = [0u8; 1];
        self.stream.read_exact(&mut byte).await.unwrap();
        byte[0]
    }

    async fn read_frame(&mut self) -> Vec<u8> {
        let first = self.read_byte().await;
        match first {
            0x06 | 0x15 | 0x18 => vec![first],
            0x01 => {
                let len = self.read_byte().await;
                let mut rest = vec![0u8; len as usize];
                self.stream.read_exact(&mut rest).await.unwrap();
                let mut full = vec![0x01, len];
                full.extend_from_slice(&rest);
                full
            }
            other => panic!("unexpected byte on the wire: {:#04x}", other),
        }
    }

    async fn expect_control(&mut self, byte: u8) {
        assert_eq!(self.read_frame().await, vec![byte]);
    }

    async fn expect_request(&mut self, function: u8) -> Vec<u8> {
        let frame = self.read_frame().await;
        assert!(frame.len() >= 5, "expected a data frame, got {:02x?}", frame);
        assert_eq!(frame[2], 0x00, "expected a request frame");
        assert_eq!(frame[3], function, "unexpected function in {:02x?}", frame);
        frame
    }

    async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn send_ack(&mut self) {
        self.send(&[ACK]).await;
    }

    /// Answer the pending request; the driver acknowledges every good frame
    async fn respond(&mut self, function: FunctionType, payload: Vec<u8>) {
        self.send(&DataFrame::response(function, Bytes::from(payload)).to_bytes())
            .await;
        self.expect_control(ACK).await;
    }

    /// Push a controller-originated request (callback, relayed frame, ...)
    async fn request(&mut self, function: FunctionType, payload: Vec<u8>) {
        self.send(&DataFrame::request(function, Bytes::from(payload)).to_bytes())
            .await;
        self.expect_control(ACK).await;
    }
}

async fn start() -> (Driver, Stick) {
    let (host, stick) = tokio::io::duplex(4096);
    let options = DriverOptions::builder()
        .log_sink(Arc::new(NullSink))
        .build();
    let driver = Driver::start(host, options);
    (driver, Stick { stream: stick })
}

/// Let the driver tasks drain whatever is in flight
async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

/// Walk the whole init handshake for a mesh with the given node bitmask.
/// The controller itself is node 1.
async fn handshake(stick: &mut Stick, mask: [u8; 29]) {
    // Flush
    stick.expect_control(NAK).await;

    stick.expect_request(0x15).await;
    stick.send_ack().await;
    let mut version = b"Z-Wave 2.78".to_vec();
    version.push(0x00);
    version.push(0x01);
    stick.respond(FunctionType::GetVersion, version).await;

    stick.expect_request(0x20).await;
    stick.send_ack().await;
    stick
        .respond(FunctionType::MemoryGetId, hex("c0014e5f01"))
        .await;

    stick.expect_request(0x05).await;
    stick.send_ack().await;
    stick
        .respond(FunctionType::GetControllerCapabilities, vec![0x08])
        .await;

    stick.expect_request(0x07).await;
    stick.send_ack().await;
    // Serial API v1.0, Aeon Labs stick, every function supported
    let mut caps = vec![0x01, 0x00, 0x00, 0x86, 0x00, 0x01, 0x00, 0x5a];
    caps.extend_from_slice(&[0xff; 32]);
    stick
        .respond(FunctionType::GetSerialApiCapabilities, caps)
        .await;

    // Everything is supported, so the SUC query comes next
    stick.expect_request(0x56).await;
    stick.send_ack().await;
    stick.respond(FunctionType::GetSucNodeId, vec![0x00]).await;

    stick.expect_request(0x02).await;
    stick.send_ack().await;
    let mut init_data = vec![0x05, 0x08, 29];
    init_data.extend_from_slice(&mask);
    init_data.extend_from_slice(&[0x05, 0x00]);
    stick
        .respond(FunctionType::SerialApiGetInitData, init_data)
        .await;
}

fn controller_only() -> [u8; 29] {
    let mut mask = [0u8; 29];
    mask[0] = 0x01;
    mask
}

fn controller_and_node2() -> [u8; 29] {
    let mut mask = [0u8; 29];
    mask[0] = 0x03;
    mask
}

/// Node 2's interview starts right after init data; it turns out to be a
/// sleeping sensor, so the rest of its interview gets parked.
async fn interview_reveals_sleeper(stick: &mut Stick) {
    stick.expect_request(0x41).await;
    stick.send_ack().await;
    stick
        .respond(FunctionType::GetNodeProtocolInfo, hex("530000042001"))
        .await;
}

const NODE2_INFO: [u8; 6] = [0x84, 0x02, 0x03, 0x04, 0x20, 0x01];

/// Node 2 announces itself; its parked interview resumes and runs through
/// to completion.
async fn wake_and_complete_node2(stick: &mut Stick) {
    stick
        .request(FunctionType::ApplicationUpdate, NODE2_INFO.to_vec())
        .await;

    // NodeInfo stage: the answer arrives as an application update
    stick.expect_request(0x60).await;
    stick.send_ack().await;
    stick.respond(FunctionType::RequestNodeInfo, vec![0x01]).await;
    stick
        .request(FunctionType::ApplicationUpdate, NODE2_INFO.to_vec())
        .await;

    // Neighbors stage
    stick.expect_request(0x80).await;
    stick.send_ack().await;
    stick
        .respond(FunctionType::GetRoutingInfo, vec![0u8; 29])
        .await;
}

// S1: the first two exchanges of the init handshake, byte for byte
#[tokio::test(start_paused = true)]
async fn init_happy_path() {
    let (driver, mut stick) = start().await;

    stick.expect_control(NAK).await;
    let get_version = stick.expect_request(0x15).await;
    assert_eq!(get_version, hex("01030015e9"));

    stick.send_ack().await;
    let mut version = b"Z-Wave 2.78".to_vec();
    version.push(0x00);
    version.push(0x01);
    stick.respond(FunctionType::GetVersion, version).await;

    let memory_get_id = stick.expect_request(0x20).await;
    assert_eq!(memory_get_id, hex("01030020dc"));

    driver.shutdown();
}

#[tokio::test(start_paused = true)]
async fn init_populates_controller_info() {
    let (driver, mut stick) = start().await;
    handshake(&mut stick, controller_only()).await;
    settle().await;

    assert!(driver.is_ready());
    let info = driver.controller_info();
    assert_eq!(info.home_id, 0xc0014e5f);
    assert_eq!(info.own_node_id, NodeId::new(1));
    assert_eq!(info.library_version, "Z-Wave 2.78");
    assert_eq!(info.library_type, Some(LibraryType::StaticController));
    assert_eq!(info.manufacturer_id, 0x0086);
    assert!(info.controller_caps.was_real_primary());
    assert!(info.supports_function(FunctionType::SendData));
    assert_eq!(info.suc_node_id, None);

    driver.shutdown();
}

// S2: a NAK forces an identical rewrite; it counts as neither attempt nor retry
#[tokio::test(start_paused = true)]
async fn retry_on_nak() {
    let (driver, mut stick) = start().await;
    handshake(&mut stick, controller_only()).await;

    let msg = Message::send_data(
        NodeId::new(5),
        &[0x26, 0x01, 0x63],
        TransmitOptions::default(),
    );
    assert!(driver.send_msg(msg, QueueBand::Send));

    let first = stick.expect_request(0x13).await;
    stick.send(&[NAK]).await;

    let second = stick.expect_request(0x13).await;
    assert_eq!(first, second);

    stick.send_ack().await;
    stick.respond(FunctionType::SendData, vec![0x01]).await;
    let callback_id = second[second.len() - 2];
    stick
        .request(FunctionType::SendData, vec![callback_id, 0x00, 0x00, 0x02])
        .await;
    settle().await;

    let stats = driver.statistics();
    assert_eq!(stats.nak_count, 1);
    assert_eq!(stats.retries, 0);

    driver.shutdown();
}

// S3: two unacknowledged sends park a sleeper's traffic, in original order
#[tokio::test(start_paused = true)]
async fn sleep_migration_preserves_order() {
    let (driver, mut stick) = start().await;
    handshake(&mut stick, controller_and_node2()).await;
    interview_reveals_sleeper(&mut stick).await;
    wake_and_complete_node2(&mut stick).await;
    settle().await;

    let payloads: [&[u8]; 3] = [
        &[0x26, 0x01, 0x10],
        &[0x26, 0x01, 0x20],
        &[0x26, 0x01, 0x30],
    ];
    for payload in payloads {
        assert!(driver.send_msg(
            Message::send_data(NodeId::new(2), payload, TransmitOptions::default()),
            QueueBand::Send
        ));
    }

    // First attempt goes unacknowledged twice
    let first = stick.expect_request(0x13).await;
    let callback_id = first[first.len() - 2];
    stick.send_ack().await;
    stick.respond(FunctionType::SendData, vec![0x01]).await;
    stick
        .request(FunctionType::SendData, vec![callback_id, 0x01, 0x00, 0x02])
        .await;

    let retry = stick.expect_request(0x13).await;
    assert_eq!(first, retry);
    stick.send_ack().await;
    stick.respond(FunctionType::SendData, vec![0x01]).await;
    stick
        .request(FunctionType::SendData, vec![callback_id, 0x01, 0x00, 0x02])
        .await;
    settle().await;

    let stats = driver.statistics();
    assert_eq!(stats.no_ack, 2);
    assert_eq!(
        driver.node_statistics(NodeId::new(2)).unwrap().sent_failed,
        1
    );

    // On wakeup, all three replay in their original order
    stick
        .request(FunctionType::ApplicationUpdate, NODE2_INFO.to_vec())
        .await;
    for payload in payloads {
        let frame = stick.expect_request(0x13).await;
        // SendData payload: node, length, class bytes...
        assert_eq!(&frame[6..6 + payload.len()], payload);
        stick.send_ack().await;
        stick.respond(FunctionType::SendData, vec![0x01]).await;
        let id = frame[frame.len() - 2];
        stick
            .request(FunctionType::SendData, vec![id, 0x00, 0x00, 0x02])
            .await;
    }

    driver.shutdown();
}

// S4: a Command item overtakes a Poll item regardless of insertion order
#[tokio::test(start_paused = true)]
async fn priority_inversion_guard() {
    let (driver, mut stick) = start().await;
    handshake(&mut stick, controller_only()).await;

    // Keep the driver busy so both items are queued while one is in flight
    let filler = Message::send_data(NodeId::new(5), &[0x20, 0x01, 0x00], TransmitOptions::default());
    driver.send_msg(filler, QueueBand::Send);
    let filler_frame = stick.expect_request(0x13).await;

    let poll_item = Message::send_data(NodeId::new(5), &[0x25, 0x02], TransmitOptions::default());
    let command_item =
        Message::send_data(NodeId::new(5), &[0x26, 0x02], TransmitOptions::default());
    driver.send_msg(poll_item, QueueBand::Poll);
    driver.send_msg(command_item, QueueBand::Command);

    // Finish the filler exchange
    stick.send_ack().await;
    stick.respond(FunctionType::SendData, vec![0x01]).await;
    let id = filler_frame[filler_frame.len() - 2];
    stick
        .request(FunctionType::SendData, vec![id, 0x00, 0x00, 0x02])
        .await;

    // The Command item is dispatched first, although queued last
    let next = stick.expect_request(0x13).await;
    assert_eq!(&next[6..8], &[0x26, 0x02]);

    driver.shutdown();
}

// S5: a callback completes its exchange only with the matching id
#[tokio::test(start_paused = true)]
async fn callback_id_matching() {
    let (driver, mut stick) = start().await;
    handshake(&mut stick, controller_only()).await;

    let msg = Message::send_data(
        NodeId::new(5),
        &[0x26, 0x01, 0x63],
        TransmitOptions::default(),
    );
    driver.send_msg(msg, QueueBand::Send);

    let frame = stick.expect_request(0x13).await;
    let callback_id = frame[frame.len() - 2];
    stick.send_ack().await;
    stick.respond(FunctionType::SendData, vec![0x01]).await;

    // A stray callback is ignored and counted
    stick
        .request(
            FunctionType::SendData,
            vec![callback_id.wrapping_add(1), 0x00, 0x00, 0x02],
        )
        .await;
    settle().await;
    assert_eq!(driver.statistics().callbacks, 1);

    // The matching one finishes the exchange: the next message goes out
    stick
        .request(FunctionType::SendData, vec![callback_id, 0x00, 0x00, 0x02])
        .await;
    driver.send_msg(
        Message::send_data(NodeId::new(5), &[0x25, 0x02], TransmitOptions::default()),
        QueueBand::Send,
    );
    let next = stick.expect_request(0x13).await;
    assert_eq!(&next[6..8], &[0x25, 0x02]);

    driver.shutdown();
}

// S6: each interview milestone fires exactly once
#[tokio::test(start_paused = true)]
async fn query_completion_milestones() {
    let (driver, mut stick) = start().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    driver.add_watcher(Arc::new(move |notification: &Notification| {
        sink.lock().unwrap().push(notification.clone());
    }));

    handshake(&mut stick, controller_and_node2()).await;
    interview_reveals_sleeper(&mut stick).await;
    settle().await;

    let count = |n: &Notification| seen.lock().unwrap().iter().filter(|x| *x == n).count();

    // The only node that stays awake (the controller) is done; the sleeper
    // does not hold the milestone back
    assert_eq!(count(&Notification::AwakeNodesQueried), 1);
    assert_eq!(count(&Notification::AllNodesQueried), 0);

    wake_and_complete_node2(&mut stick).await;
    settle().await;

    assert_eq!(count(&Notification::AwakeNodesQueried), 1);
    assert_eq!(count(&Notification::AllNodesQueried), 1);
    assert_eq!(
        count(&Notification::NodeQueriesComplete {
            node_id: NodeId::new(2)
        }),
        1
    );

    driver.shutdown();
}
