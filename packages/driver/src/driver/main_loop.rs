use super::{DriverInput, DriverOptions, DriverShared};
use crate::command_class::HandlerRegistry;
use crate::controller_command::ControllerCommandMachine;
use crate::message::Message;
use crate::node::QueryStage;
use crate::notification::Notification;
use crate::queue::{QueueBand, QueueItem};
use crate::storage::{ConfigStore, NetworkSnapshot};
use crate::transaction::{FrameOutcome, TimeoutOutcome, Transaction, TransactionState};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use zwire_core::prelude::*;
use zwire_logging::loggers::{ControllerLogger, DriverLogger};
use zwire_logging::Direction;
use zwire_serial::frame::SerialFrame;

/// Cadence for re-running the init handshake when the controller does not
/// answer: every 5 s for the first two minutes, every 30 s after.
const INIT_RETRY_SHORT: Duration = Duration::from_secs(5);
const INIT_RETRY_LONG: Duration = Duration::from_secs(30);
const INIT_RETRY_SHORT_WINDOW: Duration = Duration::from_secs(120);

struct InitProgress {
    started_at: Instant,
    retry_at: Option<Instant>,
}

/// The driver loop: the only place that mutates the transaction machine, the
/// controller-command machine and the interview progression.
pub(crate) struct MainLoop {
    pub(super) shared: Arc<DriverShared>,
    input_rx: mpsc::UnboundedReceiver<DriverInput>,
    frame_rx: mpsc::Receiver<SerialFrame>,
    write_tx: mpsc::Sender<SerialFrame>,

    pub(super) transaction: Transaction,
    pub(super) machine: ControllerCommandMachine,
    callback_ids: WrappingCounter<u8>,
    pub(super) registry: Arc<HandlerRegistry>,
    pub(super) config_store: Arc<dyn ConfigStore>,
    pub(super) cached: Option<NetworkSnapshot>,
    wakeup_flush_delay: Duration,

    pub(super) driver_log: DriverLogger,
    pub(super) controller_log: ControllerLogger,
    init: InitProgress,
}

impl MainLoop {
    pub(crate) fn new(
        shared: Arc<DriverShared>,
        options: DriverOptions,
        input_rx: mpsc::UnboundedReceiver<DriverInput>,
        frame_rx: mpsc::Receiver<SerialFrame>,
        write_tx: mpsc::Sender<SerialFrame>,
    ) -> Self {
        Self {
            shared,
            input_rx,
            frame_rx,
            write_tx,
            transaction: Transaction::new(),
            machine: ControllerCommandMachine::new(),
            callback_ids: WrappingCounter::new(),
            registry: Arc::new(options.handlers),
            config_store: options.config_store,
            cached: None,
            wakeup_flush_delay: options.wakeup_flush_delay,
            driver_log: DriverLogger::new(options.log_sink.clone()),
            controller_log: ControllerLogger::new(options.log_sink),
            init: InitProgress {
                started_at: Instant::now(),
                retry_at: None,
            },
        }
    }

    pub(crate) async fn run(mut self) {
        self.driver_log.info(|| "driver starting".to_string());

        // Flush any half-finished exchange on the controller side
        let _ = self.write_tx.send(SerialFrame::NAK).await;
        self.queue_init_handshake();

        loop {
            if self.shared.exiting() {
                break;
            }

            // 1. Drain inbound frames
            while let Ok(frame) = self.frame_rx.try_recv() {
                self.handle_frame(frame).await;
            }

            // 2. Safe point: no node-table lock is held here
            self.shared.bus.dispatch();

            // 3. Host requests
            while let Ok(input) = self.input_rx.try_recv() {
                self.handle_input(input);
            }

            if self.shared.exiting() {
                break;
            }

            // 4. Put the next sendable item on the wire
            if self.transaction.is_idle() {
                self.send_next().await;
            }
            self.shared
                .in_flight
                .store(!self.transaction.is_idle(), Ordering::Release);

            // 5. Sleep until something happens or a deadline passes
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = self.shared.shutdown.notified() => {}
                Some(frame) = self.frame_rx.recv() => self.handle_frame(frame).await,
                Some(input) = self.input_rx.recv() => self.handle_input(input),
                _ = self.shared.queues.readiness() => {}
                _ = sleep_until_or_forever(deadline) => self.handle_timeouts().await,
            }
        }

        self.teardown();
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.transaction.next_deadline(), self.init.retry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn teardown(&mut self) {
        self.driver_log.info(|| "driver shutting down".to_string());
        if self.shared.init_done.load(Ordering::Acquire) {
            self.save_network_cache();
        }
        self.shared.queues.clear();
        // Deliver whatever is still queued, including a possible DriverFailed
        self.shared.bus.dispatch();
    }

    // --- init handshake ---

    pub(super) fn queue_init_handshake(&mut self) {
        for function in [
            FunctionType::GetVersion,
            FunctionType::MemoryGetId,
            FunctionType::GetControllerCapabilities,
            FunctionType::GetSerialApiCapabilities,
        ] {
            self.shared.queues.enqueue(
                QueueItem::SendMsg(Message::request_expecting_response(
                    function,
                    bytes::Bytes::new(),
                )),
                QueueBand::Command,
            );
        }
        self.init.retry_at = Some(Instant::now() + INIT_RETRY_SHORT);
    }

    /// Called from dispatch once the serial API capabilities are known
    pub(super) fn queue_init_tail(&mut self) {
        let supports_suc = self
            .shared
            .controller
            .read()
            .expect("controller info lock poisoned")
            .supports_function(FunctionType::GetSucNodeId);
        if supports_suc {
            self.shared.queues.enqueue(
                QueueItem::SendMsg(Message::request_expecting_response(
                    FunctionType::GetSucNodeId,
                    bytes::Bytes::new(),
                )),
                QueueBand::Command,
            );
        }
        self.shared.queues.enqueue(
            QueueItem::SendMsg(Message::request_expecting_response(
                FunctionType::SerialApiGetInitData,
                bytes::Bytes::new(),
            )),
            QueueBand::Command,
        );
    }

    pub(super) fn init_finished(&mut self) {
        self.init.retry_at = None;
        self.shared.init_done.store(true, Ordering::Release);
    }

    fn retry_init(&mut self) {
        let elapsed = self.init.started_at.elapsed();
        let backoff = if elapsed < INIT_RETRY_SHORT_WINDOW {
            INIT_RETRY_SHORT
        } else {
            INIT_RETRY_LONG
        };
        self.driver_log.warn(|| {
            format!(
                "controller did not finish the init handshake, retrying in {:?}",
                backoff
            )
        });
        self.queue_init_handshake();
        self.init.retry_at = Some(Instant::now() + backoff);
    }

    // --- frame handling ---

    async fn handle_frame(&mut self, frame: SerialFrame) {
        match frame {
            SerialFrame::ACK => {
                let _ = self.transaction.on_ack();
            }
            SerialFrame::NAK | SerialFrame::CAN => {
                if let Some(msg) = self.transaction.on_nak_or_can() {
                    // Written again immediately; this is not a retry
                    self.write_message(msg).await;
                }
            }
            SerialFrame::Data(frame) => {
                let outcome = self.transaction.on_frame(&frame);
                match outcome {
                    FrameOutcome::StrayCallback => {
                        // Echo of an id we did not send: count and drop
                        self.shared.with_stats(|s| s.callbacks += 1);
                        return;
                    }
                    FrameOutcome::Unrelated
                        if self.transaction.state() == TransactionState::AwaitingReply =>
                    {
                        self.shared.with_stats(|s| s.ack_waiting += 1);
                    }
                    _ => {}
                }
                let completed = match outcome {
                    FrameOutcome::Done(msg) => Some(msg),
                    _ => None,
                };
                self.dispatch_frame(frame, completed).await;
            }
            // The serial task never forwards these
            SerialFrame::Corrupt(_) | SerialFrame::Garbage(_) => {}
        }
    }

    async fn handle_timeouts(&mut self) {
        let now = Instant::now();
        match self.transaction.on_timeout(now) {
            TimeoutOutcome::Resend(msg) => {
                self.shared.with_stats(|s| s.retries += 1);
                if let Some(node) = self.node_for(&msg) {
                    self.with_node_stats(node, |stats| stats.retries += 1);
                }
                self.controller_log
                    .warn(|| "no response, retransmitting".to_string());
                self.write_and_track(msg).await;
            }
            TimeoutOutcome::Drop(msg) => self.drop_message(msg),
            TimeoutOutcome::None => {}
        }

        if let Some(retry_at) = self.init.retry_at {
            if Instant::now() >= retry_at && !self.shared.init_done.load(Ordering::Acquire) {
                self.retry_init();
            }
        }
    }

    /// Give up on a message: count it, and if its node can sleep, hold the
    /// node's remaining traffic for its next wakeup window.
    pub(super) fn drop_message(&mut self, msg: Message) {
        self.shared.with_stats(|s| s.dropped += 1);
        let Some(node_id) = self.node_for(&msg) else {
            return;
        };
        let can_sleep = {
            let mut nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
            match nodes.get_mut(node_id) {
                Some(node) => {
                    node.stats.sent_failed += 1;
                    node.can_sleep()
                }
                None => false,
            }
        };
        if can_sleep {
            self.mark_asleep_and_migrate(node_id);
        }
    }

    pub(super) fn mark_asleep_and_migrate(&mut self, node_id: NodeId) {
        {
            let mut nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
            if let Some(node) = nodes.get_mut(node_id) {
                node.set_awake(false);
                node.note_delivery_ok();
            }
        }
        let moved = self.shared.queues.move_to_wakeup(node_id);
        if moved > 0 {
            self.driver_log.info(|| {
                format!(
                    "node {} is asleep, holding {} message(s) for its next wakeup",
                    node_id, moved
                )
            });
        }
    }

    fn node_for(&self, msg: &Message) -> Option<NodeId> {
        let target = msg.target_node();
        target.is_valid().then_some(target)
    }

    pub(super) fn with_node_stats(&self, node_id: NodeId, f: impl FnOnce(&mut crate::stats::NodeStats)) {
        let mut nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
        if let Some(node) = nodes.get_mut(node_id) {
            f(&mut node.stats);
        }
    }

    // --- sending ---

    async fn send_next(&mut self) {
        let asleep: HashSet<NodeId> = self.shared.asleep_snapshot().into_iter().collect();
        loop {
            let popped = self
                .shared
                .queues
                .pop_next_sendable(&|id| asleep.contains(&id));
            match popped {
                Some((QueueItem::SendMsg(mut msg), _band)) => {
                    if msg.expects_callback() && msg.callback_id() == 0 {
                        msg.set_callback_id(self.callback_ids.increment());
                    }
                    self.write_and_track(msg).await;
                    return;
                }
                Some((QueueItem::QueryStageComplete { node_id, .. }, _band)) => {
                    // The marker made it to the head: everything the stage
                    // queued has reached a terminal state.
                    self.advance_node_queries(node_id);
                    continue;
                }
                None => return,
            }
        }
    }

    async fn write_and_track(&mut self, msg: Message) {
        let target = msg.target_node();
        if target.is_valid() {
            self.with_node_stats(target, |stats| stats.sent += 1);
        }
        self.write_message(msg).await;
    }

    /// Write the frame and arm the expected-reply machine
    async fn write_message(&mut self, msg: Message) {
        self.shared.with_stats(|s| {
            s.write_count += 1;
            if msg.target_node().is_broadcast() {
                s.broadcast_write_count += 1;
            }
        });
        self.controller_log
            .frame(Direction::Outbound, &msg.to_bytes());
        let frame = SerialFrame::Data(msg.frame().clone());
        let _ = self.write_tx.send(frame).await;
        self.transaction.on_send(msg, Instant::now());
    }

    /// Enqueue on the Command band without waking anything else
    pub(super) fn enqueue_command(&self, msg: Message) {
        self.shared
            .queues
            .enqueue(QueueItem::SendMsg(msg), QueueBand::Command);
    }

    // --- interview progression ---

    /// Begin (or continue) a node's interview by advancing its stage cursor
    /// until a stage contributes actual exchanges.
    pub(super) fn advance_node_queries(&mut self, node_id: NodeId) {
        let mut to_enqueue: Vec<Message> = Vec::new();
        let mut reached = None;
        let mut completed = false;
        let mut essential = false;
        {
            let mut nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
            let Some(node) = nodes.get_mut(node_id) else {
                return;
            };
            loop {
                let stage = node.query_stage();
                if stage == QueryStage::Complete {
                    return;
                }
                let next = stage.next();
                node.set_query_stage(next);
                if next == QueryStage::Associations {
                    // Everything static is known by now
                    essential = true;
                }
                if next == QueryStage::Complete {
                    completed = true;
                    break;
                }
                let mut messages = next.core_queries(node_id);
                messages.extend(self.registry.stage_queries(node, next));
                if !messages.is_empty() {
                    reached = Some(next);
                    to_enqueue = messages;
                    break;
                }
            }
        }

        if essential {
            self.shared
                .bus
                .post(Notification::EssentialNodeQueriesComplete { node_id });
        }

        if completed {
            self.shared
                .bus
                .post(Notification::NodeQueriesComplete { node_id });
            self.check_completed_queries();
            return;
        }

        let stage = reached.expect("loop breaks with either a stage or completion");
        for msg in to_enqueue {
            self.shared
                .queues
                .enqueue(QueueItem::SendMsg(msg), QueueBand::Query);
        }
        self.shared.queues.enqueue(
            QueueItem::QueryStageComplete { node_id, stage },
            QueueBand::Query,
        );
    }

    /// Dump the driver-global counters through the driver logger
    fn log_statistics(&self) {
        let stats = self.shared.with_stats(|s| s.clone());
        self.driver_log.info(|| "Driver statistics:".to_string());
        self.driver_log.info(|| {
            format!(
                "  frames read: {} of {} SOF ({} bad checksums, {} bytes out of framing, {} read aborts)",
                stats.read_count, stats.sof_count, stats.bad_checksum, stats.oof_count, stats.read_aborts
            )
        });
        self.driver_log.info(|| {
            format!(
                "  frames written: {} ({} retries, {} dropped)",
                stats.write_count, stats.retries, stats.dropped
            )
        });
        self.driver_log.info(|| {
            format!(
                "  control bytes: {} ACK, {} NAK, {} CAN",
                stats.ack_count, stats.nak_count, stats.can_count
            )
        });
        self.driver_log.info(|| {
            format!(
                "  unsolicited while pending: {}, unexpected callbacks: {}",
                stats.ack_waiting, stats.callbacks
            )
        });
        self.driver_log.info(|| {
            format!(
                "  delivery failures: {} no ACK, {} bad route, {} network busy, {} not delivered, {} routed busy",
                stats.no_ack, stats.bad_routes, stats.net_busy, stats.non_delivery, stats.routed_busy
            )
        });
        self.driver_log.info(|| {
            format!(
                "  broadcasts: {} read, {} written",
                stats.broadcast_read_count, stats.broadcast_write_count
            )
        });
    }

    /// Fire the awake-queried / all-queried milestones exactly once each
    pub(super) fn check_completed_queries(&mut self) {
        let (awake, all) = {
            let nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
            (nodes.awake_queried(), nodes.all_queried())
        };
        if awake && !self.shared.awake_queried.swap(true, Ordering::AcqRel) {
            self.shared.bus.post(Notification::AwakeNodesQueried);
        }
        if all && !self.shared.all_queried.swap(true, Ordering::AcqRel) {
            self.shared.bus.post(Notification::AllNodesQueried);
            self.save_network_cache();
        }
    }

    pub(super) fn save_network_cache(&self) {
        let snapshot = {
            let nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
            let home_id = self
                .shared
                .controller
                .read()
                .expect("controller info lock poisoned")
                .home_id;
            NetworkSnapshot::from_table(home_id, &nodes)
        };
        self.config_store.save(&snapshot);
    }

    /// A sleeping node announced itself: release its held traffic
    pub(super) fn wake_node(&mut self, node_id: NodeId) {
        let woke = {
            let mut nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
            match nodes.get_mut(node_id) {
                Some(node) if !node.is_awake() => {
                    node.set_awake(true);
                    true
                }
                _ => false,
            }
        };
        if !woke {
            return;
        }
        self.driver_log
            .info(|| format!("node {} woke up", node_id));
        if self.wakeup_flush_delay.is_zero() {
            self.shared.queues.signal();
        } else {
            let shared = self.shared.clone();
            let delay = self.wakeup_flush_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                shared.queues.signal();
            });
        }
        self.check_completed_queries();
    }

    // --- host inputs ---

    fn handle_input(&mut self, input: DriverInput) {
        match input {
            DriverInput::BeginControllerCommand {
                command,
                node_id,
                arg,
                high_power,
                callback,
                reply,
            } => {
                let result = self
                    .machine
                    .begin(command, node_id, arg, high_power, callback);
                let result = match result {
                    Ok(msg) => {
                        self.enqueue_command(msg);
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            DriverInput::CancelControllerCommand { reply } => {
                let was_active = self.machine.is_active();
                if let Some(stop) = self.machine.cancel() {
                    self.enqueue_command(stop);
                }
                let _ = reply.send(was_active);
            }
            DriverInput::UpdateNodeRoutes {
                node_id,
                targets,
                reply,
            } => {
                let result = match self.machine.begin_route_update(node_id, targets) {
                    Ok(msg) => {
                        self.enqueue_command(msg);
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            DriverInput::TestNetwork { node_id, count } => {
                let targets: Vec<NodeId> = if node_id.is_valid() {
                    vec![node_id]
                } else {
                    let own = self
                        .shared
                        .controller
                        .read()
                        .expect("controller info lock poisoned")
                        .own_node_id;
                    let nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
                    nodes
                        .iter()
                        .map(|node| node.id())
                        .filter(|id| *id != own)
                        .collect()
                };
                for target in targets {
                    for _ in 0..count {
                        let mut msg = Message::no_op(target);
                        msg.set_callback_id(self.callback_ids.increment());
                        self.shared
                            .queues
                            .enqueue(QueueItem::SendMsg(msg), QueueBand::Send);
                    }
                }
            }
            DriverInput::LogStatistics => self.log_statistics(),
            DriverInput::ResetController => {
                self.driver_log
                    .warn(|| "resetting controller to factory defaults".to_string());
                let msg = Message::builder()
                    .frame(zwire_serial::frame::DataFrame::request(
                        FunctionType::SetDefault,
                        bytes::Bytes::from(vec![0x00]),
                    ))
                    .needs_callback_id(true)
                    .build();
                self.enqueue_command(msg);
            }
        }
    }
}

async fn sleep_until_or_forever(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
