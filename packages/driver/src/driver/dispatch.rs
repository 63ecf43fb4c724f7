use super::main_loop::MainLoop;
use crate::command_class::DriverCtx;
use crate::message::Message;
use crate::node::QueryStage;
use crate::notification::Notification;
use crate::queue::QueueBand;
use std::sync::atomic::Ordering;
use zwire_core::prelude::*;
use zwire_logging::Direction;
use zwire_serial::frame::DataFrame;

impl MainLoop {
    /// Route one decoded frame by its function id. `completed` carries the
    /// outbound message this frame just completed, when it did.
    pub(super) async fn dispatch_frame(&mut self, frame: DataFrame, completed: Option<Message>) {
        self.controller_log
            .frame(Direction::Inbound, &frame.to_bytes());

        let Some(function) = frame.function_type() else {
            // Unknown ids are counted and carried past, never fatal
            self.shared.with_stats(|s| s.callbacks += 1);
            self.controller_log.warn(|| {
                format!("unknown function id {:#04x}, frame dropped", frame.function)
            });
            return;
        };

        match (function, frame.frame_type) {
            (FunctionType::GetVersion, FrameType::Response) => {
                self.handle_version_response(&frame);
            }
            (FunctionType::MemoryGetId, FrameType::Response) => {
                self.handle_memory_get_id_response(&frame);
            }
            (FunctionType::GetControllerCapabilities, FrameType::Response) => {
                if let Some(byte) = frame.payload.first() {
                    self.with_controller(|c| c.controller_caps = ControllerCaps::from_byte(*byte));
                }
            }
            (FunctionType::GetSerialApiCapabilities, FrameType::Response) => {
                self.handle_serial_api_caps_response(&frame);
            }
            (FunctionType::GetSucNodeId, FrameType::Response) => {
                let suc = frame.payload.first().map(|b| NodeId::new(*b));
                self.with_controller(|c| c.suc_node_id = suc.filter(|id| id.is_valid()));
            }
            (FunctionType::SerialApiGetInitData, FrameType::Response) => {
                self.handle_init_data_response(&frame);
            }

            (FunctionType::SendData, FrameType::Response) => {
                self.handle_send_data_response(&frame);
            }
            (FunctionType::SendData, FrameType::Request) => {
                self.handle_send_data_callback(&frame, completed);
            }

            (FunctionType::ApplicationCommandHandler, FrameType::Request) => {
                self.handle_application_command(&frame, completed.is_some());
            }
            (FunctionType::ApplicationUpdate, FrameType::Request) => {
                self.handle_application_update(&frame);
            }

            (FunctionType::GetNodeProtocolInfo, FrameType::Response) => {
                self.handle_protocol_info_response(&frame, completed.as_ref());
            }
            (FunctionType::GetRoutingInfo, FrameType::Response) => {
                if let Some(msg) = completed.as_ref() {
                    let node_id = msg.target_node();
                    let mut nodes =
                        self.shared.nodes.lock().expect("node table mutex poisoned");
                    if let Some(node) = nodes.get_mut(node_id) {
                        node.set_neighbors(&frame.payload);
                    }
                }
            }

            // Controller-administration callbacks feed the overlay machine
            (FunctionType::AddNodeToNetwork, FrameType::Request) => {
                let (status, source) = callback_status_and_node(&frame);
                let outcome = self.machine.on_add_node_status(status, source);
                self.apply_admin_outcome(outcome);
            }
            (FunctionType::RemoveNodeFromNetwork, FrameType::Request) => {
                let (status, source) = callback_status_and_node(&frame);
                let outcome = self.machine.on_remove_node_status(status, source);
                self.apply_admin_outcome(outcome);
            }
            (FunctionType::CreateNewPrimary, FrameType::Request)
            | (FunctionType::ControllerChange, FrameType::Request) => {
                let (status, _) = callback_status_and_node(&frame);
                let outcome = self.machine.on_new_controller_status(status);
                self.apply_admin_outcome(outcome);
            }
            (FunctionType::SetLearnMode, FrameType::Request) => {
                let (status, _) = callback_status_and_node(&frame);
                let outcome = self.machine.on_learn_mode_status(status);
                self.apply_admin_outcome(outcome);
            }
            (FunctionType::RemoveFailedNodeId, FrameType::Response) => {
                let retval = frame.payload.first().copied().unwrap_or(0xff);
                let outcome = self.machine.on_remove_failed_response(retval);
                self.apply_admin_outcome(outcome);
            }
            (FunctionType::RemoveFailedNodeId, FrameType::Request) => {
                let (status, _) = callback_status_and_node(&frame);
                let outcome = self.machine.on_remove_failed_callback(status);
                self.apply_admin_outcome(outcome);
            }
            (FunctionType::IsFailedNodeId, FrameType::Response) => {
                let failed = frame.payload.first().copied().unwrap_or(0) != 0;
                if let Some(node_id) = self.machine.active_node() {
                    let mut nodes =
                        self.shared.nodes.lock().expect("node table mutex poisoned");
                    if let Some(node) = nodes.get_mut(node_id) {
                        node.set_failed(failed);
                    }
                }
                let outcome = self.machine.on_is_failed_response(failed);
                self.apply_admin_outcome(outcome);
            }
            (FunctionType::ReplaceFailedNode, FrameType::Response) => {
                let retval = frame.payload.first().copied().unwrap_or(0xff);
                let outcome = self.machine.on_replace_failed_response(retval);
                self.apply_admin_outcome(outcome);
            }
            (FunctionType::ReplaceFailedNode, FrameType::Request) => {
                let (status, _) = callback_status_and_node(&frame);
                let outcome = self.machine.on_replace_failed_callback(status);
                self.apply_admin_outcome(outcome);
            }
            (FunctionType::AssignReturnRoute, FrameType::Response)
            | (FunctionType::DeleteReturnRoute, FrameType::Response) => {
                let ok = frame.payload.first().copied().unwrap_or(0) != 0;
                let outcome = self.machine.on_return_route_response(ok);
                self.apply_admin_outcome(outcome);
            }
            (FunctionType::AssignReturnRoute, FrameType::Request)
            | (FunctionType::DeleteReturnRoute, FrameType::Request) => {
                let (status, _) = callback_status_and_node(&frame);
                let outcome = self.machine.on_return_route_callback(status);
                self.apply_admin_outcome(outcome);
            }
            (FunctionType::RequestNodeNeighborUpdate, FrameType::Request) => {
                let (status, _) = callback_status_and_node(&frame);
                let outcome = self.machine.on_neighbor_update_status(status);
                self.apply_admin_outcome(outcome);
            }
            (FunctionType::RequestNetworkUpdate, FrameType::Response) => {
                let started = frame.payload.first().copied().unwrap_or(0) != 0;
                if !started {
                    let outcome = self.machine.on_network_update_callback(0x01);
                    self.apply_admin_outcome(outcome);
                }
            }
            (FunctionType::RequestNetworkUpdate, FrameType::Request) => {
                let (status, _) = callback_status_and_node(&frame);
                let outcome = self.machine.on_network_update_callback(status);
                self.apply_admin_outcome(outcome);
            }

            (FunctionType::SetDefault, FrameType::Request) => {
                self.handle_reset_complete();
            }
            (FunctionType::SerialApiSoftReset, FrameType::Response) => {}

            (FunctionType::ReplicationCommandComplete, FrameType::Request)
            | (FunctionType::ReplicationSendData, _) => {
                // Replication traffic is only relevant mid-transfer; the
                // learn-mode callbacks carry the state we track
            }

            _ => {
                self.controller_log.warn(|| {
                    format!("unhandled frame for function {:?}", function)
                });
            }
        }
    }

    fn with_controller(&self, f: impl FnOnce(&mut super::ControllerInfo)) {
        let mut controller = self
            .shared
            .controller
            .write()
            .expect("controller info lock poisoned");
        f(&mut controller);
    }

    // --- capability / init handlers ---

    fn handle_version_response(&mut self, frame: &DataFrame) {
        // NUL-terminated library version string followed by the library type
        let payload = &frame.payload;
        let text_end = payload
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(payload.len().saturating_sub(1));
        let version = String::from_utf8_lossy(&payload[..text_end]).trim().to_string();
        let library_type = payload.last().and_then(|b| LibraryType::try_from(*b).ok());
        self.with_controller(|c| {
            c.library_version = version.clone();
            c.library_type = library_type;
        });
        self.driver_log.info(|| match library_type {
            Some(t) => format!("controller library: {} ({})", version, t),
            None => format!("controller library: {}", version),
        });
    }

    fn handle_memory_get_id_response(&mut self, frame: &DataFrame) {
        let payload = &frame.payload;
        if payload.len() < 5 {
            return;
        }
        let home_id = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let own_node_id = NodeId::new(payload[4]);
        self.with_controller(|c| {
            c.home_id = home_id;
            c.own_node_id = own_node_id;
        });
        self.driver_log.info(|| {
            format!("home id {:#010x}, own node id {}", home_id, own_node_id)
        });
        // With the home id known, the cached mesh can be consulted
        self.cached = self.config_store.load(home_id);
    }

    fn handle_serial_api_caps_response(&mut self, frame: &DataFrame) {
        let payload = &frame.payload;
        if payload.len() < 8 {
            return;
        }
        let api_mask = ApiMask::from_bytes(payload.get(8..).unwrap_or(&[]));
        self.with_controller(|c| {
            c.serial_api_version = (payload[0], payload[1]);
            c.manufacturer_id = u16::from_be_bytes([payload[2], payload[3]]);
            c.product_type = u16::from_be_bytes([payload[4], payload[5]]);
            c.product_id = u16::from_be_bytes([payload[6], payload[7]]);
            c.api_mask = api_mask;
        });
        // The capability bitmap decides whether the SUC query is worth asking
        self.queue_init_tail();
    }

    fn handle_init_data_response(&mut self, frame: &DataFrame) {
        let payload = &frame.payload;
        if payload.len() < 3 {
            return;
        }
        let init_caps = InitCaps::from_byte(payload[1]);
        let mask_len = payload[2] as usize;
        let Some(mask) = payload.get(3..3 + mask_len) else {
            return;
        };
        self.with_controller(|c| c.init_caps = init_caps);

        let (home_id, own_node_id) = {
            let controller = self
                .shared
                .controller
                .read()
                .expect("controller info lock poisoned");
            (controller.home_id, controller.own_node_id)
        };

        let first_init = !self.shared.init_done.load(Ordering::Acquire);
        let mut discovered: Vec<(NodeId, bool)> = Vec::new();
        {
            let mut nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
            for node_id in node_ids_in_bitmask(mask) {
                if nodes.contains(node_id) {
                    continue;
                }
                let known = self
                    .cached
                    .as_ref()
                    .and_then(|snapshot| snapshot.node(node_id))
                    .cloned();
                if let Some(node) = nodes.init_node(node_id) {
                    if node_id == own_node_id {
                        // The controller answers for itself; no interview
                        node.set_query_stage(QueryStage::Complete);
                        continue;
                    }
                    match known {
                        Some(summary) => {
                            summary.apply_to(node);
                            discovered.push((node_id, true));
                        }
                        None => discovered.push((node_id, false)),
                    }
                }
            }
        }

        for (node_id, known) in &discovered {
            self.shared.bus.post(if *known {
                Notification::NodeNew { node_id: *node_id }
            } else {
                Notification::NodeAdded { node_id: *node_id }
            });
        }
        for (node_id, _) in discovered {
            self.advance_node_queries(node_id);
        }

        if first_init {
            self.init_finished();
            self.shared.bus.post(Notification::DriverReady {
                home_id,
                node_id: own_node_id,
            });
            self.driver_log.info(|| {
                format!(
                    "init complete, {} node(s) on the mesh",
                    self.shared
                        .nodes
                        .lock()
                        .expect("node table mutex poisoned")
                        .count()
                )
            });
        }
        // With no other nodes present, the milestones fire immediately
        self.check_completed_queries();
    }

    // --- send-data handlers ---

    fn handle_send_data_response(&mut self, frame: &DataFrame) {
        let accepted = frame.payload.first().copied().unwrap_or(0) != 0;
        if accepted {
            return;
        }
        // The controller refused to queue the frame at all
        self.shared.with_stats(|s| s.non_delivery += 1);
        if let Some(msg) = self.transaction.abort() {
            self.drop_message(msg);
        }
    }

    fn handle_send_data_callback(&mut self, frame: &DataFrame, completed: Option<Message>) {
        let Some(msg) = completed else {
            // A callback nobody is waiting for
            self.shared.with_stats(|s| s.callbacks += 1);
            return;
        };
        let status = frame
            .payload
            .get(1)
            .copied()
            .and_then(|b| TransmitStatus::try_from(b).ok());
        let node_id = msg.target_node();

        match status {
            Some(TransmitStatus::Ok) => {
                if node_id.is_valid() {
                    let mut nodes =
                        self.shared.nodes.lock().expect("node table mutex poisoned");
                    if let Some(node) = nodes.get_mut(node_id) {
                        node.note_delivery_ok();
                        node.set_failed(false);
                    }
                }
            }
            Some(TransmitStatus::NoAck) => self.handle_no_ack(msg),
            Some(TransmitStatus::NoRoute) => {
                self.shared.with_stats(|s| s.bad_routes += 1);
                if node_id.is_valid() {
                    self.with_node_stats(node_id, |stats| stats.sent_failed += 1);
                }
            }
            Some(TransmitStatus::Fail) | Some(TransmitStatus::NotIdle) => {
                // The network layer is congested; try again after a short pause
                self.shared.with_stats(|s| s.net_busy += 1);
                if msg.attempts_left() {
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        shared
                            .queues
                            .enqueue(crate::queue::QueueItem::SendMsg(msg), QueueBand::Send);
                    });
                } else {
                    self.drop_message(msg);
                }
            }
            None => {
                self.shared.with_stats(|s| s.callbacks += 1);
            }
        }
    }

    /// The target did not acknowledge. Sleeping nodes get their traffic
    /// parked after two misses in a row; everyone else gets retried in place.
    fn handle_no_ack(&mut self, msg: Message) {
        self.shared.with_stats(|s| s.no_ack += 1);
        let node_id = msg.target_node();
        if !node_id.is_valid() {
            return;
        }

        let (misses, can_sleep) = {
            let mut nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
            match nodes.get_mut(node_id) {
                Some(node) => (node.note_no_ack(), node.can_sleep()),
                None => return,
            }
        };

        if can_sleep && misses >= 2 {
            self.with_node_stats(node_id, |stats| stats.sent_failed += 1);
            // Park the failed message first so the wakeup flush replays it
            // ahead of the rest, in original order
            self.shared
                .queues
                .requeue_front(crate::queue::QueueItem::SendMsg(msg), QueueBand::Send);
            self.mark_asleep_and_migrate(node_id);
        } else if msg.attempts_left() {
            self.shared
                .queues
                .requeue_front(crate::queue::QueueItem::SendMsg(msg), QueueBand::Send);
        } else {
            self.drop_message(msg);
        }
    }

    // --- application traffic ---

    fn handle_application_command(&mut self, frame: &DataFrame, expected: bool) {
        let payload = &frame.payload;
        if payload.len() < 4 {
            self.shared.with_stats(|s| s.callbacks += 1);
            return;
        }
        let status = payload[0];
        let node_id = NodeId::new(payload[1]);
        let length = payload[2] as usize;
        let Some(cc_payload) = payload.get(3..3 + length) else {
            self.shared.with_stats(|s| s.callbacks += 1);
            return;
        };

        self.shared.with_stats(|s| {
            // Routed-busy and broadcast flags ride on the receive status
            if status & 0x01 != 0 {
                s.routed_busy += 1;
            }
            if status & 0x04 != 0 {
                s.broadcast_read_count += 1;
            }
        });

        {
            let mut nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
            if let Some(node) = nodes.get_mut(node_id) {
                node.stats.received += 1;
                if !expected {
                    node.stats.received_unsolicited += 1;
                }
            }
        }

        let class = cc_payload[0];
        let Some(handler) = self.registry.get(class).cloned() else {
            self.controller_log.warn(|| {
                format!(
                    "no handler for command class {:#04x} from node {}",
                    class, node_id
                )
            });
            return;
        };
        // No lock is held while the handler runs
        let ctx = DriverCtx {
            queues: &self.shared.queues,
            bus: &self.shared.bus,
            nodes: &self.shared.nodes,
            source_node: node_id,
        };
        handler.handle(cc_payload, &ctx);
    }

    fn handle_application_update(&mut self, frame: &DataFrame) {
        let payload = &frame.payload;
        let Some(status) = payload.first().copied() else {
            return;
        };
        let node_id = payload.get(1).copied().map(NodeId::new).unwrap_or_default();

        match status {
            app_update::NODE_INFO_RECEIVED => {
                // status, node, length, basic, generic, specific, classes...
                if payload.len() >= 6 {
                    let length = payload[2] as usize;
                    let classes = payload.get(6..3 + length).unwrap_or(&[]);
                    let mut nodes =
                        self.shared.nodes.lock().expect("node table mutex poisoned");
                    if let Some(node) = nodes.get_mut(node_id) {
                        for class in classes {
                            // 0xEF marks the supported/controlled separator
                            if *class == 0xef {
                                break;
                            }
                            node.add_command_class(*class);
                        }
                    }
                }
                self.wake_node(node_id);
            }
            app_update::NODE_INFO_REQ_FAILED => {
                self.controller_log
                    .warn(|| "node info request failed".to_string());
            }
            app_update::NEW_ID_ASSIGNED => {
                let created = {
                    let mut nodes =
                        self.shared.nodes.lock().expect("node table mutex poisoned");
                    (!nodes.contains(node_id) && nodes.init_node(node_id).is_some())
                };
                if created {
                    self.shared
                        .bus
                        .post(Notification::NodeAdded { node_id });
                    self.advance_node_queries(node_id);
                }
            }
            app_update::DELETE_DONE => {
                self.remove_node(node_id);
            }
            app_update::SUC_ID => {
                self.with_controller(|c| {
                    c.suc_node_id = Some(node_id).filter(|id| id.is_valid())
                });
            }
            _ => {}
        }
    }

    fn handle_protocol_info_response(&mut self, frame: &DataFrame, completed: Option<&Message>) {
        let Some(node_id) = completed.map(|msg| msg.target_node()) else {
            return;
        };
        let Some(info) = NodeProtocolInfo::parse(&frame.payload) else {
            return;
        };
        let now_asleep = {
            let mut nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
            match nodes.get_mut(node_id) {
                Some(node) => {
                    node.set_protocol_info(info);
                    !node.is_awake()
                }
                None => false,
            }
        };
        if now_asleep {
            // The rest of its interview has to wait for a wakeup window
            self.shared.queues.move_to_wakeup(node_id);
            self.check_completed_queries();
        }
        self.shared
            .bus
            .post(Notification::NodeProtocolInfo { node_id });
    }

    fn handle_reset_complete(&mut self) {
        {
            let mut nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
            *nodes = crate::node::NodeTable::new();
        }
        self.shared.queues.clear();
        self.shared.awake_queried.store(false, Ordering::Release);
        self.shared.all_queried.store(false, Ordering::Release);
        self.shared.init_done.store(false, Ordering::Release);
        self.shared.bus.post(Notification::DriverReset);
        // The controller has a fresh identity; run the handshake again
        self.queue_init_handshake();
    }

    // --- admin plumbing ---

    fn apply_admin_outcome(&mut self, outcome: crate::controller_command::AdminOutcome) {
        for msg in outcome.messages {
            self.enqueue_command(msg);
        }
        if let Some(node_id) = outcome.node_added {
            let created = {
                let mut nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
                nodes.init_node(node_id).is_some()
            };
            if created {
                self.shared
                    .bus
                    .post(Notification::NodeAdded { node_id });
                self.advance_node_queries(node_id);
            }
        }
        if let Some(node_id) = outcome.node_removed {
            self.remove_node(node_id);
        }
        if let Some(node_id) = outcome.refresh_neighbors {
            if let Some(msg) = QueryStage::Neighbors.core_queries(node_id).pop() {
                self.enqueue_command(msg);
            }
        }
    }

    fn remove_node(&mut self, node_id: NodeId) {
        let removed = {
            let mut nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
            nodes.remove(node_id).is_some()
        };
        if removed {
            self.shared.queues.remove_node_items(node_id);
            self.shared
                .bus
                .post(Notification::NodeRemoved { node_id });
            self.check_completed_queries();
        }
    }
}

/// Admin callbacks share the `callback id, status[, node]` layout
fn callback_status_and_node(frame: &DataFrame) -> (u8, NodeId) {
    let status = frame.payload.get(1).copied().unwrap_or(0);
    let node = frame
        .payload
        .get(2)
        .copied()
        .map(NodeId::new)
        .unwrap_or_default();
    (status, node)
}
