use crate::message::Message;
use bytes::Bytes;
use thiserror::Error;
use zwire_core::prelude::*;
use zwire_serial::frame::DataFrame;

/// The multi-step administration sequences a host can start. Only one may be
/// active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Add a new controller to the network, as a secondary
    AddController,
    /// Add a new (non-controller) device to the network
    AddDevice,
    /// Add a new controller and transfer the primary role to it
    CreateNewPrimary,
    /// Receive network configuration from another controller
    ReceiveConfiguration,
    RemoveController,
    RemoveDevice,
    /// Move a dead node to the controller's failed-node list
    RemoveFailedNode,
    /// Ask the controller whether it believes a node has failed
    HasNodeFailed,
    /// Replace a failed node with a fresh device under the same id
    ReplaceFailedNode,
    TransferPrimaryRole,
    /// Request network topology from the SUC/SIS
    RequestNetworkUpdate,
    /// Have a node rediscover its neighbors
    RequestNodeNeighborUpdate,
    AssignReturnRoute,
    DeleteAllReturnRoutes,
    /// Track handheld button presses (virtual nodes)
    CreateButton,
    DeleteButton,
}

/// Progress reported to the host callback while a command runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Normal,
    /// Waiting for a user action, e.g. pressing the include button
    Waiting,
    InProgress,
    Completed,
    Failed,
    /// Terminal result of `HasNodeFailed` only
    NodeOk,
    NodeFailed,
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControllerState::Completed
                | ControllerState::Failed
                | ControllerState::NodeOk
                | ControllerState::NodeFailed
        )
    }
}

pub type ControllerCallback = Box<dyn FnMut(ControllerState) + Send>;

#[derive(Error, Debug)]
pub enum ControllerCommandError {
    #[error("another controller command is already active")]
    Busy,
    #[error("controller command {0:?} is not supported")]
    Unsupported(ControllerCommand),
    #[error("controller command requires a valid node id")]
    InvalidNode,
    #[error("controller command failed")]
    Failed,
}

/// Who started the active command. Route updates run the same sequences
/// internally without a host callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandOwner {
    Host,
    RouteUpdate,
}

struct ActiveCommand {
    command: ControllerCommand,
    state: ControllerState,
    callback: Option<ControllerCallback>,
    node_id: NodeId,
    high_power: bool,
    owner: CommandOwner,
    /// Node id picked up from the inclusion/exclusion callbacks
    subject_node: NodeId,
}

impl ActiveCommand {
    fn set_state(&mut self, state: ControllerState) {
        if self.state == state {
            return;
        }
        self.state = state;
        if let Some(callback) = self.callback.as_mut() {
            callback(state);
        }
    }
}

/// Side effects of feeding a controller-administration callback into the
/// machine, applied by the driver loop afterwards.
#[derive(Default)]
pub struct AdminOutcome {
    /// Frames to enqueue on the Command band
    pub messages: Vec<Message>,
    /// A node finished inclusion and needs a full interview
    pub node_added: Option<NodeId>,
    /// A node left the network
    pub node_removed: Option<NodeId>,
    /// A node's neighbor list should be re-read
    pub refresh_neighbors: Option<NodeId>,
}

/// After association changes, walk the affected node's return routes:
/// delete them all, then assign one per target, up to five targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RouteUpdateState {
    Begin,
    Deleted,
    Assigning(u8),
    End,
}

struct RouteUpdate {
    node_id: NodeId,
    targets: Vec<NodeId>,
    state: RouteUpdateState,
}

pub const MAX_ROUTE_TARGETS: usize = 5;

/// The overlay state machine that owns the currently active administration
/// sequence. All effects are returned to the caller; the machine itself only
/// builds frames and tracks state.
#[derive(Default)]
pub struct ControllerCommandMachine {
    active: Option<ActiveCommand>,
    routes: Option<RouteUpdate>,
}

impl ControllerCommandMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_command(&self) -> Option<ControllerCommand> {
        self.active.as_ref().map(|active| active.command)
    }

    pub fn active_node(&self) -> Option<NodeId> {
        self.active.as_ref().map(|active| active.node_id)
    }

    /// Start an administration sequence. Fails immediately when another one
    /// is active. On success, the returned message goes on the Command band.
    pub fn begin(
        &mut self,
        command: ControllerCommand,
        node_id: NodeId,
        arg: u8,
        high_power: bool,
        callback: Option<ControllerCallback>,
    ) -> Result<Message, ControllerCommandError> {
        self.begin_with_owner(command, node_id, arg, high_power, callback, CommandOwner::Host)
    }

    fn begin_with_owner(
        &mut self,
        command: ControllerCommand,
        node_id: NodeId,
        arg: u8,
        high_power: bool,
        callback: Option<ControllerCallback>,
        owner: CommandOwner,
    ) -> Result<Message, ControllerCommandError> {
        if self.active.is_some() {
            return Err(ControllerCommandError::Busy);
        }
        let message = initial_message(command, node_id, arg, high_power)?;

        let mut active = ActiveCommand {
            command,
            state: ControllerState::Normal,
            callback,
            node_id,
            high_power,
            owner,
            subject_node: NodeId::unspecified(),
        };
        active.set_state(ControllerState::Waiting);
        self.active = Some(active);
        Ok(message)
    }

    /// Cancel the active command. The returned frame (if any) tells the
    /// controller to stop; the host callback fires `Failed` exactly once.
    pub fn cancel(&mut self) -> Option<Message> {
        let mut active = self.active.take()?;
        let stop = stop_message(active.command, active.high_power);
        active.set_state(ControllerState::Failed);
        self.routes = None;
        stop
    }

    /// Start the post-association route walk for a node.
    pub fn begin_route_update(
        &mut self,
        node_id: NodeId,
        targets: Vec<NodeId>,
    ) -> Result<Message, ControllerCommandError> {
        if !node_id.is_valid() {
            return Err(ControllerCommandError::InvalidNode);
        }
        let mut targets = targets;
        targets.truncate(MAX_ROUTE_TARGETS);
        let message = self.begin_with_owner(
            ControllerCommand::DeleteAllReturnRoutes,
            node_id,
            0,
            false,
            None,
            CommandOwner::RouteUpdate,
        )?;
        self.routes = Some(RouteUpdate {
            node_id,
            targets,
            state: RouteUpdateState::Begin,
        });
        Ok(message)
    }

    pub fn route_update_active(&self) -> bool {
        self.routes.is_some()
    }

    // --- callback feeders, called from frame dispatch ---

    pub fn on_add_node_status(&mut self, status: u8, source: NodeId) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_mut() else {
            return outcome;
        };
        if !matches!(
            active.command,
            ControllerCommand::AddController | ControllerCommand::AddDevice
        ) {
            return outcome;
        }
        match status {
            add_node::STATUS_LEARN_READY => active.set_state(ControllerState::Waiting),
            add_node::STATUS_NODE_FOUND => active.set_state(ControllerState::InProgress),
            add_node::STATUS_ADDING_SLAVE | add_node::STATUS_ADDING_CONTROLLER => {
                active.subject_node = source;
                active.set_state(ControllerState::InProgress);
            }
            add_node::STATUS_PROTOCOL_DONE => {
                // Finish the protocol part; the DONE callback follows
                outcome
                    .messages
                    .push(add_node_mode_message(add_node::STOP, active.high_power));
            }
            add_node::STATUS_DONE => {
                let added = if source.is_valid() {
                    source
                } else {
                    active.subject_node
                };
                if added.is_valid() {
                    outcome.node_added = Some(added);
                }
                self.finish(ControllerState::Completed, &mut outcome);
            }
            add_node::STATUS_FAILED => {
                outcome
                    .messages
                    .push(add_node_mode_message(add_node::STOP, active.high_power));
                self.finish(ControllerState::Failed, &mut outcome);
            }
            _ => {}
        }
        outcome
    }

    pub fn on_remove_node_status(&mut self, status: u8, source: NodeId) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_mut() else {
            return outcome;
        };
        if !matches!(
            active.command,
            ControllerCommand::RemoveController | ControllerCommand::RemoveDevice
        ) {
            return outcome;
        }
        match status {
            remove_node::STATUS_LEARN_READY => active.set_state(ControllerState::Waiting),
            remove_node::STATUS_NODE_FOUND => active.set_state(ControllerState::InProgress),
            remove_node::STATUS_REMOVING_SLAVE | remove_node::STATUS_REMOVING_CONTROLLER => {
                active.subject_node = source;
                active.set_state(ControllerState::InProgress);
            }
            remove_node::STATUS_DONE => {
                let removed = if source.is_valid() {
                    source
                } else {
                    active.subject_node
                };
                if removed.is_valid() {
                    outcome.node_removed = Some(removed);
                }
                outcome
                    .messages
                    .push(remove_node_mode_message(remove_node::STOP));
                self.finish(ControllerState::Completed, &mut outcome);
            }
            remove_node::STATUS_FAILED => {
                outcome
                    .messages
                    .push(remove_node_mode_message(remove_node::STOP));
                self.finish(ControllerState::Failed, &mut outcome);
            }
            _ => {}
        }
        outcome
    }

    /// Shared by `CreateNewPrimary` and `TransferPrimaryRole`
    pub fn on_new_controller_status(&mut self, status: u8) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_mut() else {
            return outcome;
        };
        if !matches!(
            active.command,
            ControllerCommand::CreateNewPrimary | ControllerCommand::TransferPrimaryRole
        ) {
            return outcome;
        }
        match status {
            new_controller::STATUS_LEARN_READY => active.set_state(ControllerState::Waiting),
            new_controller::STATUS_NODE_FOUND | new_controller::STATUS_IN_PROGRESS => {
                active.set_state(ControllerState::InProgress)
            }
            new_controller::STATUS_DONE => self.finish(ControllerState::Completed, &mut outcome),
            new_controller::STATUS_FAILED => {
                let function = match active.command {
                    ControllerCommand::CreateNewPrimary => FunctionType::CreateNewPrimary,
                    _ => FunctionType::ControllerChange,
                };
                outcome.messages.push(plain_request(
                    function,
                    vec![new_controller::STOP, 0x00],
                ));
                self.finish(ControllerState::Failed, &mut outcome);
            }
            _ => {}
        }
        outcome
    }

    pub fn on_learn_mode_status(&mut self, status: u8) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_mut() else {
            return outcome;
        };
        if active.command != ControllerCommand::ReceiveConfiguration {
            return outcome;
        }
        match status {
            learn_mode::STATUS_STARTED => active.set_state(ControllerState::InProgress),
            learn_mode::STATUS_DONE => self.finish(ControllerState::Completed, &mut outcome),
            learn_mode::STATUS_FAILED => {
                outcome.messages.push(plain_request(
                    FunctionType::SetLearnMode,
                    vec![learn_mode::DISABLE, 0x00],
                ));
                self.finish(ControllerState::Failed, &mut outcome);
            }
            _ => {}
        }
        outcome
    }

    pub fn on_remove_failed_response(&mut self, retval: u8) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_mut() else {
            return outcome;
        };
        if active.command != ControllerCommand::RemoveFailedNode {
            return outcome;
        }
        if retval == failed_node::REMOVE_STARTED {
            active.set_state(ControllerState::InProgress);
        } else {
            self.finish(ControllerState::Failed, &mut outcome);
        }
        outcome
    }

    pub fn on_remove_failed_callback(&mut self, status: u8) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_ref() else {
            return outcome;
        };
        if active.command != ControllerCommand::RemoveFailedNode {
            return outcome;
        }
        if status == failed_node::NODE_REMOVED {
            outcome.node_removed = Some(active.node_id);
            self.finish(ControllerState::Completed, &mut outcome);
        } else {
            self.finish(ControllerState::Failed, &mut outcome);
        }
        outcome
    }

    pub fn on_is_failed_response(&mut self, failed: bool) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_ref() else {
            return outcome;
        };
        if active.command != ControllerCommand::HasNodeFailed {
            return outcome;
        }
        let state = if failed {
            ControllerState::NodeFailed
        } else {
            ControllerState::NodeOk
        };
        self.finish(state, &mut outcome);
        outcome
    }

    pub fn on_replace_failed_response(&mut self, retval: u8) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_mut() else {
            return outcome;
        };
        if active.command != ControllerCommand::ReplaceFailedNode {
            return outcome;
        }
        if retval == failed_node::REMOVE_STARTED {
            active.set_state(ControllerState::InProgress);
        } else {
            self.finish(ControllerState::Failed, &mut outcome);
        }
        outcome
    }

    pub fn on_replace_failed_callback(&mut self, status: u8) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_mut() else {
            return outcome;
        };
        if active.command != ControllerCommand::ReplaceFailedNode {
            return outcome;
        }
        match status {
            failed_node::REPLACE_WAITING => active.set_state(ControllerState::Waiting),
            failed_node::REPLACE_DONE => {
                // The replacement sits under the old id and needs a fresh interview
                outcome.node_added = Some(active.node_id);
                self.finish(ControllerState::Completed, &mut outcome);
            }
            failed_node::REPLACE_FAILED => self.finish(ControllerState::Failed, &mut outcome),
            _ => {}
        }
        outcome
    }

    pub fn on_neighbor_update_status(&mut self, status: u8) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_mut() else {
            return outcome;
        };
        if active.command != ControllerCommand::RequestNodeNeighborUpdate {
            return outcome;
        }
        match status {
            neighbor_update::STARTED => active.set_state(ControllerState::InProgress),
            neighbor_update::DONE => {
                outcome.refresh_neighbors = Some(active.node_id);
                self.finish(ControllerState::Completed, &mut outcome);
            }
            neighbor_update::FAILED => self.finish(ControllerState::Failed, &mut outcome),
            _ => {}
        }
        outcome
    }

    /// Shared by `AssignReturnRoute` and `DeleteAllReturnRoutes`
    pub fn on_return_route_response(&mut self, ok: bool) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_mut() else {
            return outcome;
        };
        if !matches!(
            active.command,
            ControllerCommand::AssignReturnRoute | ControllerCommand::DeleteAllReturnRoutes
        ) {
            return outcome;
        }
        if ok {
            active.set_state(ControllerState::InProgress);
        } else {
            self.finish(ControllerState::Failed, &mut outcome);
        }
        outcome
    }

    pub fn on_return_route_callback(&mut self, status: u8) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_ref() else {
            return outcome;
        };
        if !matches!(
            active.command,
            ControllerCommand::AssignReturnRoute | ControllerCommand::DeleteAllReturnRoutes
        ) {
            return outcome;
        }
        // Zero is TRANSMIT_COMPLETE_OK
        let state = if status == 0 {
            ControllerState::Completed
        } else {
            ControllerState::Failed
        };
        self.finish(state, &mut outcome);
        outcome
    }

    pub fn on_network_update_callback(&mut self, status: u8) -> AdminOutcome {
        let mut outcome = AdminOutcome::default();
        let Some(active) = self.active.as_ref() else {
            return outcome;
        };
        if active.command != ControllerCommand::RequestNetworkUpdate {
            return outcome;
        }
        // Zero is ZW_SUC_UPDATE_DONE
        let state = if status == 0 {
            ControllerState::Completed
        } else {
            ControllerState::Failed
        };
        self.finish(state, &mut outcome);
        outcome
    }

    /// Terminate the active command and, when it belonged to a route update,
    /// chain the next internal step.
    fn finish(&mut self, state: ControllerState, outcome: &mut AdminOutcome) {
        let Some(mut active) = self.active.take() else {
            return;
        };
        active.set_state(state);

        if active.owner != CommandOwner::RouteUpdate {
            return;
        }
        let success = state == ControllerState::Completed;
        if let Some(message) = self.advance_route_update(success) {
            outcome.messages.push(message);
        }
    }

    fn advance_route_update(&mut self, success: bool) -> Option<Message> {
        let routes = self.routes.as_mut()?;
        if !success {
            self.routes = None;
            return None;
        }

        let next_index = match routes.state {
            RouteUpdateState::Begin => {
                routes.state = RouteUpdateState::Deleted;
                0
            }
            RouteUpdateState::Assigning(i) => i as usize + 1,
            RouteUpdateState::Deleted | RouteUpdateState::End => {
                self.routes = None;
                return None;
            }
        };

        if next_index >= routes.targets.len() {
            routes.state = RouteUpdateState::End;
            self.routes = None;
            return None;
        }

        routes.state = RouteUpdateState::Assigning(next_index as u8);
        let node_id = routes.node_id;
        let target = routes.targets[next_index];
        self.begin_with_owner(
            ControllerCommand::AssignReturnRoute,
            node_id,
            target.into(),
            false,
            None,
            CommandOwner::RouteUpdate,
        )
        .ok()
    }
}

fn plain_request(function: FunctionType, payload: Vec<u8>) -> Message {
    Message::builder()
        .frame(DataFrame::request(function, Bytes::from(payload)))
        .build()
}

fn add_node_mode_message(mode: u8, high_power: bool) -> Message {
    let mode = if high_power {
        mode | OPTION_HIGH_POWER | OPTION_NETWORK_WIDE
    } else {
        mode
    };
    plain_request(FunctionType::AddNodeToNetwork, vec![mode, 0x00])
}

fn remove_node_mode_message(mode: u8) -> Message {
    plain_request(FunctionType::RemoveNodeFromNetwork, vec![mode, 0x00])
}

fn initial_message(
    command: ControllerCommand,
    node_id: NodeId,
    arg: u8,
    high_power: bool,
) -> Result<Message, ControllerCommandError> {
    use ControllerCommand::*;

    let needs_node = matches!(
        command,
        RemoveFailedNode
            | HasNodeFailed
            | ReplaceFailedNode
            | RequestNodeNeighborUpdate
            | AssignReturnRoute
            | DeleteAllReturnRoutes
    );
    if needs_node && !node_id.is_valid() {
        return Err(ControllerCommandError::InvalidNode);
    }

    let power = |mode: u8| {
        if high_power {
            mode | OPTION_HIGH_POWER | OPTION_NETWORK_WIDE
        } else {
            mode
        }
    };

    let message = match command {
        AddController => Message::builder()
            .frame(DataFrame::request(
                FunctionType::AddNodeToNetwork,
                Bytes::from(vec![power(add_node::CONTROLLER), 0x00]),
            ))
            .needs_callback_id(true)
            .build(),
        AddDevice => Message::builder()
            .frame(DataFrame::request(
                FunctionType::AddNodeToNetwork,
                Bytes::from(vec![power(add_node::ANY), 0x00]),
            ))
            .needs_callback_id(true)
            .build(),
        CreateNewPrimary => Message::builder()
            .frame(DataFrame::request(
                FunctionType::CreateNewPrimary,
                Bytes::from(vec![new_controller::START, 0x00]),
            ))
            .needs_callback_id(true)
            .build(),
        ReceiveConfiguration => Message::builder()
            .frame(DataFrame::request(
                FunctionType::SetLearnMode,
                Bytes::from(vec![learn_mode::ENABLE, 0x00]),
            ))
            .needs_callback_id(true)
            .build(),
        RemoveController | RemoveDevice => Message::builder()
            .frame(DataFrame::request(
                FunctionType::RemoveNodeFromNetwork,
                Bytes::from(vec![power(remove_node::ANY), 0x00]),
            ))
            .needs_callback_id(true)
            .build(),
        RemoveFailedNode => Message::builder()
            .frame(DataFrame::request(
                FunctionType::RemoveFailedNodeId,
                Bytes::from(vec![node_id.into(), 0x00]),
            ))
            .target_node(node_id)
            .expected_reply(FunctionType::RemoveFailedNodeId as u8)
            .needs_callback_id(true)
            .build(),
        HasNodeFailed => Message::builder()
            .frame(DataFrame::request(
                FunctionType::IsFailedNodeId,
                Bytes::from(vec![node_id.into()]),
            ))
            .target_node(node_id)
            .expected_reply(FunctionType::IsFailedNodeId as u8)
            .build(),
        ReplaceFailedNode => Message::builder()
            .frame(DataFrame::request(
                FunctionType::ReplaceFailedNode,
                Bytes::from(vec![node_id.into(), 0x00]),
            ))
            .target_node(node_id)
            .expected_reply(FunctionType::ReplaceFailedNode as u8)
            .needs_callback_id(true)
            .build(),
        TransferPrimaryRole => Message::builder()
            .frame(DataFrame::request(
                FunctionType::ControllerChange,
                Bytes::from(vec![new_controller::START, 0x00]),
            ))
            .needs_callback_id(true)
            .build(),
        RequestNetworkUpdate => Message::builder()
            .frame(DataFrame::request(
                FunctionType::RequestNetworkUpdate,
                Bytes::from(vec![0x00]),
            ))
            .expected_reply(FunctionType::RequestNetworkUpdate as u8)
            .needs_callback_id(true)
            .build(),
        RequestNodeNeighborUpdate => Message::builder()
            .frame(DataFrame::request(
                FunctionType::RequestNodeNeighborUpdate,
                Bytes::from(vec![node_id.into(), 0x00]),
            ))
            .target_node(node_id)
            .needs_callback_id(true)
            .build(),
        AssignReturnRoute => Message::builder()
            .frame(DataFrame::request(
                FunctionType::AssignReturnRoute,
                Bytes::from(vec![node_id.into(), arg, 0x00]),
            ))
            .target_node(node_id)
            .expected_reply(FunctionType::AssignReturnRoute as u8)
            .needs_callback_id(true)
            .build(),
        DeleteAllReturnRoutes => Message::builder()
            .frame(DataFrame::request(
                FunctionType::DeleteReturnRoute,
                Bytes::from(vec![node_id.into(), 0x00]),
            ))
            .target_node(node_id)
            .expected_reply(FunctionType::DeleteReturnRoute as u8)
            .needs_callback_id(true)
            .build(),
        // Button tracking rides on the virtual-node subsystem, which this
        // driver does not carry
        CreateButton | DeleteButton => {
            return Err(ControllerCommandError::Unsupported(command))
        }
    };
    Ok(message)
}

fn stop_message(command: ControllerCommand, high_power: bool) -> Option<Message> {
    use ControllerCommand::*;
    match command {
        AddController | AddDevice => Some(add_node_mode_message(add_node::STOP, high_power)),
        RemoveController | RemoveDevice => Some(remove_node_mode_message(remove_node::STOP)),
        CreateNewPrimary => Some(plain_request(
            FunctionType::CreateNewPrimary,
            vec![new_controller::STOP, 0x00],
        )),
        TransferPrimaryRole => Some(plain_request(
            FunctionType::ControllerChange,
            vec![new_controller::STOP, 0x00],
        )),
        ReceiveConfiguration => Some(plain_request(
            FunctionType::SetLearnMode,
            vec![learn_mode::DISABLE, 0x00],
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_callback() -> (ControllerCallback, Arc<Mutex<Vec<ControllerState>>>) {
        let states = Arc::new(Mutex::new(Vec::new()));
        let states2 = states.clone();
        let callback = Box::new(move |state: ControllerState| {
            states2.lock().unwrap().push(state);
        });
        (callback, states)
    }

    #[test]
    fn test_add_device_happy_path() {
        let mut machine = ControllerCommandMachine::new();
        let (callback, states) = recording_callback();

        let msg = machine
            .begin(
                ControllerCommand::AddDevice,
                NodeId::unspecified(),
                0,
                false,
                Some(callback),
            )
            .unwrap();
        assert_eq!(msg.function(), 0x4a);
        assert!(msg.expects_callback());
        assert!(machine.is_active());

        machine.on_add_node_status(add_node::STATUS_LEARN_READY, NodeId::unspecified());
        machine.on_add_node_status(add_node::STATUS_NODE_FOUND, NodeId::unspecified());
        machine.on_add_node_status(add_node::STATUS_ADDING_SLAVE, NodeId::new(12));
        let outcome =
            machine.on_add_node_status(add_node::STATUS_DONE, NodeId::unspecified());
        assert_eq!(outcome.node_added, Some(NodeId::new(12)));
        assert!(!machine.is_active());

        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ControllerState::Waiting,
                ControllerState::InProgress,
                ControllerState::Completed
            ]
        );
    }

    #[test]
    fn test_exclusive_activation() {
        let mut machine = ControllerCommandMachine::new();
        machine
            .begin(ControllerCommand::AddDevice, NodeId::unspecified(), 0, false, None)
            .unwrap();
        let second = machine.begin(
            ControllerCommand::RemoveDevice,
            NodeId::unspecified(),
            0,
            false,
            None,
        );
        assert!(matches!(second, Err(ControllerCommandError::Busy)));
    }

    #[test]
    fn test_cancel_fires_failed_once() {
        let mut machine = ControllerCommandMachine::new();
        let (callback, states) = recording_callback();
        machine
            .begin(
                ControllerCommand::AddDevice,
                NodeId::unspecified(),
                0,
                false,
                Some(callback),
            )
            .unwrap();

        let stop = machine.cancel().expect("add mode needs a stop frame");
        assert_eq!(stop.function(), 0x4a);
        assert_eq!(stop.frame().payload[0], add_node::STOP);
        assert!(!machine.is_active());
        assert!(machine.cancel().is_none());

        assert_eq!(
            *states.lock().unwrap(),
            vec![ControllerState::Waiting, ControllerState::Failed]
        );
    }

    #[test]
    fn test_has_node_failed_terminals() {
        let mut machine = ControllerCommandMachine::new();
        let (callback, states) = recording_callback();
        let msg = machine
            .begin(
                ControllerCommand::HasNodeFailed,
                NodeId::new(9),
                0,
                false,
                Some(callback),
            )
            .unwrap();
        assert_eq!(msg.function(), 0x62);
        assert!(!msg.expects_callback());

        machine.on_is_failed_response(true);
        assert!(!machine.is_active());
        assert_eq!(
            *states.lock().unwrap(),
            vec![ControllerState::Waiting, ControllerState::NodeFailed]
        );
    }

    #[test]
    fn test_node_id_required() {
        let mut machine = ControllerCommandMachine::new();
        let result = machine.begin(
            ControllerCommand::RemoveFailedNode,
            NodeId::unspecified(),
            0,
            false,
            None,
        );
        assert!(matches!(result, Err(ControllerCommandError::InvalidNode)));
        assert!(!machine.is_active());
    }

    #[test]
    fn test_buttons_unsupported() {
        let mut machine = ControllerCommandMachine::new();
        let result = machine.begin(
            ControllerCommand::CreateButton,
            NodeId::new(3),
            1,
            false,
            None,
        );
        assert!(matches!(
            result,
            Err(ControllerCommandError::Unsupported(ControllerCommand::CreateButton))
        ));
        assert!(!machine.is_active());
    }

    #[test]
    fn test_route_update_walks_targets() {
        let mut machine = ControllerCommandMachine::new();
        let targets = vec![NodeId::new(2), NodeId::new(3)];
        let first = machine
            .begin_route_update(NodeId::new(10), targets)
            .unwrap();
        assert_eq!(first.function(), 0x47);
        assert!(machine.route_update_active());

        // Delete completes: the first assignment follows
        machine.on_return_route_response(true);
        let outcome = machine.on_return_route_callback(0);
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].function(), 0x46);
        assert_eq!(outcome.messages[0].frame().payload[1], 2);

        // First assignment completes: the second follows
        machine.on_return_route_response(true);
        let outcome = machine.on_return_route_callback(0);
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0].frame().payload[1], 3);

        // Second assignment completes: the walk ends
        machine.on_return_route_response(true);
        let outcome = machine.on_return_route_callback(0);
        assert!(outcome.messages.is_empty());
        assert!(!machine.route_update_active());
        assert!(!machine.is_active());
    }

    #[test]
    fn test_route_update_stops_on_failure() {
        let mut machine = ControllerCommandMachine::new();
        machine
            .begin_route_update(NodeId::new(10), vec![NodeId::new(2)])
            .unwrap();
        let outcome = machine.on_return_route_response(false);
        assert!(outcome.messages.is_empty());
        assert!(!machine.route_update_active());
        assert!(!machine.is_active());
    }
}
