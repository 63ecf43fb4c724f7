use crate::command_class::HandlerRegistry;
use crate::controller_command::{
    ControllerCallback, ControllerCommand, ControllerCommandError,
};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::node::NodeTable;
use crate::notification::{Notification, NotificationBus, Watcher, WatcherId};
use crate::poll::PollList;
use crate::queue::{QueueBand, QueueItem, SendQueues};
use crate::stats::{DriverStats, NodeStats};
use crate::storage::{ConfigStore, NullConfigStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};
use typed_builder::TypedBuilder;
use zwire_core::prelude::*;
use zwire_logging::{ConsoleSink, LogSink, Loglevel};

mod dispatch;
mod main_loop;

pub(crate) use main_loop::MainLoop;

/// Identity and capabilities of the attached controller, filled in during the
/// init handshake.
#[derive(Debug, Default, Clone)]
pub struct ControllerInfo {
    pub home_id: u32,
    pub own_node_id: NodeId,
    pub library_version: String,
    pub library_type: Option<LibraryType>,
    pub serial_api_version: (u8, u8),
    pub manufacturer_id: u16,
    pub product_type: u16,
    pub product_id: u16,
    pub api_mask: ApiMask,
    pub init_caps: InitCaps,
    pub controller_caps: ControllerCaps,
    pub suc_node_id: Option<NodeId>,
}

impl ControllerInfo {
    pub fn is_primary(&self) -> bool {
        self.init_caps.is_primary()
    }

    pub fn is_bridge(&self) -> bool {
        self.library_type.map(|t| t.is_bridge()).unwrap_or(false)
    }

    pub fn supports_function(&self, function: FunctionType) -> bool {
        self.api_mask.supports(function as u8)
    }
}

/// State shared between the driver loop, the serial pump, the poll task and
/// every host-facing handle. Each member guards itself; no lock is ever held
/// across I/O or a watcher callback.
pub(crate) struct DriverShared {
    pub queues: SendQueues,
    pub nodes: Mutex<NodeTable>,
    pub bus: NotificationBus,
    pub stats: Mutex<DriverStats>,
    pub poll: PollList,
    pub controller: RwLock<ControllerInfo>,
    /// True while a transaction is pending; the poll task backs off then
    pub in_flight: AtomicBool,
    pub exit: AtomicBool,
    pub shutdown: Notify,
    pub init_done: AtomicBool,
    pub awake_queried: AtomicBool,
    pub all_queried: AtomicBool,
}

impl DriverShared {
    fn new() -> Self {
        Self {
            queues: SendQueues::new(),
            nodes: Mutex::new(NodeTable::new()),
            bus: NotificationBus::new(),
            stats: Mutex::new(DriverStats::default()),
            poll: PollList::new(),
            controller: RwLock::new(ControllerInfo::default()),
            in_flight: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            shutdown: Notify::new(),
            init_done: AtomicBool::new(false),
            awake_queried: AtomicBool::new(false),
            all_queried: AtomicBool::new(false),
        }
    }

    pub fn with_stats<R>(&self, f: impl FnOnce(&mut DriverStats) -> R) -> R {
        let mut stats = self.stats.lock().expect("stats mutex poisoned");
        f(&mut stats)
    }

    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
        self.queues.signal();
    }

    pub fn exiting(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    /// Node ids currently believed asleep, snapshotted for queue selection
    pub fn asleep_snapshot(&self) -> Vec<NodeId> {
        let nodes = self.nodes.lock().expect("node table mutex poisoned");
        nodes
            .iter()
            .filter(|node| !node.is_awake())
            .map(|node| node.id())
            .collect()
    }
}

#[derive(TypedBuilder)]
pub struct DriverOptions {
    #[builder(default = Arc::new(NullConfigStore))]
    pub config_store: Arc<dyn ConfigStore>,
    #[builder(default = Arc::new(ConsoleSink::new(Loglevel::Info)))]
    pub log_sink: Arc<dyn LogSink>,
    #[builder(default)]
    pub handlers: HandlerRegistry,
    /// How long to wait between a node's awake report and releasing its
    /// wakeup traffic
    #[builder(default = Duration::ZERO)]
    pub wakeup_flush_delay: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Requests that must run on the driver loop itself.
pub(crate) enum DriverInput {
    BeginControllerCommand {
        command: ControllerCommand,
        node_id: NodeId,
        arg: u8,
        high_power: bool,
        callback: Option<ControllerCallback>,
        reply: oneshot::Sender<std::result::Result<(), ControllerCommandError>>,
    },
    CancelControllerCommand {
        reply: oneshot::Sender<bool>,
    },
    UpdateNodeRoutes {
        node_id: NodeId,
        targets: Vec<NodeId>,
        reply: oneshot::Sender<std::result::Result<(), ControllerCommandError>>,
    },
    TestNetwork {
        node_id: NodeId,
        count: u32,
    },
    LogStatistics,
    ResetController,
}

/// The host-facing handle. Cloneable; all methods are safe from any thread
/// and communicate with the driver loop through the queues or its input
/// channel.
#[derive(Clone)]
pub struct Driver {
    shared: Arc<DriverShared>,
    input_tx: mpsc::UnboundedSender<DriverInput>,
}

impl Driver {
    /// Run the driver over an already-open transport. This is the entry point
    /// used by tests (with an in-memory duplex) and by hosts that manage the
    /// port themselves.
    pub fn start<T>(transport: T, options: DriverOptions) -> Driver
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(DriverShared::new());
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (write_tx, write_rx) = mpsc::channel(64);

        let registry = Arc::new(options.handlers.clone());

        tokio::spawn(crate::serial_task::run_transport(
            transport,
            shared.clone(),
            frame_tx,
            write_rx,
        ));
        tokio::spawn(poll_task(shared.clone(), registry.clone()));
        tokio::spawn(MainLoop::new(shared.clone(), options, input_rx, frame_rx, write_tx).run());

        Driver { shared, input_tx }
    }

    /// Open the named serial device and run the driver over it, reopening
    /// with backoff if the port drops.
    pub fn open(path: &str, options: DriverOptions) -> Result<Driver> {
        let port = zwire_serial::port::open(path)?;

        let shared = Arc::new(DriverShared::new());
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (write_tx, write_rx) = mpsc::channel(64);

        let registry = Arc::new(options.handlers.clone());

        tokio::spawn(crate::serial_task::run_port(
            port,
            path.to_string(),
            shared.clone(),
            frame_tx,
            write_rx,
        ));
        tokio::spawn(poll_task(shared.clone(), registry.clone()));
        tokio::spawn(MainLoop::new(shared.clone(), options, input_rx, frame_rx, write_tx).run());

        Ok(Driver { shared, input_tx })
    }

    /// Enqueue an outbound message on the given band. Traffic for a node
    /// believed asleep is held on the WakeUp band instead (Command traffic is
    /// exempt). Returns false if an equal message was already queued.
    pub fn send_msg(&self, msg: Message, band: QueueBand) -> bool {
        let band = self.effective_band(&msg, band);
        let added = self
            .shared
            .queues
            .enqueue(QueueItem::SendMsg(msg), band);
        added
    }

    fn effective_band(&self, msg: &Message, band: QueueBand) -> QueueBand {
        if band == QueueBand::Command || band == QueueBand::WakeUp {
            return band;
        }
        let target = msg.target_node();
        if !target.is_valid() {
            return band;
        }
        let nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
        match nodes.get(target) {
            Some(node) if !node.is_awake() => QueueBand::WakeUp,
            _ => band,
        }
    }

    /// Start a multi-step controller-administration sequence. Fails with
    /// [`ControllerCommandError::Busy`] while another one is active.
    pub async fn begin_controller_command(
        &self,
        command: ControllerCommand,
        callback: Option<ControllerCallback>,
        high_power: bool,
        node_id: NodeId,
        arg: u8,
    ) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.input_tx
            .send(DriverInput::BeginControllerCommand {
                command,
                node_id,
                arg,
                high_power,
                callback,
                reply,
            })
            .map_err(|_| Error::ShuttingDown)?;
        response.await.map_err(|_| Error::ShuttingDown)??;
        Ok(())
    }

    /// Cancel the active controller command, if any. Returns whether one was
    /// active; its callback fires `Failed` exactly once.
    pub async fn cancel_controller_command(&self) -> Result<bool> {
        let (reply, response) = oneshot::channel();
        self.input_tx
            .send(DriverInput::CancelControllerCommand { reply })
            .map_err(|_| Error::ShuttingDown)?;
        response.await.map_err(|_| Error::ShuttingDown)
    }

    /// Walk a node's return routes after its associations changed
    pub async fn update_node_routes(&self, node_id: NodeId, targets: Vec<NodeId>) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.input_tx
            .send(DriverInput::UpdateNodeRoutes {
                node_id,
                targets,
                reply,
            })
            .map_err(|_| Error::ShuttingDown)?;
        response.await.map_err(|_| Error::ShuttingDown)??;
        Ok(())
    }

    pub fn enable_poll(&self, value_id: ValueId, intensity: u8) -> bool {
        let added = self.shared.poll.enable(value_id, intensity);
        if added {
            self.shared
                .bus
                .post(Notification::PollingEnabled { value_id });
        }
        added
    }

    pub fn disable_poll(&self, value_id: ValueId) -> bool {
        let removed = self.shared.poll.disable(value_id);
        if removed {
            self.shared
                .bus
                .post(Notification::PollingDisabled { value_id });
        }
        removed
    }

    pub fn is_polled(&self, value_id: ValueId) -> bool {
        self.shared.poll.is_polled(value_id)
    }

    pub fn set_poll_intensity(&self, value_id: ValueId, intensity: u8) -> bool {
        self.shared.poll.set_intensity(value_id, intensity)
    }

    pub fn set_poll_interval(&self, interval: Duration, between_polls: bool) {
        self.shared.poll.set_interval(interval, between_polls);
    }

    /// Probe the mesh with NoOperation bursts: `count` frames to one node,
    /// or to every known node when `node_id` is unspecified. The driver loop
    /// gives each probe its own callback id, so the burst survives dedup.
    pub fn test_network(&self, node_id: NodeId, count: u32) -> Result<()> {
        self.input_tx
            .send(DriverInput::TestNetwork { node_id, count })
            .map_err(|_| Error::ShuttingDown)
    }

    /// Ask the controller firmware to restart; the mesh is untouched
    pub fn soft_reset(&self) {
        self.shared.queues.enqueue(
            QueueItem::SendMsg(Message::request(FunctionType::SerialApiSoftReset)),
            QueueBand::Command,
        );
    }

    /// Factory-reset the controller and rebuild the mesh model from scratch
    pub fn reset_controller(&self) -> Result<()> {
        self.input_tx
            .send(DriverInput::ResetController)
            .map_err(|_| Error::ShuttingDown)
    }

    pub fn add_watcher(&self, watcher: Watcher) -> WatcherId {
        self.shared.bus.add_watcher(watcher)
    }

    pub fn remove_watcher(&self, id: WatcherId) -> bool {
        self.shared.bus.remove_watcher(id)
    }

    pub fn statistics(&self) -> DriverStats {
        self.shared.with_stats(|stats| stats.clone())
    }

    /// Dump the driver-global counters through the driver logger
    pub fn log_statistics(&self) -> Result<()> {
        self.input_tx
            .send(DriverInput::LogStatistics)
            .map_err(|_| Error::ShuttingDown)
    }

    pub fn node_statistics(&self, node_id: NodeId) -> Option<NodeStats> {
        let nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
        nodes.get(node_id).map(|node| node.stats.clone())
    }

    pub fn controller_info(&self) -> ControllerInfo {
        self.shared
            .controller
            .read()
            .expect("controller info lock poisoned")
            .clone()
    }

    pub fn is_ready(&self) -> bool {
        self.shared.init_done.load(Ordering::Acquire)
    }

    pub fn is_node_failed(&self, node_id: NodeId) -> bool {
        let nodes = self.shared.nodes.lock().expect("node table mutex poisoned");
        nodes.get(node_id).map(|n| n.is_failed()).unwrap_or(false)
    }

    pub fn send_queue_len(&self) -> usize {
        self.shared.queues.len()
    }

    /// Stop all three tasks. Each observes the exit flag within one loop
    /// iteration; the driver loop saves the network cache on its way out.
    pub fn shutdown(&self) {
        self.shared.request_exit();
    }
}

/// The poll timer task: ticks, picks the next due value, and enqueues its
/// refresh on the Poll band. Fully suppressed while anything more important
/// is pending.
async fn poll_task(shared: Arc<DriverShared>, registry: Arc<HandlerRegistry>) {
    loop {
        if shared.exiting() {
            break;
        }
        let sleep = shared.poll.next_sleep();
        tokio::select! {
            _ = shared.shutdown.notified() => break,
            _ = tokio::time::sleep(sleep) => {}
        }
        if shared.exiting() {
            break;
        }
        if shared.in_flight.load(Ordering::Acquire) || shared.queues.busy_above(QueueBand::Poll) {
            continue;
        }
        let Some(value_id) = shared.poll.next_due() else {
            continue;
        };
        if let Some(msg) = registry.refresh_message(value_id) {
            shared
                .queues
                .enqueue(QueueItem::SendMsg(msg), QueueBand::Poll);
        }
    }
}
