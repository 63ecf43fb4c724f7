mod driver;
pub use crate::driver::*;

pub mod error;

mod command_class;
pub use crate::command_class::*;

mod controller_command;
pub use crate::controller_command::*;

mod message;
pub use crate::message::*;

mod node;
pub use crate::node::*;

mod notification;
pub use crate::notification::*;

mod poll;
pub use crate::poll::*;

mod queue;
pub use crate::queue::*;

mod serial_task;

mod stats;
pub use crate::stats::*;

mod storage;
pub use crate::storage::*;

mod transaction;
pub use crate::transaction::*;
