pub use crate::checksum::xor_sum;
pub use crate::counter::WrappingCounter;
pub use crate::definitions::*;
pub use crate::value_id::ValueId;
