pub use crate::codec::SerialFrameCodec;
pub use crate::error::{Error, Result};
pub use crate::frame::{DataFrame, SerialControlByte, SerialFrame};
