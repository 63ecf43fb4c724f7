use derive_try_from_primitive::*;

/// Direction marker of a data frame: host-initiated exchanges are `Request`,
/// the controller's answers are `Response`. Asynchronous callbacks from the
/// controller arrive as `Request` frames as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Request = 0x00,
    Response = 0x01,
}
