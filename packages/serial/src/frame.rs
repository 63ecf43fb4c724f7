use crate::parse;
use bytes::{BufMut, Bytes, BytesMut};
use derive_try_from_primitive::*;
use nom::{
    branch::alt,
    bytes::streaming::{tag, take, take_till1},
    combinator::{map, peek, value},
    error::context,
    number::streaming::be_u8,
    sequence::tuple,
};
use std::fmt::Debug;
use zwire_core::checksum::xor_sum;
use zwire_core::definitions::{FrameType, FunctionType};

pub const ACK_BUFFER: [u8; 1] = [SerialControlByte::ACK as u8];
pub const NAK_BUFFER: [u8; 1] = [SerialControlByte::NAK as u8];
pub const CAN_BUFFER: [u8; 1] = [SerialControlByte::CAN as u8];

#[derive(Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum SerialControlByte {
    SOF = 0x01,
    ACK = 0x06,
    NAK = 0x15,
    CAN = 0x18,
}

/// One unit of the host <-> controller serial protocol. Data frames with a
/// failed checksum surface as `Corrupt` so the driver can answer with a NAK;
/// bytes outside any framing surface as `Garbage` and are counted, not fatal.
#[derive(Clone, Debug, PartialEq)]
pub enum SerialFrame {
    ACK,
    NAK,
    CAN,
    Data(DataFrame),
    Corrupt(Vec<u8>),
    Garbage(Vec<u8>),
}

fn consume_garbage(i: parse::Input) -> parse::Result<SerialFrame> {
    map(
        take_till1(|b| SerialControlByte::try_from(b).is_ok()),
        |g: &[u8]| SerialFrame::Garbage(g.to_vec()),
    )(i)
}

fn parse_control(i: parse::Input) -> parse::Result<SerialFrame> {
    alt((
        value(SerialFrame::ACK, tag(&ACK_BUFFER)),
        value(SerialFrame::NAK, tag(&NAK_BUFFER)),
        value(SerialFrame::CAN, tag(&CAN_BUFFER)),
    ))(i)
}

fn parse_data(i: parse::Input) -> parse::Result<SerialFrame> {
    // Ensure that the buffer contains at least 5 bytes
    peek(take(5usize))(i)?;

    // Ensure that it starts with a SOF byte and extract the length of the rest of the frame
    let (_, (_, len)) = peek(tuple((tag([SerialControlByte::SOF as u8]), be_u8)))(i)?;

    // Take the whole frame
    let (i, raw) = take(len as usize + 2)(i)?;

    // Everything framed but unusable is reported as Corrupt, to be NAKed
    let frame = match DataFrame::parse(raw) {
        Some(data) => SerialFrame::Data(data),
        None => SerialFrame::Corrupt(raw.to_vec()),
    };
    Ok((i, frame))
}

impl SerialFrame {
    pub fn parse(i: parse::Input) -> parse::Result<Self> {
        // A serial frame is either skipped garbage, a control byte, or data starting with SOF
        context(
            "Serial Frame",
            alt((consume_garbage, parse_control, parse_data)),
        )(i)
    }

    /// The exact bytes to put on the wire for this frame
    pub fn to_bytes(&self) -> Bytes {
        match self {
            SerialFrame::ACK => Bytes::from_static(&ACK_BUFFER),
            SerialFrame::NAK => Bytes::from_static(&NAK_BUFFER),
            SerialFrame::CAN => Bytes::from_static(&CAN_BUFFER),
            SerialFrame::Data(data) => data.to_bytes(),
            SerialFrame::Corrupt(raw) | SerialFrame::Garbage(raw) => {
                Bytes::copy_from_slice(raw)
            }
        }
    }
}

impl From<DataFrame> for SerialFrame {
    fn from(val: DataFrame) -> Self {
        SerialFrame::Data(val)
    }
}

/// A checksummed `SOF | LEN | TYPE | FUNC | PAYLOAD | CHECKSUM` frame.
/// The function ID is carried as a raw byte: framing does not interpret the
/// function-id space.
#[derive(Clone, PartialEq)]
pub struct DataFrame {
    pub frame_type: FrameType,
    pub function: u8,
    pub payload: Bytes,
}

impl Debug for DataFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFrame")
            .field("frame_type", &self.frame_type)
            .field("function", &format_args!("{:#04x}", &self.function))
            .field("payload", &format_args!("0x{}", hex::encode(&self.payload)))
            .finish()
    }
}

impl DataFrame {
    pub fn request(function: FunctionType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type: FrameType::Request,
            function: function as u8,
            payload: payload.into(),
        }
    }

    pub fn response(function: FunctionType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type: FrameType::Response,
            function: function as u8,
            payload: payload.into(),
        }
    }

    /// The typed function, if this driver knows the ID
    pub fn function_type(&self) -> Option<FunctionType> {
        FunctionType::from_byte(self.function)
    }

    /// Parse a complete `SOF..CHECKSUM` byte run. Returns `None` when the
    /// checksum or the type byte is invalid.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.len() < 5 {
            return None;
        }
        let checksum = raw[raw.len() - 1];
        if xor_sum(&raw[1..raw.len() - 1]) != checksum {
            return None;
        }
        let frame_type = FrameType::try_from(raw[2]).ok()?;
        Some(Self {
            frame_type,
            function: raw[3],
            payload: Bytes::copy_from_slice(&raw[4..raw.len() - 1]),
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 5);
        buf.put_u8(SerialControlByte::SOF as u8);
        buf.put_u8(self.payload.len() as u8 + 3);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.function);
        buf.put_slice(&self.payload);
        // Checksum covers LEN through the last payload byte
        buf.put_u8(xor_sum(&buf[1..]));
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage() {
        let data = hex::decode("07080901").unwrap();
        let expected = hex::decode("070809").unwrap();
        let remaining = hex::decode("01").unwrap();
        assert_eq!(
            consume_garbage(&data),
            Ok((remaining.as_slice(), SerialFrame::Garbage(expected)))
        );
    }

    #[test]
    fn test_control() {
        let data = hex::decode("0606151801").unwrap();
        let remaining = hex::decode("01").unwrap();
        assert_eq!(
            nom::multi::many0(parse_control)(&data),
            Ok((
                remaining.as_slice(),
                vec![
                    SerialFrame::ACK,
                    SerialFrame::ACK,
                    SerialFrame::NAK,
                    SerialFrame::CAN,
                ]
            )),
        );
    }

    #[test]
    fn test_data() {
        // GetVersion request
        let data = hex::decode("01030015e906").unwrap();
        let remaining = hex::decode("06").unwrap();
        assert_eq!(
            parse_data(&data),
            Ok((
                remaining.as_slice(),
                SerialFrame::Data(DataFrame::request(FunctionType::GetVersion, Bytes::new())),
            ))
        );
    }

    #[test]
    fn test_data_bad_checksum() {
        let raw = hex::decode("01030015ff").unwrap();
        let (rest, frame) = parse_data(&raw).unwrap();
        assert!(rest.is_empty());
        assert_eq!(frame, SerialFrame::Corrupt(raw.clone()));
    }

    #[test]
    fn test_many() {
        let data = hex::decode("01030015e906180000000801").unwrap();
        let garbage = hex::decode("00000008").unwrap();

        let mut results: Vec<SerialFrame> = Vec::new();
        let mut input = data.as_slice();
        while let Ok((remaining, frame)) = SerialFrame::parse(input) {
            results.push(frame);
            input = remaining;
        }
        assert_eq!(input, vec![0x01]);
        assert_eq!(
            results,
            vec![
                SerialFrame::Data(DataFrame::request(FunctionType::GetVersion, Bytes::new())),
                SerialFrame::ACK,
                SerialFrame::CAN,
                SerialFrame::Garbage(garbage),
            ]
        );
    }

    #[test]
    fn test_roundtrip() {
        let frame = DataFrame::request(
            FunctionType::SendData,
            hex::decode("0703260163250a").unwrap(),
        );
        let bytes = frame.to_bytes();
        let reparsed = DataFrame::parse(&bytes).unwrap();
        assert_eq!(reparsed, frame);
    }

    #[test]
    fn test_known_encodings() {
        // The two frames of the init handshake
        assert_eq!(
            DataFrame::request(FunctionType::GetVersion, Bytes::new()).to_bytes(),
            hex::decode("01030015e9").unwrap()
        );
        assert_eq!(
            DataFrame::request(FunctionType::MemoryGetId, Bytes::new()).to_bytes(),
            hex::decode("01030020dc").unwrap()
        );
    }
}
