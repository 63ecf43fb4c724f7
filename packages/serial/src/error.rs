use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Serialport(#[from] tokio_serial::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("read timed out")]
    ReadTimeout,
    #[error("frame checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    BadChecksum { expected: u8, actual: u8 },
    #[error("unexpected control byte {0:#04x}")]
    UnexpectedControlByte(u8),
}

pub type Result<T> = std::result::Result<T, Error>;
