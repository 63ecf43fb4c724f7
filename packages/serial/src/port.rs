use crate::error::Result;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Open the controller stick at the fixed Serial API baud rate.
pub fn open(path: &str) -> Result<SerialStream> {
    #[allow(unused_mut)]
    let mut port = tokio_serial::new(path, 115_200).open_native_async()?;

    #[cfg(unix)]
    port.set_exclusive(false)?;

    Ok(port)
}
