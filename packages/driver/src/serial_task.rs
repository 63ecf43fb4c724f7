use crate::driver::DriverShared;
use crate::notification::Notification;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_serial::SerialStream;
use tokio_util::codec::Framed;
use zwire_serial::codec::SerialFrameCodec;
use zwire_serial::frame::SerialFrame;

const REOPEN_BACKOFF: Duration = Duration::from_secs(5);
const MAX_REOPEN_FAILURES: u32 = 3;

pub(crate) enum PumpEnd {
    Shutdown,
    TransportError,
}

/// Pump a fixed transport (tests, host-managed ports). A transport error is
/// fatal here: there is nothing to reopen.
pub(crate) async fn run_transport<T>(
    transport: T,
    shared: Arc<DriverShared>,
    frame_tx: mpsc::Sender<SerialFrame>,
    mut write_rx: mpsc::Receiver<SerialFrame>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = Framed::new(transport, SerialFrameCodec);
    let end = pump(&mut framed, &shared, &frame_tx, &mut write_rx).await;
    if matches!(end, PumpEnd::TransportError) && !shared.exiting() {
        shared.bus.post(Notification::DriverFailed);
        shared.request_exit();
    }
}

/// Pump a named serial port, reopening with backoff when it drops. Repeated
/// failures surface as a fatal `DriverFailed`.
pub(crate) async fn run_port(
    port: SerialStream,
    path: String,
    shared: Arc<DriverShared>,
    frame_tx: mpsc::Sender<SerialFrame>,
    mut write_rx: mpsc::Receiver<SerialFrame>,
) {
    let mut framed = Framed::new(port, SerialFrameCodec);
    let mut failures = 0u32;
    loop {
        match pump(&mut framed, &shared, &frame_tx, &mut write_rx).await {
            PumpEnd::Shutdown => return,
            PumpEnd::TransportError => {
                if shared.exiting() {
                    return;
                }
                failures += 1;
                shared.with_stats(|s| s.read_aborts += 1);
                if failures > MAX_REOPEN_FAILURES {
                    shared.bus.post(Notification::DriverFailed);
                    shared.request_exit();
                    return;
                }
                tokio::select! {
                    _ = shared.shutdown.notified() => return,
                    _ = tokio::time::sleep(REOPEN_BACKOFF) => {}
                }
                match zwire_serial::port::open(&path) {
                    Ok(port) => {
                        framed = Framed::new(port, SerialFrameCodec);
                        failures = 0;
                    }
                    Err(_) => continue,
                }
            }
        }
    }
}

async fn pump<T>(
    framed: &mut Framed<T, SerialFrameCodec>,
    shared: &Arc<DriverShared>,
    frame_tx: &mpsc::Sender<SerialFrame>,
    write_rx: &mut mpsc::Receiver<SerialFrame>,
) -> PumpEnd
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = shared.shutdown.notified() => return PumpEnd::Shutdown,
            Some(frame) = write_rx.recv() => {
                if framed.send(frame).await.is_err() {
                    return PumpEnd::TransportError;
                }
            }
            item = framed.next() => match item {
                Some(Ok(frame)) => match handle_inbound(frame, framed, shared, frame_tx).await {
                    Ok(()) => {}
                    Err(end) => return end,
                },
                Some(Err(_)) | None => return PumpEnd::TransportError,
            }
        }
    }
}

/// Account for one decoded frame and forward it to the driver loop. A valid
/// data frame is acknowledged before anything else is read; a corrupt one is
/// answered with NAK and dropped here.
async fn handle_inbound<T>(
    frame: SerialFrame,
    framed: &mut Framed<T, SerialFrameCodec>,
    shared: &Arc<DriverShared>,
    frame_tx: &mpsc::Sender<SerialFrame>,
) -> Result<(), PumpEnd>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match frame {
        SerialFrame::Data(data) => {
            shared.with_stats(|s| {
                s.sof_count += 1;
                s.read_count += 1;
            });
            if framed.send(SerialFrame::ACK).await.is_err() {
                return Err(PumpEnd::TransportError);
            }
            if frame_tx.send(SerialFrame::Data(data)).await.is_err() {
                return Err(PumpEnd::Shutdown);
            }
        }
        SerialFrame::Corrupt(_) => {
            shared.with_stats(|s| {
                s.sof_count += 1;
                s.bad_checksum += 1;
            });
            if framed.send(SerialFrame::NAK).await.is_err() {
                return Err(PumpEnd::TransportError);
            }
        }
        SerialFrame::Garbage(bytes) => {
            shared.with_stats(|s| s.oof_count += bytes.len() as u32);
        }
        SerialFrame::ACK => {
            shared.with_stats(|s| s.ack_count += 1);
            if frame_tx.send(SerialFrame::ACK).await.is_err() {
                return Err(PumpEnd::Shutdown);
            }
        }
        SerialFrame::NAK => {
            shared.with_stats(|s| s.nak_count += 1);
            if frame_tx.send(SerialFrame::NAK).await.is_err() {
                return Err(PumpEnd::Shutdown);
            }
        }
        SerialFrame::CAN => {
            shared.with_stats(|s| s.can_count += 1);
            if frame_tx.send(SerialFrame::CAN).await.is_err() {
                return Err(PumpEnd::Shutdown);
            }
        }
    }
    Ok(())
}
