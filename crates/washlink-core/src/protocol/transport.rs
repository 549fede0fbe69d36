//! Transport
//!
//! Owns the byte stream to the controller. A single reader task reassembles
//! frames and fans them out in arrival order; writes are serialised so two
//! frames never interleave on the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, trace, warn};

use super::commands::Request;
use super::frame::{Frame, FrameCodec};
use super::serial::{open_stream, SerialSettings};
use super::TransportError;

/// Capacity of the frame fan-out channel
const EVENT_CAPACITY: usize = 64;

/// Events delivered to transport subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A validated frame from the configured slave
    Frame(Frame),
    /// The stream failed; the transport is unusable afterwards
    Error(String),
    /// The stream reached end-of-file or was closed locally
    Closed,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Serial (or in-memory) link to one controller
pub struct Transport {
    writer: Mutex<Option<BoxedWriter>>,
    events: broadcast::Sender<TransportEvent>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
    slave: u8,
}

impl Transport {
    /// Open the named serial port and attach to it
    pub fn open(port_name: &str, settings: &SerialSettings, slave: u8) -> Result<Self, TransportError> {
        let stream = open_stream(port_name, settings)?;
        info!("Opened {} for slave {:#04x}", port_name, slave);
        Ok(Self::from_stream(stream, slave))
    }

    /// Attach to an already-open byte stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S>(stream: S, slave: u8) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        let reader = tokio::spawn(read_loop(
            FramedRead::new(read_half, FrameCodec::new()),
            events.clone(),
            closed.clone(),
            slave,
        ));

        Self {
            writer: Mutex::new(Some(Box::new(write_half))),
            events,
            reader: StdMutex::new(Some(reader)),
            closed,
            slave,
        }
    }

    /// Slave address this transport talks to
    pub fn slave(&self) -> u8 {
        self.slave
    }

    /// Receive every frame and fault from now on
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// True once the stream failed or `close` was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Write one frame
    pub async fn write(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::Closed)?;
        trace!("TX: {:?}", frame);

        let result = async {
            writer.write_all(&frame.to_wire()).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            warn!("Write failed: {}", e);
            self.closed.store(true, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::Error(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    /// Encode and write a request for this transport's slave
    pub async fn send(&self, request: Request) -> Result<(), TransportError> {
        self.write(&request.to_frame(self.slave)).await
    }

    /// Stop the reader task and release the stream
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.take_reader() {
            handle.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let _ = self.events.send(TransportEvent::Closed);
        debug!("Transport for slave {:#04x} closed", self.slave);
    }

    fn take_reader(&self) -> Option<JoinHandle<()>> {
        match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(handle) = self.take_reader() {
            handle.abort();
        }
    }
}

async fn read_loop<R>(
    mut frames: FramedRead<R, FrameCodec>,
    events: broadcast::Sender<TransportEvent>,
    closed: Arc<AtomicBool>,
    slave: u8,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match frames.next().await {
            Some(Ok(frame)) if frame.address == slave => {
                let _ = events.send(TransportEvent::Frame(frame));
            }
            Some(Ok(frame)) => {
                warn!(
                    "Dropping frame from slave {:#04x}, expected {:#04x}",
                    frame.address, slave
                );
            }
            Some(Err(e)) => {
                warn!("Read failed: {}", e);
                closed.store(true, Ordering::SeqCst);
                let _ = events.send(TransportEvent::Error(e.to_string()));
                return;
            }
            None => {
                info!("Stream for slave {:#04x} reached end of file", slave);
                closed.store(true, Ordering::SeqCst);
                let _ = events.send(TransportEvent::Closed);
                return;
            }
        }
    }
}
