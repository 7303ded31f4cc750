//! The direct-USB driver: bulk-transfer CRTP framing against an
//! already-open device handle.
//!
//! Device enumeration and the raw handle itself are an external
//! collaborator; this module only frames packets over
//! whatever synchronous bulk transfer the host binary provides, the same way
//! [`super::radio::backend::UsbBackend`] does for the radio.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::crtp::packet::Packet;
use crate::error::{Error, Result};

use super::Uri;

const IO_TIMEOUT: Duration = Duration::from_millis(1000);
const INBOUND_QUEUE_CAPACITY: usize = 256;

/// A synchronous bulk-transfer handle, implemented by the host binary.
pub trait UsbHandle: Send {
    fn bulk_write(&mut self, data: &[u8], timeout: Duration) -> std::io::Result<()>;
    fn bulk_read(&mut self, timeout: Duration) -> std::io::Result<Vec<u8>>;
}

/// Opens the platform's real USB handle for device `index`.
pub trait UsbHandleFactory: Send + Sync {
    fn open(&self, index: u8) -> Result<Box<dyn UsbHandle>>;
}

fn handle_factory_slot() -> &'static std::sync::OnceLock<Arc<dyn UsbHandleFactory>> {
    static SLOT: std::sync::OnceLock<Arc<dyn UsbHandleFactory>> = std::sync::OnceLock::new();
    &SLOT
}

/// Registers the process-wide [`UsbHandleFactory`] used by [`UsbDriver::open`].
pub fn set_handle_factory(factory: Arc<dyn UsbHandleFactory>) {
    let _ = handle_factory_slot().set(factory);
}

/// A direct-USB CRTP link: one dedicated blocking worker thread reading and
/// writing the handle, matching the radio transport's blocking-worker
/// pattern.
pub struct UsbDriver {
    outbound: std::sync::mpsc::SyncSender<Vec<u8>>,
    inbound: Mutex<mpsc::Receiver<Packet>>,
}

impl UsbDriver {
    pub async fn open(uri: &Uri) -> Result<Self> {
        let factory = handle_factory_slot().get().cloned().ok_or(Error::NotConfigured)?;
        let index: u8 = match uri.segments().first() {
            Some(s) => s
                .parse()
                .map_err(|_| Error::WrongUri { uri: uri.path.clone(), reason: format!("{:?} is not a valid usb index", s) })?,
            None => 0,
        };
        let handle = factory.open(index)?;
        Ok(Self::spawn(handle))
    }

    /// Spawns the blocking worker thread that owns `handle` for its
    /// lifetime. `pub(crate)` so tests elsewhere in the crate (e.g.
    /// `crtp::device`'s `run_command` tests) can drive a scripted handle
    /// without a full URI/factory round trip.
    pub(crate) fn spawn(mut handle: Box<dyn UsbHandle>) -> Self {
        let (out_tx, out_rx) = std::sync::mpsc::sync_channel::<Vec<u8>>(16);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        std::thread::spawn(move || {
            while let Ok(bytes) = out_rx.recv() {
                if let Err(e) = handle.bulk_write(&bytes, IO_TIMEOUT) {
                    log::warn!("usb bulk_write failed: {}", e);
                    continue;
                }
                match handle.bulk_read(IO_TIMEOUT) {
                    Ok(data) if !data.is_empty() => {
                        if let Ok((packet, _)) = Packet::decode(&data) {
                            if in_tx.blocking_send(packet).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => log::debug!("usb bulk_read timed out or failed: {}", e),
                }
            }
        });

        UsbDriver {
            outbound: out_tx,
            inbound: Mutex::new(in_rx),
        }
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.outbound
            .try_send(packet.encode(None))
            .map_err(|_| Error::QueueFull.queue_full_as_io())
    }

    pub async fn receive_packet(&self) -> Result<Packet> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::LinkLost("usb worker thread terminated".into()))
    }
}
