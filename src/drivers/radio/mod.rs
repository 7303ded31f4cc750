//! The shared-radio driver: a `radio://<index>/<channel>/<rate>/<address>`
//! URI backed by one physical dongle, reference-counted across logical
//! connections via [`arbiter`], with safe-link and link-quality layered on
//! top.

pub mod arbiter;
pub mod backend;
pub mod quality;
pub mod safelink;
pub mod strategies;
pub mod transport;
pub mod worker;

use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::addressing::{DataRate, RadioAddress, RadioConfig};
use crate::crtp::packet::Packet;
use crate::error::{Error, Result};

use self::backend::UsbBackend;
use self::quality::LinkQuality;
use self::safelink::SafeLink;
use self::strategies::{DefaultPolling, DefaultResending, PollingStrategy, ResendingStrategy};
use self::transport::RadioTransport;

use super::Uri;

const DEFAULT_INDEX: u8 = 0;
const DEFAULT_CHANNEL: u8 = 2;
const INBOUND_QUEUE_CAPACITY: usize = 32;
const OUTBOUND_QUEUE_CAPACITY: usize = 32;

/// Opens the platform's real USB backend for physical radio `index`.
///
/// This crate only defines [`UsbBackend`]; wiring it to an actual dongle
/// (via `rusb`/`nusb`) is left to the host binary.
pub trait BackendFactory: Send + Sync {
    fn open(&self, index: u8) -> Result<Box<dyn UsbBackend>>;
}

/// A shared-radio CRTP link.
pub struct RadioLinkDriver {
    index: u8,
    config: RadioConfig,
    transport: Arc<RadioTransport>,
    safelink: Arc<SafeLink>,
    quality: Arc<Mutex<LinkQuality>>,
    outbound: mpsc::Sender<Packet>,
    inbound: Mutex<mpsc::Receiver<Packet>>,
    cancel: CancellationToken,
}

fn backend_factory_slot() -> &'static OnceLock<Arc<dyn BackendFactory>> {
    static SLOT: OnceLock<Arc<dyn BackendFactory>> = OnceLock::new();
    &SLOT
}

/// Registers the process-wide [`BackendFactory`] used by [`RadioLinkDriver::open`].
///
/// Actual USB enumeration is an external collaborator;
/// a host binary calls this once at startup with whatever wraps `rusb` or
/// `nusb` before opening any `radio://` URI through [`super::Driver::open`].
/// A second call is a no-op.
pub fn set_backend_factory(factory: Arc<dyn BackendFactory>) {
    let _ = backend_factory_slot().set(factory);
}

/// The process-wide backend factory registered via [`set_backend_factory`],
/// if any. Used by anything that needs to acquire a [`transport::RadioTransport`]
/// outside of a full `radio://` [`super::Driver`] (e.g. [`crate::broadcaster::Broadcaster`]).
pub(crate) fn backend_factory() -> Option<Arc<dyn BackendFactory>> {
    backend_factory_slot().get().cloned()
}

impl RadioLinkDriver {
    /// Opens a `radio://` URI using the process-wide backend factory
    /// registered via [`set_backend_factory`].
    pub async fn open(uri: &Uri) -> Result<Self> {
        let factory = backend_factory_slot().get().cloned().ok_or(Error::NotConfigured)?;
        Self::open_with_backend(uri, factory).await
    }

    /// Parses a `radio://<index>/<channel>/<rate>/<address>` URI (all
    /// segments optional, defaulting to index 0, channel 2, rate 2M, address
    /// `E7E7E7E704` expanded from `index`) and opens it against the
    /// shared arbiter, using `backend_factory` the first time physical
    /// `index` is acquired by this process.
    pub async fn open_with_backend(
        uri: &Uri,
        backend_factory: Arc<dyn BackendFactory>,
    ) -> Result<Self> {
        let segments = uri.segments();

        let index: u8 = match segments.first() {
            Some(s) => s
                .parse()
                .map_err(|_| Error::WrongUri { uri: uri.path.clone(), reason: format!("{:?} is not a valid radio index", s) })?,
            None => DEFAULT_INDEX,
        };
        let channel: u8 = match segments.get(1) {
            Some(s) => s
                .parse()
                .map_err(|_| Error::WrongUri { uri: uri.path.clone(), reason: format!("{:?} is not a valid channel", s) })?,
            None => DEFAULT_CHANNEL,
        };
        let rate: DataRate = match segments.get(2) {
            Some(s) => s
                .parse()
                .map_err(|_: Error| Error::WrongUri { uri: uri.path.clone(), reason: format!("{:?} is not a valid data rate", s) })?,
            None => DataRate::Rate2M,
        };
        let address: RadioAddress = match segments.get(3) {
            Some(s) => s
                .parse()
                .map_err(|_: Error| Error::WrongUri { uri: uri.path.clone(), reason: format!("{:?} is not a valid address", s) })?,
            None => RadioAddress::from_byte(index),
        };

        let config = RadioConfig::new(rate, channel, address)?;

        let transport = arbiter::acquire(index, {
            let backend_factory = Arc::clone(&backend_factory);
            move || {
                let backend_factory = Arc::clone(&backend_factory);
                async move { Ok(RadioTransport::spawn(backend_factory.open(index)?)) }
            }
        })
        .await?;

        Self::start(index, config, transport)
    }

    fn start(index: u8, config: RadioConfig, transport: Arc<RadioTransport>) -> Result<Self> {
        let safelink = Arc::new(SafeLink::new());
        let quality = Arc::new(Mutex::new(LinkQuality::new()));
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();

        let resending: Box<dyn ResendingStrategy> = Box::new(DefaultResending::new());
        let polling: Box<dyn PollingStrategy> = Box::new(DefaultPolling::new());

        let worker_transport = Arc::clone(&transport);
        let worker_safelink = Arc::clone(&safelink);
        let worker_quality = Arc::clone(&quality);
        let worker_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = worker::run(
                worker_transport,
                worker_safelink,
                config,
                polling,
                resending,
                worker_quality,
                outbound_rx,
                inbound_tx,
                worker_cancel,
            )
            .await
            {
                log::warn!("radio link worker for index {} stopped: {}", index, e);
            }
        });

        Ok(RadioLinkDriver {
            index,
            config,
            transport,
            safelink,
            quality,
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            cancel,
        })
    }

    /// Enables safe-link and spawns its handshake supervisor against this
    /// link's own transport. Callers that need in-order delivery opt into
    /// this explicitly; it is not the default, matching upstream firmware
    /// where plain acknowledged delivery is enough for most use.
    pub fn enable_safelink(&self) {
        self.safelink.enable();
        let safelink = Arc::clone(&self.safelink);
        let transport = Arc::clone(&self.transport);
        let config = self.config;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            safelink
                .run_supervisor(
                    move || {
                        let transport = Arc::clone(&transport);
                        async move {
                            let ack = transport
                                .configure_send_and_receive(
                                    config,
                                    vec![safelink::INIT_HEADER, safelink::INIT_PAYLOAD[0], safelink::INIT_PAYLOAD[1]],
                                )
                                .await?;
                            Ok(ack.map(|a| a.data))
                        }
                    },
                    cancel,
                )
                .await;
        });
    }

    /// An observable for this link's quality score, `0.0..=1.0`.
    pub fn quality(&self) -> Arc<Mutex<LinkQuality>> {
        Arc::clone(&self.quality)
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.outbound
            .send(packet.clone())
            .await
            .map_err(|_| Error::LinkLost("radio link worker has stopped".into()))
    }

    pub async fn receive_packet(&self) -> Result<Packet> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::LinkLost("radio link worker has stopped".into()))
    }
}

impl Drop for RadioLinkDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
        arbiter::release(self.index);
    }
}
