//! The radio transport: a synchronous send-and-receive primitive around the
//! physical dongle, run on one dedicated blocking worker thread.
//!
//! All of the dongle's mutable state — selected channel/address/rate, the
//! last-applied config used to skip redundant vendor requests, firmware
//! version — lives on the worker thread, inside [`Worker`]. Async callers
//! never touch it directly; they post a [`Request`] over a bounded channel
//! and await the matching reply.

use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use bitflags::bitflags;
use tokio::sync::oneshot;

use crate::addressing::RadioConfig;
use crate::error::{Error, Result};

use super::backend::UsbBackend;

bitflags! {
    /// The dongle's status byte, prefixed to every bulk-read response.
    ///
    /// Bits 0-1 carry ack/power-detector flags; bits 4-7 carry the radio
    /// chip's own retry counter for the send this status answers.
    struct StatusByte: u8 {
        const ACK             = 0b0000_0001;
        const POWER_DETECTOR  = 0b0000_0010;
        const RETRY_COUNT_MASK = 0b1111_0000;
    }
}

/// How long the transport waits on each direction of a bulk transfer.
pub const IO_TIMEOUT: Duration = Duration::from_millis(1000);

/// How many in-flight requests the worker's queue can hold before a caller
/// sees [`Error::QueueFull`].
pub const REQUEST_QUEUE_CAPACITY: usize = 16;

/// The dongle's response to a send: whether the peer ACKed, whether its power
/// detector tripped, how many retries the radio chip itself performed, and
/// any payload the peer piggybacked on the ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    pub ack: bool,
    pub power_detector: bool,
    pub retry_count: u8,
    pub data: Vec<u8>,
}

enum Request {
    ConfigureSendReceive {
        config: RadioConfig,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<Option<Acknowledgment>>>,
    },
    ScanChannels {
        config: RadioConfig,
        range: (u8, u8),
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
}

/// A handle to one physical radio's blocking worker thread.
///
/// Cloning is not provided directly; instead multiple logical connections
/// share a transport through [`super::arbiter`].
pub struct RadioTransport {
    requests: std_mpsc::SyncSender<Request>,
}

impl RadioTransport {
    /// Spawns the blocking worker thread that owns `backend` for its
    /// lifetime.
    pub fn spawn(backend: Box<dyn UsbBackend>) -> Self {
        let (tx, rx) = std_mpsc::sync_channel(REQUEST_QUEUE_CAPACITY);
        std::thread::spawn(move || Worker::new(backend).run(rx));
        RadioTransport { requests: tx }
    }

    /// Configures the dongle for `config` (skipping the vendor requests if
    /// unchanged since the last call with an equal config), writes `payload`,
    /// and reads back the dongle's acknowledgment. Returns `Ok(None)` on a
    /// read/write timeout rather than an error.
    pub async fn configure_send_and_receive(
        &self,
        config: RadioConfig,
        payload: Vec<u8>,
    ) -> Result<Option<Acknowledgment>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .try_send(Request::ConfigureSendReceive {
                config,
                payload,
                reply: reply_tx,
            })
            .map_err(|_| Error::QueueFull)?;
        reply_rx
            .await
            .map_err(|_| Error::LinkLost("radio worker thread terminated".into()))?
    }

    /// Sweeps `[start, stop)` for a channel the dongle gets an ACK on, using
    /// the firmware-accelerated scan if available, falling back to
    /// sequential per-channel probing otherwise.
    pub async fn scan_channels(&self, config: RadioConfig, start: u8, stop: u8) -> Result<Vec<u8>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .try_send(Request::ScanChannels {
                config,
                range: (start, stop),
                reply: reply_tx,
            })
            .map_err(|_| Error::QueueFull)?;
        reply_rx
            .await
            .map_err(|_| Error::LinkLost("radio worker thread terminated".into()))?
    }
}

struct Worker {
    backend: Box<dyn UsbBackend>,
    last_applied: Option<RadioConfig>,
}

impl Worker {
    fn new(backend: Box<dyn UsbBackend>) -> Self {
        Worker {
            backend,
            last_applied: None,
        }
    }

    fn run(mut self, rx: std_mpsc::Receiver<Request>) {
        while let Ok(request) = rx.recv() {
            match request {
                Request::ConfigureSendReceive {
                    config,
                    payload,
                    reply,
                } => {
                    let result = self.configure_send_receive(&config, &payload);
                    let _ = reply.send(result);
                }
                Request::ScanChannels {
                    config,
                    range,
                    reply,
                } => {
                    let result = self.scan_channels(&config, range.0, range.1);
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn apply_config_if_changed(&mut self, config: &RadioConfig) -> std::io::Result<()> {
        if self.last_applied.as_ref() == Some(config) {
            return Ok(());
        }
        self.backend.set_channel(config.channel)?;
        self.backend.set_address(config.address.as_bytes())?;
        self.backend.set_data_rate(config.data_rate.as_u8())?;
        self.last_applied = Some(*config);
        Ok(())
    }

    fn configure_send_receive(
        &mut self,
        config: &RadioConfig,
        payload: &[u8],
    ) -> Result<Option<Acknowledgment>> {
        self.apply_config_if_changed(config)
            .map_err(|e| Error::IoError(io_error_code(&e)))?;

        if let Err(e) = self.backend.bulk_write(payload, IO_TIMEOUT) {
            if e.kind() == std::io::ErrorKind::TimedOut {
                return Ok(None);
            }
            return Err(Error::IoError(io_error_code(&e)));
        }

        match self.backend.bulk_read(IO_TIMEOUT) {
            Ok(data) => Ok(Some(decode_ack(data))),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(Error::IoError(io_error_code(&e))),
        }
    }

    fn scan_channels(&mut self, config: &RadioConfig, start: u8, stop: u8) -> Result<Vec<u8>> {
        self.apply_config_if_changed(config)
            .map_err(|e| Error::IoError(io_error_code(&e)))?;

        if let Some(found) = self
            .backend
            .scan_channels(start, stop)
            .map_err(|e| Error::IoError(io_error_code(&e)))?
        {
            return Ok(found);
        }

        log::debug!(
            "dongle firmware {:?} lacks accelerated scan, falling back to sequential probing",
            self.backend.firmware_version()
        );
        let mut found = Vec::new();
        for channel in start..stop {
            let mut probe = *config;
            probe.channel = channel;
            match self.configure_send_receive(&probe, &[0xFF]) {
                Ok(Some(ack)) if ack.ack => found.push(channel),
                _ => {}
            }
        }
        Ok(found)
    }
}

/// The first byte of the ACK payload carries `(power_detector, retry_count)`
/// framing produced by the radio chip; the rest is any data the peer
/// piggybacked. This mirrors the Crazyradio dongle's status-byte convention.
fn decode_ack(mut data: Vec<u8>) -> Acknowledgment {
    if data.is_empty() {
        return Acknowledgment {
            ack: true,
            power_detector: false,
            retry_count: 0,
            data: Vec::new(),
        };
    }
    let status = StatusByte::from_bits_truncate(data.remove(0));
    Acknowledgment {
        ack: status.contains(StatusByte::ACK),
        power_detector: status.contains(StatusByte::POWER_DETECTOR),
        retry_count: (status & StatusByte::RETRY_COUNT_MASK).bits() >> 4,
        data,
    }
}

fn io_error_code(e: &std::io::Error) -> u8 {
    e.raw_os_error().map(|c| c as u8).unwrap_or(5) // EIO
}

#[cfg(test)]
mod tests {
    use super::super::backend::mock::MockBackend;
    use super::*;
    use crate::addressing::{DataRate, RadioAddress};

    fn config() -> RadioConfig {
        RadioConfig::new(DataRate::Rate2M, 80, RadioAddress::from(0x01)).unwrap()
    }

    #[tokio::test]
    async fn send_receive_round_trips_through_worker_thread() {
        let mut backend = MockBackend::default();
        backend.responses.push_back(Some(vec![0x01, 0xAA, 0xBB]));
        let transport = RadioTransport::spawn(Box::new(backend));

        let ack = transport
            .configure_send_and_receive(config(), vec![0xFF])
            .await
            .unwrap()
            .unwrap();
        assert!(ack.ack);
        assert_eq!(ack.data, vec![0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn timeout_yields_none_not_an_error() {
        let mut backend = MockBackend::default();
        backend.responses.push_back(None);
        let transport = RadioTransport::spawn(Box::new(backend));

        let ack = transport
            .configure_send_and_receive(config(), vec![0xFF])
            .await
            .unwrap();
        assert!(ack.is_none());
    }

    #[tokio::test]
    async fn queue_full_is_reported_as_backpressure() {
        // Fill the queue without a worker draining it by wiring a backend whose
        // bulk_read blocks forever... instead we directly exercise the
        // `try_send` path by saturating a tiny channel manually.
        let (tx, _rx) = std_mpsc::sync_channel::<Request>(0);
        // A capacity-0 channel rejects a send whenever nothing is currently
        // receiving, which is exactly the backpressure condition under test.
        let transport = RadioTransport { requests: tx };
        let err = transport
            .configure_send_and_receive(config(), vec![0xFF])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull));
    }
}
