//! Address-less broadcast: a single packet shouted over the air to every
//! Crazyflie listening on a channel, with no peer address and no reply
//! expected.
//!
//! A [`Broadcaster`] talks straight to a [`RadioTransport`], sharing the same
//! arbiter-managed dongle a [`super::drivers::radio::RadioLinkDriver`] would,
//! but it never goes through [`crate::crtp::Dispatcher`] or [`crate::crtp::Device`] —
//! there is no per-connection worker, no safe-link, and nothing waiting on a
//! response, since a broadcast by definition has no single peer to answer it.

use std::sync::Arc;

use crate::addressing::{DataRate, RadioAddress, RadioConfig};
use crate::crtp::packet::{Packet, Port};
use crate::drivers::radio::arbiter;
use crate::drivers::radio::transport::RadioTransport;
use crate::drivers::Uri;
use crate::error::{Error, Result};

const DEFAULT_INDEX: u8 = 0;
const DEFAULT_CHANNEL: u8 = 2;

/// Broadcasts a single [`Packet`] or raw payload to every receiver tuned to a
/// [`RadioConfig`], bypassing the dispatcher/device stack entirely.
pub struct Broadcaster {
    index: u8,
    config: RadioConfig,
    transport: Arc<RadioTransport>,
}

impl Broadcaster {
    /// The address every Crazyflie accepts broadcasts on regardless of its
    /// own unicast address.
    pub const DEFAULT_ADDRESS: RadioAddress = RadioAddress::new([0xFF, 0xE7, 0xE7, 0xE7, 0xE7]);

    /// Opens a `broadcast://<index>/<channel>/<rate>/<address>` URI against
    /// the process-wide backend factory (all segments optional, defaulting
    /// to index 0, channel 2, rate 2M, [`Self::DEFAULT_ADDRESS`]), sharing
    /// the same arbiter-tracked transport a `radio://` driver for the same
    /// index would use.
    pub async fn open(uri: &Uri) -> Result<Self> {
        let backend_factory = crate::drivers::radio::backend_factory().ok_or(Error::NotConfigured)?;
        let segments = uri.segments();

        let index: u8 = match segments.first() {
            Some(s) => s.parse().map_err(|_| Error::WrongUri {
                uri: uri.path.clone(),
                reason: format!("{:?} is not a valid radio index", s),
            })?,
            None => DEFAULT_INDEX,
        };
        let channel: u8 = match segments.get(1) {
            Some(s) => s.parse().map_err(|_| Error::WrongUri {
                uri: uri.path.clone(),
                reason: format!("{:?} is not a valid channel", s),
            })?,
            None => DEFAULT_CHANNEL,
        };
        let rate: DataRate = match segments.get(2) {
            Some(s) => s.parse().map_err(|_: Error| Error::WrongUri {
                uri: uri.path.clone(),
                reason: format!("{:?} is not a valid data rate", s),
            })?,
            None => DataRate::Rate2M,
        };
        let address: RadioAddress = match segments.get(3) {
            Some(s) => s.parse().map_err(|_: Error| Error::WrongUri {
                uri: uri.path.clone(),
                reason: format!("{:?} is not a valid address", s),
            })?,
            None => Self::DEFAULT_ADDRESS,
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

        Ok(Broadcaster { index, config, transport })
    }

    /// Wraps an already-acquired transport directly, for callers (and tests)
    /// that don't want to go through a URI and the process-wide factory.
    pub fn with_transport(index: u8, config: RadioConfig, transport: Arc<RadioTransport>) -> Self {
        Broadcaster { index, config, transport }
    }

    pub fn config(&self) -> RadioConfig {
        self.config
    }

    /// Builds a CRTP packet for `port`/`channel`/`data` and broadcasts it.
    /// There is no peer to ACK it meaningfully, so the dongle's
    /// acknowledgment, if any, is not reported back.
    pub async fn send_packet(&self, port: Port, channel: u8, data: impl Into<Vec<u8>>) -> Result<()> {
        let packet = Packet::new(port, channel, data)?;
        self.send_bytes(packet.encode(None)).await
    }

    /// Sends raw bytes with no CRTP framing applied, for firmware that reads
    /// the broadcast payload itself (e.g. the multi-Crazyflie swarm sync
    /// packet), matching how `send_packet` and `send_bytes` are two distinct
    /// entry points onto the same transport call.
    pub async fn send_bytes(&self, data: Vec<u8>) -> Result<()> {
        self.transport.configure_send_and_receive(self.config, data).await?;
        Ok(())
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        arbiter::release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::radio::backend::mock::MockBackend;

    fn config() -> RadioConfig {
        RadioConfig::new(DataRate::Rate2M, 80, Broadcaster::DEFAULT_ADDRESS).unwrap()
    }

    fn broadcaster_over_mock() -> Broadcaster {
        let transport = Arc::new(RadioTransport::spawn(Box::new(MockBackend::default())));
        Broadcaster::with_transport(250, config(), transport)
    }

    #[test]
    fn default_address_is_the_all_crazyflie_broadcast_address() {
        assert_eq!(Broadcaster::DEFAULT_ADDRESS.as_bytes(), &[0xFF, 0xE7, 0xE7, 0xE7, 0xE7]);
    }

    #[tokio::test]
    async fn send_packet_encodes_and_broadcasts_the_frame() {
        let broadcaster = broadcaster_over_mock();
        broadcaster
            .send_packet(Port::Commander, 0, vec![1, 2, 3])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn send_bytes_goes_straight_to_the_transport_unframed() {
        let broadcaster = broadcaster_over_mock();
        broadcaster.send_bytes(vec![0xAA, 0xBB]).await.unwrap();
    }
}
