//! The radio link worker's main loop: turns an application-level
//! queue of outbound [`Packet`]s and a physical [`RadioTransport`] into a
//! send-one-wait-for-ack-resend-on-loss cycle, with safe-link header bits,
//! link-quality sampling, and a pluggable idle-polling/resending policy.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::addressing::RadioConfig;
use crate::crtp::packet::Packet;
use crate::error::{Error, Result};

use super::quality::LinkQuality;
use super::safelink::SafeLink;
use super::strategies::{PollingStrategy, ResendDecision, ResendingStrategy};
use super::transport::RadioTransport;

/// Runs the link worker loop until `cancel` fires or the resending strategy
/// gives up, in which case it returns [`Error::LinkLost`].
///
/// `outbound` carries application packets queued by [`super::RadioLinkDriver::send_packet`];
/// `inbound` delivers decoded, non-null packets back to
/// [`super::RadioLinkDriver::receive_packet`].
///
/// `resending` is a single long-lived strategy instance, consulted after
/// every transport round-trip — including rounds that only sent a filler
/// (null) packet — exactly as upstream's resending strategy is a single
/// callable threaded through the whole worker rather than recreated per
/// packet.
pub async fn run(
    transport: Arc<RadioTransport>,
    safelink: Arc<SafeLink>,
    config: RadioConfig,
    mut polling: Box<dyn PollingStrategy>,
    mut resending: Box<dyn ResendingStrategy>,
    quality: Arc<Mutex<LinkQuality>>,
    mut outbound: mpsc::Receiver<Packet>,
    inbound: mpsc::Sender<Packet>,
    cancel: CancellationToken,
) -> Result<()> {
    if safelink.is_enabled() {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = safelink.wait_acquired() => {}
        }
    }

    // `None` stands for the null (filler) packet, mirroring upstream's
    // `outbound_packet is null_packet` identity check without needing a
    // sentinel `Packet` value.
    let mut outbound_packet: Option<Packet> = None;

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let to_send = outbound_packet.clone().unwrap_or_else(Packet::null);
        let header_bits = if safelink.is_enabled() {
            Some(safelink.header_bits().await)
        } else {
            None
        };
        let encoded = to_send.encode(header_bits);

        let ack = transport
            .configure_send_and_receive(config, encoded.clone())
            .await?;

        let Some(ack) = ack else {
            // Transport timeout/error: resend immediately.
            continue;
        };

        if safelink.is_enabled() && safelink.is_acquired() {
            safelink.update_from_ack(ack.ack, &ack.data).await;
        }

        quality.lock().await.record(ack.ack, ack.retry_count);

        match resending.decide(ack.ack, &encoded) {
            ResendDecision::Stop => {
                return Err(Error::LinkLost(
                    "resending strategy exhausted its attempts".into(),
                ));
            }
            ResendDecision::Resend(delay) => {
                if outbound_packet.is_none() {
                    // Use the wait to pick up a real packet if one arrives,
                    // rather than blindly re-sending the filler.
                    outbound_packet = match wait_for_application_packet(
                        &mut outbound,
                        delay,
                        &cancel,
                    )
                    .await
                    {
                        WaitOutcome::Packet(packet) => Some(packet),
                        WaitOutcome::Cancelled => return Ok(()),
                        WaitOutcome::Closed => {
                            return Err(Error::LinkLost("outbound queue closed".into()))
                        }
                        WaitOutcome::TimedOut => None,
                    };
                } else if delay > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
                continue;
            }
            ResendDecision::Accept => {}
        }

        if !ack.data.is_empty() {
            if let Ok((packet, _)) = Packet::decode(&ack.data) {
                if !packet.is_null() {
                    let _ = inbound.send(packet).await;
                }
            }
        }

        let wait = polling.next_wait(&ack.data, &encoded);
        outbound_packet = if wait > 0.0 {
            match wait_for_application_packet(&mut outbound, wait, &cancel).await {
                WaitOutcome::Packet(packet) => Some(packet),
                WaitOutcome::Cancelled => return Ok(()),
                WaitOutcome::Closed => {
                    return Err(Error::LinkLost("outbound queue closed".into()))
                }
                WaitOutcome::TimedOut => None,
            }
        } else if wait < 0.0 {
            match wait_for_application_packet(&mut outbound, -1.0, &cancel).await {
                WaitOutcome::Packet(packet) => Some(packet),
                WaitOutcome::Cancelled => return Ok(()),
                WaitOutcome::Closed => {
                    return Err(Error::LinkLost("outbound queue closed".into()))
                }
                WaitOutcome::TimedOut => None,
            }
        } else {
            outbound.try_recv().ok()
        };
    }
}

enum WaitOutcome {
    Packet(Packet),
    TimedOut,
    Closed,
    Cancelled,
}

/// Waits for either an application packet to arrive or `wait_secs` to
/// elapse, whichever comes first — so a long idle-polling wait doesn't delay
/// a newly queued application packet. `wait_secs < 0.0` waits indefinitely.
async fn wait_for_application_packet(
    outbound: &mut mpsc::Receiver<Packet>,
    wait_secs: f64,
    cancel: &CancellationToken,
) -> WaitOutcome {
    if wait_secs < 0.0 {
        tokio::select! {
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            received = outbound.recv() => match received {
                Some(p) => WaitOutcome::Packet(p),
                None => WaitOutcome::Closed,
            },
        }
    } else {
        tokio::select! {
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            _ = tokio::time::sleep(Duration::from_secs_f64(wait_secs)) => WaitOutcome::TimedOut,
            received = outbound.recv() => match received {
                Some(p) => WaitOutcome::Packet(p),
                None => WaitOutcome::Closed,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::{DataRate, RadioAddress};
    use crate::crtp::packet::Port;
    use crate::drivers::radio::backend::mock::MockBackend;
    use crate::drivers::radio::strategies::{DefaultPolling, DefaultResending};

    fn config() -> RadioConfig {
        RadioConfig::new(DataRate::Rate2M, 80, RadioAddress::DEFAULT).unwrap()
    }

    #[tokio::test]
    async fn delivers_a_decoded_response_to_the_inbound_channel() {
        let mut backend = MockBackend::default();
        let response = Packet::new(Port::Console, 0, vec![0x01]).unwrap();
        backend.responses.push_back(Some(response.encode(None)));
        // enough filler responses to keep the loop fed until we cancel
        for _ in 0..16 {
            backend.responses.push_back(Some(vec![0x01]));
        }
        let transport = Arc::new(RadioTransport::spawn(Box::new(backend)));
        let safelink = Arc::new(SafeLink::new());
        let quality = Arc::new(Mutex::new(LinkQuality::new()));
        let (_out_tx, out_rx) = mpsc::channel(4);
        let (in_tx, mut in_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let handle = tokio::spawn(run(
            transport,
            safelink,
            config(),
            Box::new(DefaultPolling::new()),
            Box::new(DefaultResending::new()),
            quality,
            out_rx,
            in_tx,
            cancel_clone,
        ));

        let received = tokio::time::timeout(Duration::from_secs(1), in_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.port(), &Port::Console);
        assert_eq!(received.data(), &[]);

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn link_lost_once_resending_strategy_gives_up() {
        let mut backend = MockBackend::default();
        backend.responses.push_back(None); // first attempt times out
        backend.responses.push_back(Some(vec![0x00])); // second: status byte with ACK bit clear
        let transport = Arc::new(RadioTransport::spawn(Box::new(backend)));
        let safelink = Arc::new(SafeLink::new());
        let quality = Arc::new(Mutex::new(LinkQuality::new()));
        let (out_tx, out_rx) = mpsc::channel(4);
        let (in_tx, _in_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        out_tx
            .send(Packet::new(Port::Commander, 0, vec![0xAA]).unwrap())
            .await
            .unwrap();

        // a resending strategy that gives up after its very first failure
        struct GivesUpImmediately;
        impl ResendingStrategy for GivesUpImmediately {
            fn decide(&mut self, ack: bool, _last_tx: &[u8]) -> ResendDecision {
                if ack {
                    ResendDecision::Accept
                } else {
                    ResendDecision::Stop
                }
            }
        }

        let result = run(
            transport,
            safelink,
            config(),
            Box::new(DefaultPolling::new()),
            Box::new(GivesUpImmediately),
            quality,
            out_rx,
            in_tx,
            cancel,
        )
        .await;

        assert!(matches!(result, Err(Error::LinkLost(_))));
    }
}
