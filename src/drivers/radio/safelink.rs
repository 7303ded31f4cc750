//! The safe-link sliding-window in-order-delivery protocol layered on top of
//! the raw acknowledged radio link.
//!
//! Two sequence bits are carried in every outbound packet's header (bits 3-2):
//! an uplink bit (`0` or `8`) and a downlink bit (`0` or `4`). A
//! supervisor task drives the handshake whenever the link is `enabled` but
//! not yet `acquired`; the main link-worker loop maintains the steady-state
//! toggling once acquired.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Header byte for the safe-link handshake-init packet.
pub const INIT_HEADER: u8 = 0xFF;
/// Payload of the safe-link handshake-init packet, echoed verbatim by ready
/// firmware.
pub const INIT_PAYLOAD: [u8; 2] = [0x05, 0x01];

const MAX_HANDSHAKE_ATTEMPTS: u32 = 10;
const HANDSHAKE_BACKOFF: Duration = Duration::from_millis(250);
/// How long the link worker waits for `acquired` before giving up and
/// proceeding without safe-link for this round.
pub const ACQUIRE_WAIT_TIMEOUT: Duration = Duration::from_secs(2);
/// Sleep observed after a reboot notification before re-enabling.
pub const REBOOT_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy)]
struct SeqBits {
    up: u8,
    down: u8,
}

impl SeqBits {
    const RESET: SeqBits = SeqBits { up: 8, down: 4 };
    const INITIAL: SeqBits = SeqBits { up: 0, down: 0 };
}

/// Shared safe-link state for one logical connection.
pub struct SafeLink {
    enabled: AtomicBool,
    bits: Mutex<SeqBits>,
    acquired_tx: watch::Sender<bool>,
    acquired_rx: watch::Receiver<bool>,
}

impl SafeLink {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        SafeLink {
            enabled: AtomicBool::new(false),
            bits: Mutex::new(SeqBits::RESET),
            acquired_tx: tx,
            acquired_rx: rx,
        }
    }

    /// Sets `enabled := true`; the caller is responsible for (re-)triggering
    /// the supervisor.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn is_acquired(&self) -> bool {
        *self.acquired_rx.borrow()
    }

    /// An observable that yields the current value immediately and every
    /// subsequent distinct change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.acquired_rx.clone()
    }

    /// Waits (up to [`ACQUIRE_WAIT_TIMEOUT`]) for the link to become
    /// acquired, returning whether it did.
    pub async fn wait_acquired(&self) -> bool {
        if self.is_acquired() {
            return true;
        }
        let mut rx = self.subscribe();
        tokio::time::timeout(ACQUIRE_WAIT_TIMEOUT, async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
            && self.is_acquired()
    }

    /// Clears `acquired` (drone reboot notification) and resets `(up, down)`
    /// to their post-loss defaults.
    pub async fn clear_acquired(&self) {
        *self.bits.lock().await = SeqBits::RESET;
        let _ = self.acquired_tx.send(false);
    }

    /// The current header bits (bits 3-2, already positioned) to OR into the
    /// next outbound packet.
    pub async fn header_bits(&self) -> u8 {
        if !self.is_acquired() {
            return 0b1100;
        }
        let bits = *self.bits.lock().await;
        bits.up | bits.down
    }

    /// Updates `(up, down)` from a response's ack flag and payload. A
    /// non-acknowledged response leaves the sequence bits untouched — only
    /// an acknowledged exchange advances them, otherwise a (re)transmission
    /// after a loss would carry a flipped `up` bit and never match what the
    /// peer is still waiting to see, defeating the retransmission dedup.
    /// Must only be called once safe-link is acquired.
    pub async fn update_from_ack(&self, ack: bool, response_data: &[u8]) {
        if !ack {
            return;
        }
        let mut bits = self.bits.lock().await;
        bits.up = 8 - bits.up;
        if let Some(&first) = response_data.first() {
            if (first & 0b100) == bits.down {
                bits.down = 4 - bits.down;
            }
        }
    }

    /// Drives the handshake supervisor: while `enabled && !acquired`, sends
    /// up to [`MAX_HANDSHAKE_ATTEMPTS`] init packets through `send_init`,
    /// looking for an echoed payload; on success marks the link acquired and
    /// resets `(up, down)` to `(0, 0)`; on exhaustion, backs off and retries.
    /// Runs until `cancel` fires.
    pub async fn run_supervisor<F, Fut>(&self, mut send_init: F, cancel: CancellationToken)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Option<Vec<u8>>>>,
    {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            if !self.is_enabled() || self.is_acquired() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                }
            }

            let mut acquired = false;
            for _ in 0..MAX_HANDSHAKE_ATTEMPTS {
                if cancel.is_cancelled() {
                    return;
                }
                match send_init().await {
                    Ok(Some(ref data)) if data.as_slice() == INIT_PAYLOAD => {
                        acquired = true;
                        break;
                    }
                    _ => continue,
                }
            }

            if acquired {
                *self.bits.lock().await = SeqBits::INITIAL;
                let _ = self.acquired_tx.send(true);
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(HANDSHAKE_BACKOFF) => {}
                }
            }
        }
    }
}

impl Default for SafeLink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[tokio::test]
    async fn handshake_acquires_on_third_echoed_attempt() {
        let link = Arc::new(SafeLink::new());
        link.enable();

        let attempts = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let link2 = Arc::clone(&link);
        let attempts2 = Arc::clone(&attempts);
        let supervisor = tokio::spawn(async move {
            link2
                .run_supervisor(
                    move || {
                        let n = attempts2.fetch_add(1, Ordering::SeqCst);
                        async move {
                            if n < 2 {
                                Ok(None)
                            } else {
                                Ok(Some(INIT_PAYLOAD.to_vec()))
                            }
                        }
                    },
                    cancel_clone,
                )
                .await;
        });

        assert!(link.wait_acquired().await);
        assert!(link.is_acquired());
        cancel.cancel();
        let _ = supervisor.await;
    }

    #[tokio::test]
    async fn steady_state_toggles_up_every_round() {
        let link = SafeLink::new();
        *link.bits.lock().await = SeqBits::INITIAL;
        let _ = link.acquired_tx.send(true);

        let first = link.header_bits().await;
        link.update_from_ack(true, &[0x00]).await;
        let second = link.header_bits().await;
        assert_ne!(first & 0b1000, second & 0b1000);
    }

    #[tokio::test]
    async fn down_bit_toggles_only_when_ack_echoes_it() {
        let link = SafeLink::new();
        *link.bits.lock().await = SeqBits { up: 0, down: 0 };
        let _ = link.acquired_tx.send(true);

        // response bit2 == 0 == current down -> toggles to 4
        link.update_from_ack(true, &[0b000]).await;
        assert_eq!(link.bits.lock().await.down, 4);

        // response bit2 == 0, current down == 4 -> no match, stays 4
        link.update_from_ack(true, &[0b000]).await;
        assert_eq!(link.bits.lock().await.down, 4);
    }

    #[tokio::test]
    async fn unacknowledged_response_leaves_sequence_bits_untouched() {
        let link = SafeLink::new();
        *link.bits.lock().await = SeqBits::INITIAL;
        let _ = link.acquired_tx.send(true);

        let before = link.header_bits().await;
        link.update_from_ack(false, &[0x00]).await;
        let after = link.header_bits().await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn clear_acquired_resets_to_defaults() {
        let link = SafeLink::new();
        *link.bits.lock().await = SeqBits::INITIAL;
        let _ = link.acquired_tx.send(true);

        link.clear_acquired().await;
        assert!(!link.is_acquired());
        let bits = *link.bits.lock().await;
        assert_eq!(bits.up, 8);
        assert_eq!(bits.down, 4);
    }
}
