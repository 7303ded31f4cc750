//! Link quality estimation, published as an observable `0.0..=1.0` score.
//!
//! Every exchange contributes one sample: `9 - retry_count + (ack ? 1 : 0)`,
//! averaged over the last 100 exchanges and divided by 10 so an always-ACKed,
//! always-first-try link reads `1.0`.

use tokio::sync::watch;

use crate::utils::SlidingMean;

const WINDOW: usize = 100;

/// Tracks link quality and exposes it as a [`watch`] observable.
pub struct LinkQuality {
    window: SlidingMean<WINDOW>,
    tx: watch::Sender<f64>,
    rx: watch::Receiver<f64>,
}

impl LinkQuality {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(0.0);
        LinkQuality {
            window: SlidingMean::new(),
            tx,
            rx,
        }
    }

    /// Records one exchange's outcome and republishes the running score.
    pub fn record(&mut self, ack: bool, retry_count: u8) {
        let sample = 9.0 - retry_count as f64 + if ack { 1.0 } else { 0.0 };
        self.window.push(sample);
        let score = (self.window.mean() / 10.0).clamp(0.0, 1.0);
        let _ = self.tx.send(score);
    }

    pub fn current(&self) -> f64 {
        *self.rx.borrow()
    }

    /// An observable that yields the current score immediately and every
    /// subsequent update.
    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.rx.clone()
    }
}

impl Default for LinkQuality {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perfect_link_scores_one() {
        let mut q = LinkQuality::new();
        for _ in 0..WINDOW {
            q.record(true, 0);
        }
        assert_eq!(q.current(), 1.0);
    }

    #[test]
    fn retries_lower_the_score() {
        let mut q = LinkQuality::new();
        for _ in 0..WINDOW {
            q.record(true, 0);
        }
        let baseline = q.current();
        for _ in 0..WINDOW {
            q.record(true, 5);
        }
        assert!(q.current() < baseline);
    }

    #[test]
    fn missed_acks_lower_the_score_more_than_retries() {
        let mut q = LinkQuality::new();
        for _ in 0..WINDOW {
            q.record(true, 0);
        }
        let acked = q.current();
        for _ in 0..WINDOW {
            q.record(false, 0);
        }
        assert!(q.current() < acked);
    }

    #[test]
    fn subscribers_see_updates() {
        let mut q = LinkQuality::new();
        let mut rx = q.subscribe();
        assert_eq!(*rx.borrow(), 0.0);
        q.record(true, 0);
        assert!(rx.has_changed().unwrap());
    }
}
