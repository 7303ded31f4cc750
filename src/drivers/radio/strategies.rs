//! Pluggable polling and resending strategies for the radio link worker
//!. These are the two points of the link worker a caller can swap out
//! without touching its main loop.

/// Decides how long to wait for an application packet before sending a
/// filler (null) packet to keep polling the half-duplex downlink.
///
/// A positive return value is a bounded wait in seconds; `0.0` means
/// "poll immediately, non-blocking"; a negative value means "wait
/// indefinitely for an application packet".
pub trait PollingStrategy: Send {
    fn next_wait(&mut self, last_rx: &[u8], last_tx: &[u8]) -> f64;
}

/// What the link worker should do after one send attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResendDecision {
    /// The attempt is considered delivered; move on to the next packet.
    Accept,
    /// Give up on the link entirely; the worker raises a fatal `LinkLost`.
    Stop,
    /// Re-send the same packet, waiting `delay_secs` first.
    Resend(f64),
}

/// Decides, after each send attempt, whether it was accepted, the link
/// should be dropped, or the packet should be retried.
pub trait ResendingStrategy: Send {
    fn decide(&mut self, ack: bool, last_tx: &[u8]) -> ResendDecision;
}

fn is_empty_exchange(last_rx: &[u8], last_tx: &[u8]) -> bool {
    last_rx.is_empty() && last_tx.is_empty()
}

/// Emits filler packets at 100 Hz once the link has been idle for 10
/// consecutive empty exchanges; otherwise polls immediately.
#[derive(Debug, Default)]
pub struct DefaultPolling {
    consecutive_empty: u32,
}

impl DefaultPolling {
    const IDLE_THRESHOLD: u32 = 10;
    const IDLE_WAIT_SECS: f64 = 0.01; // 100 Hz

    pub fn new() -> Self {
        Self::default()
    }
}

impl PollingStrategy for DefaultPolling {
    fn next_wait(&mut self, last_rx: &[u8], last_tx: &[u8]) -> f64 {
        if is_empty_exchange(last_rx, last_tx) {
            self.consecutive_empty += 1;
        } else {
            self.consecutive_empty = 0;
        }

        if self.consecutive_empty >= Self::IDLE_THRESHOLD {
            Self::IDLE_WAIT_SECS
        } else {
            0.0
        }
    }
}

/// Like [`DefaultPolling`], but the idle wait doubles each empty round (from
/// 10 ms up to a 250 ms cap) instead of jumping straight to a fixed rate, and
/// resets on any non-empty traffic.
#[derive(Debug)]
pub struct BackoffPolling {
    consecutive_empty: u32,
    current_wait: f64,
}

impl BackoffPolling {
    const IDLE_THRESHOLD: u32 = 10;
    const INITIAL_WAIT_SECS: f64 = 0.010;
    const MAX_WAIT_SECS: f64 = 0.250;

    pub fn new() -> Self {
        BackoffPolling {
            consecutive_empty: 0,
            current_wait: Self::INITIAL_WAIT_SECS,
        }
    }
}

impl Default for BackoffPolling {
    fn default() -> Self {
        Self::new()
    }
}

impl PollingStrategy for BackoffPolling {
    fn next_wait(&mut self, last_rx: &[u8], last_tx: &[u8]) -> f64 {
        if is_empty_exchange(last_rx, last_tx) {
            self.consecutive_empty += 1;
        } else {
            self.consecutive_empty = 0;
            self.current_wait = Self::INITIAL_WAIT_SECS;
            return 0.0;
        }

        if self.consecutive_empty < Self::IDLE_THRESHOLD {
            return 0.0;
        }

        let wait = self.current_wait;
        self.current_wait = (self.current_wait * 2.0).min(Self::MAX_WAIT_SECS);
        wait
    }
}

/// Never polls proactively: waits indefinitely for an application packet.
/// For systems where the host only ever receives responses to explicit
/// requests.
#[derive(Debug, Default)]
pub struct NoPolling;

impl PollingStrategy for NoPolling {
    fn next_wait(&mut self, _last_rx: &[u8], _last_tx: &[u8]) -> f64 {
        -1.0
    }
}

/// Allows 100 consecutive unacknowledged attempts before declaring the link
/// lost; retries immediately with no delay.
#[derive(Debug, Default)]
pub struct DefaultResending {
    consecutive_failures: u32,
}

impl DefaultResending {
    const MAX_FAILURES: u32 = 100;

    pub fn new() -> Self {
        Self::default()
    }
}

impl ResendingStrategy for DefaultResending {
    fn decide(&mut self, ack: bool, _last_tx: &[u8]) -> ResendDecision {
        if ack {
            self.consecutive_failures = 0;
            return ResendDecision::Accept;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= Self::MAX_FAILURES {
            ResendDecision::Stop
        } else {
            ResendDecision::Resend(0.0)
        }
    }
}

/// Allows 50 consecutive failures; the first six retries are immediate, the
/// seventh waits 10 ms, and every one after that is capped at 20 ms.
#[derive(Debug, Default)]
pub struct PatientResending {
    consecutive_failures: u32,
}

impl PatientResending {
    const MAX_FAILURES: u32 = 50;
    const IMMEDIATE_RETRIES: u32 = 6;

    pub fn new() -> Self {
        Self::default()
    }
}

impl ResendingStrategy for PatientResending {
    fn decide(&mut self, ack: bool, _last_tx: &[u8]) -> ResendDecision {
        if ack {
            self.consecutive_failures = 0;
            return ResendDecision::Accept;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= Self::MAX_FAILURES {
            return ResendDecision::Stop;
        }
        let delay = if self.consecutive_failures <= Self::IMMEDIATE_RETRIES {
            0.0
        } else if self.consecutive_failures == Self::IMMEDIATE_RETRIES + 1 {
            0.010
        } else {
            0.020
        };
        ResendDecision::Resend(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_polling_goes_idle_after_ten_empty_rounds() {
        let mut s = DefaultPolling::new();
        for _ in 0..9 {
            assert_eq!(s.next_wait(&[], &[]), 0.0);
        }
        assert_eq!(s.next_wait(&[], &[]), DefaultPolling::IDLE_WAIT_SECS);
        // non-empty traffic resets it
        assert_eq!(s.next_wait(&[1], &[]), 0.0);
    }

    #[test]
    fn backoff_polling_doubles_up_to_the_cap() {
        let mut s = BackoffPolling::new();
        for _ in 0..10 {
            s.next_wait(&[], &[]);
        }
        let first = s.next_wait(&[], &[]);
        let second = s.next_wait(&[], &[]);
        assert!(second > first);
        for _ in 0..20 {
            assert!(s.next_wait(&[], &[]) <= BackoffPolling::MAX_WAIT_SECS);
        }
    }

    #[test]
    fn no_polling_always_waits_indefinitely() {
        let mut s = NoPolling;
        assert!(s.next_wait(&[], &[]) < 0.0);
    }

    #[test]
    fn default_resending_stops_after_100_failures() {
        let mut s = DefaultResending::new();
        for _ in 0..99 {
            assert_eq!(s.decide(false, &[]), ResendDecision::Resend(0.0));
        }
        assert_eq!(s.decide(false, &[]), ResendDecision::Stop);
    }

    #[test]
    fn default_resending_accept_resets_counter() {
        let mut s = DefaultResending::new();
        s.decide(false, &[]);
        s.decide(false, &[]);
        assert_eq!(s.decide(true, &[]), ResendDecision::Accept);
        assert_eq!(s.decide(false, &[]), ResendDecision::Resend(0.0));
    }

    #[test]
    fn patient_resending_escalates_delay() {
        let mut s = PatientResending::new();
        for _ in 0..6 {
            assert_eq!(s.decide(false, &[]), ResendDecision::Resend(0.0));
        }
        assert_eq!(s.decide(false, &[]), ResendDecision::Resend(0.010));
        assert_eq!(s.decide(false, &[]), ResendDecision::Resend(0.020));
    }
}
