//! Port-routed packet dispatch: the fan-out point between the receive pump
//! and every subsystem subscribed to inbound traffic.
//!
//! Two composable primitives are built on top of the handler table:
//! [`Dispatcher::packet_queue`], a subscription that forwards every packet on
//! a port (or every port, if `None`) into a bounded channel, and
//! [`Dispatcher::wait_for_next_packet`], a one-shot matcher used by
//! [`crate::crtp::device::Device::run_command`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use super::packet::{Packet, Port};

type SyncHandler = Box<dyn Fn(&Packet) + Send + Sync>;

struct Subscription {
    id: u64,
    sender: mpsc::Sender<Packet>,
}

struct OneShot {
    id: u64,
    predicate: Box<dyn Fn(&Packet) -> bool + Send + Sync>,
    sender: Option<tokio::sync::oneshot::Sender<Packet>>,
}

#[derive(Default)]
struct PortHandlers {
    subscriptions: Vec<Subscription>,
    one_shots: Vec<OneShot>,
    sync: Vec<SyncHandler>,
}

/// Routes inbound packets to registered subscribers by port.
///
/// Handlers registered for a specific port run before wildcard (port = `None`)
/// handlers.
pub struct Dispatcher {
    by_port: Mutex<HashMap<u8, PortHandlers>>,
    wildcard: Mutex<PortHandlers>,
    next_id: AtomicU64,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher {
            by_port: Mutex::new(HashMap::new()),
            wildcard: Mutex::new(PortHandlers::default()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Delivers `packet` to every matching subscription, one-shot matcher,
    /// and synchronous handler, port-specific handlers first, then wildcard.
    pub async fn dispatch(&self, packet: Packet) {
        let port = packet.port().as_u8();

        {
            let mut by_port = self.by_port.lock().await;
            if let Some(handlers) = by_port.get_mut(&port) {
                Self::deliver(handlers, &packet).await;
            }
        }
        {
            let mut wildcard = self.wildcard.lock().await;
            Self::deliver(&mut wildcard, &packet).await;
        }
    }

    async fn deliver(handlers: &mut PortHandlers, packet: &Packet) {
        for h in &handlers.sync {
            h(packet);
        }
        // One-shots are matched and removed as they fire; only the first
        // matching one-shot per dispatch consumes the packet, preserving the
        // FIFO semantics `run_command` depends on.
        if let Some(idx) = handlers
            .one_shots
            .iter()
            .position(|os| (os.predicate)(packet))
        {
            let os = handlers.one_shots.remove(idx);
            if let Some(sender) = os.sender {
                let _ = sender.send(packet.clone());
            }
        }
        handlers.subscriptions.retain(|sub| {
            // A full or closed channel drops the newest packet rather than
            // blocking the dispatcher.
            sub.sender.try_send(packet.clone()).is_ok() || !sub.sender.is_closed()
        });
    }

    /// Registers an inbound stream filtered by `port` (or every port, if
    /// `None`) with the given channel capacity. Dropping the returned
    /// [`PacketQueue`] removes the subscription.
    pub async fn packet_queue(self: &Arc<Self>, port: Option<Port>, capacity: usize) -> PacketQueue {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.next_id();
        let sub = Subscription { id, sender: tx };
        match port {
            Some(p) => {
                let mut by_port = self.by_port.lock().await;
                by_port.entry(p.as_u8()).or_default().subscriptions.push(sub);
            }
            None => {
                self.wildcard.lock().await.subscriptions.push(sub);
            }
        }
        PacketQueue {
            dispatcher: Arc::clone(self),
            port,
            id,
            receiver: rx,
        }
    }

    /// Registers a one-shot handler that resolves with the first packet on
    /// `port` for which `predicate` returns `true`. The handler is removed
    /// when the returned future is dropped, matched, or explicitly cancelled,
    /// regardless of outcome.
    pub async fn wait_for_next_packet(
        self: &Arc<Self>,
        port: Port,
        predicate: impl Fn(&Packet) -> bool + Send + Sync + 'static,
    ) -> OneShotMatcher {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let id = self.next_id();
        {
            let mut by_port = self.by_port.lock().await;
            by_port
                .entry(port.as_u8())
                .or_default()
                .one_shots
                .push(OneShot {
                    id,
                    predicate: Box::new(predicate),
                    sender: Some(tx),
                });
        }
        OneShotMatcher {
            dispatcher: Arc::clone(self),
            port: port.as_u8(),
            id,
            receiver: Some(rx),
        }
    }

    async fn remove_subscription(&self, port: Option<Port>, id: u64) {
        match port {
            Some(p) => {
                if let Some(handlers) = self.by_port.lock().await.get_mut(&p.as_u8()) {
                    handlers.subscriptions.retain(|s| s.id != id);
                }
            }
            None => {
                self.wildcard
                    .lock()
                    .await
                    .subscriptions
                    .retain(|s| s.id != id);
            }
        }
    }

    async fn remove_one_shot(&self, port: u8, id: u64) {
        if let Some(handlers) = self.by_port.lock().await.get_mut(&port) {
            handlers.one_shots.retain(|os| os.id != id);
        }
    }
}

/// A live subscription to packets on a port (or every port). Dropping this
/// unregisters the subscription from its [`Dispatcher`].
pub struct PacketQueue {
    dispatcher: Arc<Dispatcher>,
    port: Option<Port>,
    id: u64,
    receiver: mpsc::Receiver<Packet>,
}

impl PacketQueue {
    pub async fn recv(&mut self) -> Option<Packet> {
        self.receiver.recv().await
    }
}

impl Drop for PacketQueue {
    fn drop(&mut self) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let port = self.port;
        let id = self.id;
        tokio::spawn(async move {
            dispatcher.remove_subscription(port, id).await;
        });
    }
}

/// A pending one-shot match registered via [`Dispatcher::wait_for_next_packet`].
pub struct OneShotMatcher {
    dispatcher: Arc<Dispatcher>,
    port: u8,
    id: u64,
    receiver: Option<tokio::sync::oneshot::Receiver<Packet>>,
}

impl OneShotMatcher {
    /// Waits for the matching packet. Returns `None` if the matcher was
    /// dropped/cancelled before a match arrived.
    pub async fn wait(&mut self) -> Option<Packet> {
        match self.receiver.as_mut() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }
}

impl Drop for OneShotMatcher {
    fn drop(&mut self) {
        let dispatcher = Arc::clone(&self.dispatcher);
        let port = self.port;
        let id = self.id;
        tokio::spawn(async move {
            dispatcher.remove_one_shot(port, id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn port_specific_handlers_run_before_wildcard() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut specific = dispatcher
            .packet_queue(Some(Port::Memory), 8)
            .await;
        let mut wildcard = dispatcher.packet_queue(None, 8).await;

        let pkt = Packet::new(Port::Memory, 0, vec![1]).unwrap();
        dispatcher.dispatch(pkt.clone()).await;

        assert_eq!(specific.recv().await, Some(pkt.clone()));
        assert_eq!(wildcard.recv().await, Some(pkt));
    }

    #[tokio::test]
    async fn wait_for_next_packet_matches_predicate() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut matcher = dispatcher
            .wait_for_next_packet(Port::LinkControl, |p| p.data().first() == Some(&0x01))
            .await;

        dispatcher
            .dispatch(Packet::new(Port::LinkControl, 0, vec![0x00]).unwrap())
            .await;
        dispatcher
            .dispatch(Packet::new(Port::LinkControl, 0, vec![0x01, 0xFF]).unwrap())
            .await;

        let got = matcher.wait().await.unwrap();
        assert_eq!(got.data(), &[0x01, 0xFF]);
    }

    #[tokio::test]
    async fn dropping_a_queue_unsubscribes_it() {
        let dispatcher = Arc::new(Dispatcher::new());
        {
            let _q = dispatcher.packet_queue(Some(Port::Console), 1).await;
        }
        // give the drop's spawned cleanup a chance to run
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;

        let by_port = dispatcher.by_port.lock().await;
        assert!(by_port
            .get(&Port::Console.as_u8())
            .map(|h| h.subscriptions.is_empty())
            .unwrap_or(true));
    }
}
