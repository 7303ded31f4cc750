//! The connection-lifecycle layer: one driver, one dispatcher, a receive
//! pump, and the `run_command` request/response primitive.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::drivers::Driver;
use crate::error::{Error, Result};

use super::dispatcher::Dispatcher;
use super::packet::{Packet, Port};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);
const DEFAULT_ATTEMPTS: u32 = 3;

/// A logical CRTP connection: a driver, its dispatcher, and the daemon tasks
/// that keep inbound packets flowing to it.
///
/// Dropping a `Device` cancels its receive pump and any other daemon task
/// registered against its [`CancellationToken`]. Back-references into this
/// struct (safe-link supervisors, log/memory subsystems) are always
/// non-owning, so nothing keeps a `Device` alive past its last `Arc`.
pub struct Device {
    driver: Arc<Driver>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
}

impl Device {
    /// Starts the receive pump: a task that loops `driver.receive_packet()`
    /// → `dispatcher.dispatch(packet)` until the driver errors or `close` is
    /// called.
    pub fn open(driver: Driver) -> Self {
        let driver = Arc::new(driver);
        let dispatcher = Arc::new(Dispatcher::new());
        let cancel = CancellationToken::new();

        let pump_driver = Arc::clone(&driver);
        let pump_dispatcher = Arc::clone(&dispatcher);
        let pump_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => return,
                    received = pump_driver.receive_packet() => {
                        match received {
                            Ok(packet) => pump_dispatcher.dispatch(packet).await,
                            Err(e) => {
                                log::warn!("receive pump stopping: {}", e);
                                return;
                            }
                        }
                    }
                }
            }
        });

        Device {
            driver,
            dispatcher,
            cancel,
        }
    }

    /// Cancels the receive pump and any other daemon task sharing this
    /// device's cancellation token. The driver itself is dropped along with
    /// this `Device`, closing its own context.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// This device's cancellation token, so subsystems (logging, memory,
    /// bootloader) can register their own daemon tasks to be torn down
    /// together with the receive pump.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn driver(&self) -> Arc<Driver> {
        Arc::clone(&self.driver)
    }

    /// The request/response primitive every subsystem builds on.
    ///
    /// Registers a one-shot matcher before the first send so that a reply
    /// arriving between attempts is never missed; the same matcher persists
    /// across every attempt of this single `run_command` call.
    pub async fn run_command(
        &self,
        port: Port,
        channel: u8,
        command: Option<Vec<u8>>,
        data: Option<Vec<u8>>,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Vec<u8>> {
        let prefix = command.clone().unwrap_or_default();
        let mut payload = prefix.clone();
        if let Some(data) = &data {
            payload.extend_from_slice(data);
        }
        let packet = Packet::new(port, channel, payload)?;

        let prefix_for_match = prefix.clone();
        let mut matcher = self
            .dispatcher
            .wait_for_next_packet(port, move |p| {
                p.channel() == channel && p.data().starts_with(&prefix_for_match)
            })
            .await;

        for _ in 0..attempts {
            self.driver.send_packet(&packet).await?;
            match tokio::time::timeout(timeout, matcher.wait()).await {
                Ok(Some(response)) => {
                    return Ok(response.into_data()[prefix.len()..].to_vec());
                }
                Ok(None) => return Err(Error::LinkLost("dispatcher matcher was cancelled".into())),
                Err(_) => continue, // this attempt's wait timed out, try again
            }
        }
        Err(Error::Timeout)
    }

    /// [`run_command`](Self::run_command) with the documented defaults:
    /// `timeout=200ms`, `attempts=3`.
    pub async fn run_command_default(
        &self,
        port: Port,
        channel: u8,
        command: Option<Vec<u8>>,
        data: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        self.run_command(port, channel, command, data, DEFAULT_TIMEOUT, DEFAULT_ATTEMPTS)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::{UsbDriver, UsbHandle};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// A [`UsbHandle`] whose worker thread only acts in response to an
    /// explicit send, so `run_command`'s attempt-by-attempt retry behavior
    /// can be exercised deterministically.
    struct ScriptedHandle {
        responses: StdMutex<VecDeque<Vec<u8>>>,
    }

    impl UsbHandle for ScriptedHandle {
        fn bulk_write(&mut self, _data: &[u8], _timeout: Duration) -> std::io::Result<()> {
            Ok(())
        }

        fn bulk_read(&mut self, _timeout: Duration) -> std::io::Result<Vec<u8>> {
            Ok(self.responses.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn run_command_retries_until_the_matching_response_arrives() {
        let matching = Packet::new(Port::LinkControl, 1, vec![0x00, 0xAA])
            .unwrap()
            .encode(None);
        let handle = ScriptedHandle {
            responses: StdMutex::new(VecDeque::from([
                Vec::new(), // first attempt: dropped, no response at all
                matching,
            ])),
        };

        let driver = Driver::Usb(UsbDriver::spawn(Box::new(handle)));
        let device = Device::open(driver);

        let response = device
            .run_command(
                Port::LinkControl,
                1,
                Some(vec![0x00]),
                None,
                Duration::from_millis(50),
                3,
            )
            .await
            .unwrap();
        assert_eq!(response, vec![0xAA]);
    }

    #[tokio::test]
    async fn run_command_times_out_once_attempts_are_exhausted() {
        let handle = ScriptedHandle {
            responses: StdMutex::new(VecDeque::new()),
        };
        let driver = Driver::Usb(UsbDriver::spawn(Box::new(handle)));
        let device = Device::open(driver);

        let result = device
            .run_command(
                Port::LinkControl,
                1,
                Some(vec![0x00]),
                None,
                Duration::from_millis(20),
                2,
            )
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
