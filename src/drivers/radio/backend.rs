//! The synchronous USB backend a [`super::transport::RadioTransport`] drives.
//!
//! Actual USB device enumeration and raw bulk transfers are an external
//! collaborator: this crate only defines the narrow
//! synchronous interface the transport needs, so host binaries can plug in
//! `rusb`, `nusb`, or a mock without this crate caring which.

/// A synchronous handle to one physical Crazyradio-compatible dongle.
///
/// All methods block for up to the given timeout and are intended to be
/// called only from the dedicated blocking worker thread per radio — the
/// dongle's host USB stack is synchronous, so there is no point pretending
/// otherwise above this layer.
pub trait UsbBackend: Send {
    /// Issues the dongle's channel/address/rate vendor-configuration request.
    fn set_channel(&mut self, channel: u8) -> std::io::Result<()>;
    fn set_address(&mut self, address: &[u8; 5]) -> std::io::Result<()>;
    fn set_data_rate(&mut self, rate: u8) -> std::io::Result<()>;

    /// Writes up to 32 payload bytes as a bulk OUT transfer.
    fn bulk_write(&mut self, data: &[u8], timeout: std::time::Duration) -> std::io::Result<()>;

    /// Reads up to 64 bytes as a bulk IN transfer. Returns the bytes read.
    fn bulk_read(&mut self, timeout: std::time::Duration) -> std::io::Result<Vec<u8>>;

    /// Firmware-accelerated channel scan: sweep `[start, stop)` at the
    /// current address/rate and return channels that produced an ACK.
    /// `None` means the firmware doesn't support the accelerated scan vendor
    /// request and the caller should fall back to a sequential scan.
    fn scan_channels(&mut self, start: u8, stop: u8) -> std::io::Result<Option<Vec<u8>>>;

    /// The dongle's reported firmware version, used to decide whether the
    /// accelerated scan request is supported.
    fn firmware_version(&self) -> (u8, u8);
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// A scriptable [`UsbBackend`] for unit tests: a queue of "ACK payload"
    /// responses to `bulk_write`+`bulk_read` round trips, `None` meaning a
    /// timeout.
    #[derive(Default)]
    pub struct MockBackend {
        pub responses: VecDeque<Option<Vec<u8>>>,
        pub sent: Vec<Vec<u8>>,
        pub last_channel: Option<u8>,
        pub last_address: Option<[u8; 5]>,
        pub last_rate: Option<u8>,
    }

    impl UsbBackend for MockBackend {
        fn set_channel(&mut self, channel: u8) -> std::io::Result<()> {
            self.last_channel = Some(channel);
            Ok(())
        }

        fn set_address(&mut self, address: &[u8; 5]) -> std::io::Result<()> {
            self.last_address = Some(*address);
            Ok(())
        }

        fn set_data_rate(&mut self, rate: u8) -> std::io::Result<()> {
            self.last_rate = Some(rate);
            Ok(())
        }

        fn bulk_write(&mut self, data: &[u8], _timeout: std::time::Duration) -> std::io::Result<()> {
            self.sent.push(data.to_vec());
            Ok(())
        }

        fn bulk_read(&mut self, _timeout: std::time::Duration) -> std::io::Result<Vec<u8>> {
            match self.responses.pop_front() {
                Some(Some(data)) => Ok(data),
                Some(None) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout")),
                None => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "no more mock responses")),
            }
        }

        fn scan_channels(&mut self, _start: u8, _stop: u8) -> std::io::Result<Option<Vec<u8>>> {
            Ok(None)
        }

        fn firmware_version(&self) -> (u8, u8) {
            (0, 53)
        }
    }
}
