//! Streaming log blocks: the logging TOC, block construction, and the
//! create/start/stop/delete lifecycle that turns a set of log variables into
//! a periodic stream of samples.
//!
//! A log block's wire payload is capped at [`MAX_SAMPLE_BYTES`] bytes of
//! values, on top of the 1-byte block ID and 3-byte timestamp every `DATA`
//! channel packet already carries.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::crtp::device::Device;
use crate::crtp::dispatcher::PacketQueue;
use crate::crtp::packet::Port;
use crate::error::{Error, Result};
use crate::toc::{fetch, Cache, FetchLocks, TocItem, Value, VariableType};

/// The largest number of value bytes a single log block may stream in one
/// `DATA` packet; the firmware rejects `CREATE_BLOCK_V2` requests over this.
pub const MAX_SAMPLE_BYTES: usize = 28;

/// The inbound-queue capacity used when [`LoggingSubsystem::stream`] wires up
/// a block's packet subscription.
const STREAM_QUEUE_CAPACITY: usize = 16;

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum LoggingChannel(u8) {
        Toc = 0,
        Control = 1,
        Data = 2,
    }
}

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum LoggingTocCommand(u8) {
        GetItem = 0,
        GetInfo = 1,
        GetItemV2 = 2,
        GetInfoV2 = 3,
    }
}

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum LoggingControlCommand(u8) {
        CreateBlock = 0,
        AppendBlock = 1,
        DeleteBlock = 2,
        StartLogging = 3,
        StopLogging = 4,
        Reset = 5,
        CreateBlockV2 = 6,
        AppendBlockV2 = 7,
    }
}

/// One variable within a [`LogBlock`]: the TOC id it names, the type the
/// firmware stores it as, and the type it should be converted to on the way
/// out (conversion happens on-device, not in this crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBlockEntry {
    pub variable_id: u16,
    pub stored_type: VariableType,
    pub fetch_type: VariableType,
}

impl ToBytes for LogBlockEntry {
    /// `CREATE_BLOCK_V2` packs both type nibbles into one byte (fetch type in
    /// the high nibble, stored type in the low nibble) followed by the
    /// variable's 16-bit TOC id, little-endian.
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<()> {
        let packed = ((self.fetch_type.code() << 4) & 0xF0) | (self.stored_type.code() & 0x0F);
        writer.write_u8(packed);
        writer.write_u16_le(self.variable_id);
        Ok(())
    }
}

/// A log block specification: a list of variables to sample together at a
/// shared period, not yet registered with the firmware.
#[derive(Debug, Clone, Default)]
pub struct LogBlock {
    entries: Vec<LogBlockEntry>,
}

impl LogBlock {
    pub fn new() -> Self {
        LogBlock::default()
    }

    /// Adds a variable, fetching it as `fetch_type` (defaulting to its stored
    /// type when `None`) so unit conversion can happen on-device.
    pub fn add(&mut self, item: &TocItem, fetch_type: Option<VariableType>) {
        self.entries.push(LogBlockEntry {
            variable_id: item.id,
            stored_type: item.var_type,
            fetch_type: fetch_type.unwrap_or(item.var_type),
        });
    }

    pub fn entries(&self) -> &[LogBlockEntry] {
        &self.entries
    }

    /// Total value bytes one sample of this block would occupy.
    pub fn packet_size(&self) -> usize {
        self.entries.iter().map(|e| e.fetch_type.byte_len()).sum()
    }

    /// Checks this block fits in one `DATA` packet before it's submitted.
    pub fn validate(&self) -> Result<()> {
        let size = self.packet_size();
        if size > MAX_SAMPLE_BYTES {
            return Err(Error::InvalidArgument(format!(
                "log block of {} bytes exceeds the {}-byte sample limit",
                size, MAX_SAMPLE_BYTES
            )));
        }
        Ok(())
    }

    /// Encodes the `CREATE_BLOCK_V2` request body: each entry back to back.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let mut buf = Vec::with_capacity(self.entries.len() * 3);
        let mut writer = ByteWriter::new(&mut buf);
        for entry in &self.entries {
            entry.to_bytes(&mut writer)?;
        }
        Ok(buf)
    }
}

/// A single decoded sample from a block's `DATA` stream: the firmware
/// timestamp (milliseconds, 24-bit, wraps roughly every 4.6 hours) and one
/// value per entry, in the order the block was built.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSample {
    pub block_id: u8,
    pub timestamp: u32,
    pub values: Vec<Value>,
}

impl LogSample {
    /// Decodes `data` (the full `DATA` channel packet body: block id byte,
    /// 24-bit timestamp, then values) against `block`'s entry types.
    fn decode(data: &[u8], block: &LogBlock) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let block_id = reader.read_u8()?;
        let timestamp = reader.read_u24_le()?;
        let mut values = Vec::with_capacity(block.entries.len());
        for entry in &block.entries {
            values.push(entry.fetch_type.decode_value(&mut reader)?);
        }
        Ok(LogSample {
            block_id,
            timestamp,
            values,
        })
    }
}

/// A live subscription to one block's samples. Dropping this does not stop
/// the block on the firmware; call [`LoggingSubsystem::stop`] explicitly.
pub struct LogStream {
    queue: PacketQueue,
    block: LogBlock,
    block_id: u8,
}

impl LogStream {
    /// Waits for the next sample belonging to this stream's block,
    /// discarding `DATA` packets from other blocks sharing the port.
    pub async fn next_sample(&mut self) -> Option<Result<LogSample>> {
        loop {
            let packet = self.queue.recv().await?;
            if packet.channel() != u8::from(LoggingChannel::Data) {
                continue;
            }
            if packet.data().first() != Some(&self.block_id) {
                continue;
            }
            return Some(LogSample::decode(packet.data(), &self.block));
        }
    }
}

/// Handle to the Crazyflie's logging subsystem: TOC lookup plus the
/// create/start/stop/delete lifecycle for log blocks.
///
/// Block ids are assigned from a small monotonic counter reset by
/// [`LoggingSubsystem::reset`], matching the firmware's expectation that
/// block ids are a dense `0..N` range rather than caller-chosen.
pub struct LoggingSubsystem {
    device: Arc<Device>,
    operation_lock: AsyncMutex<()>,
    next_block_id: AtomicU8,
}

impl LoggingSubsystem {
    pub fn new(device: Arc<Device>) -> Self {
        LoggingSubsystem {
            device,
            operation_lock: AsyncMutex::new(()),
            next_block_id: AtomicU8::new(0),
        }
    }

    /// Clears all log blocks on the firmware and rewinds the block id
    /// counter. Called once at startup, mirroring the firmware's own
    /// expectation of a known-empty logging state before blocks are created.
    pub async fn reset(&self) -> Result<()> {
        let _guard = self.operation_lock.lock().await;
        self.device
            .run_command_default(
                Port::Logging,
                u8::from(LoggingChannel::Control),
                Some(vec![u8::from(LoggingControlCommand::Reset)]),
                None,
            )
            .await?;
        self.next_block_id.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Fetches the complete table of loggable variables, consulting `cache`
    /// first and coalescing concurrent fetches against identical firmware via
    /// `locks` — the same fetch-and-cache machinery the parameter TOC uses.
    pub async fn fetch_toc<C: Cache>(&self, cache: &C, locks: &FetchLocks) -> Result<Vec<TocItem>> {
        let device = Arc::clone(&self.device);
        let query_device = Arc::clone(&device);
        let fetch_device = Arc::clone(&device);

        fetch(
            "log",
            cache,
            locks,
            move || {
                let device = Arc::clone(&query_device);
                async move {
                    let response = device
                        .run_command_default(
                            Port::Logging,
                            u8::from(LoggingChannel::Toc),
                            Some(vec![u8::from(LoggingTocCommand::GetInfoV2)]),
                            None,
                        )
                        .await?;
                    let mut reader = ByteReader::new(&response);
                    let count = reader.read_u16_le()?;
                    let hash = reader.read_u32_le()?;
                    Ok((count, hash))
                }
            },
            move |index| {
                let device = Arc::clone(&fetch_device);
                async move {
                    let response = device
                        .run_command_default(
                            Port::Logging,
                            u8::from(LoggingChannel::Toc),
                            Some(vec![
                                u8::from(LoggingTocCommand::GetItemV2),
                                (index & 0xFF) as u8,
                                (index >> 8) as u8,
                            ]),
                            None,
                        )
                        .await?;
                    if response.is_empty() {
                        return Err(Error::NotFound);
                    }
                    let mut item = TocItem::from_bytes(&mut ByteReader::new(&response))?;
                    item.id = index;
                    Ok(item)
                }
            },
        )
        .await
    }

    /// Registers `block` with the firmware, returning the id it was assigned.
    pub async fn create(&self, block: &LogBlock) -> Result<u8> {
        let id = self.next_block_id.fetch_add(1, Ordering::SeqCst);
        let body = block.to_bytes()?;

        let _guard = self.operation_lock.lock().await;
        let response = self
            .device
            .run_command_default(
                Port::Logging,
                u8::from(LoggingChannel::Control),
                Some(vec![u8::from(LoggingControlCommand::CreateBlockV2), id]),
                Some(body),
            )
            .await?;
        check_status(&response, "create log block")?;
        Ok(id)
    }

    /// Starts streaming `block_id` at `period_msec`, rounded down to the
    /// firmware's 10ms resolution. Valid range is 0-2550ms.
    pub async fn start(&self, block_id: u8, period_msec: u32) -> Result<()> {
        let period_byte = period_msec / 10;
        if period_byte < 1 || period_byte > 255 {
            return Err(Error::InvalidArgument(
                "logging period must be between 10 and 2550ms".into(),
            ));
        }

        let _guard = self.operation_lock.lock().await;
        let response = self
            .device
            .run_command_default(
                Port::Logging,
                u8::from(LoggingChannel::Control),
                Some(vec![u8::from(LoggingControlCommand::StartLogging), block_id]),
                Some(vec![period_byte as u8]),
            )
            .await?;
        check_status(&response, "start log block")
    }

    pub async fn stop(&self, block_id: u8) -> Result<()> {
        let _guard = self.operation_lock.lock().await;
        let response = self
            .device
            .run_command_default(
                Port::Logging,
                u8::from(LoggingChannel::Control),
                Some(vec![u8::from(LoggingControlCommand::StopLogging), block_id]),
                None,
            )
            .await?;
        check_status(&response, "stop log block")
    }

    pub async fn delete(&self, block_id: u8) -> Result<()> {
        let _guard = self.operation_lock.lock().await;
        let response = self
            .device
            .run_command_default(
                Port::Logging,
                u8::from(LoggingChannel::Control),
                Some(vec![u8::from(LoggingControlCommand::DeleteBlock), block_id]),
                None,
            )
            .await?;
        check_status(&response, "delete log block")
    }

    /// Subscribes to `block_id`'s samples. The block must already be created
    /// and started; this only wires up the packet queue that
    /// [`LogStream::next_sample`] reads from.
    pub async fn stream(&self, block: LogBlock, block_id: u8) -> LogStream {
        let queue = self
            .device
            .dispatcher()
            .packet_queue(Some(Port::Logging), STREAM_QUEUE_CAPACITY)
            .await;
        LogStream {
            queue,
            block,
            block_id,
        }
    }

    /// Creates, starts, streams for the duration the returned handle is
    /// polled, and on drop leaves the block running on the firmware side —
    /// callers that want clean teardown should call [`LoggingSubsystem::stop`]
    /// and [`LoggingSubsystem::delete`] themselves. Tying that to `Drop` would
    /// need an async destructor this stream doesn't have.
    pub async fn create_and_start(&self, block: LogBlock, period_msec: u32) -> Result<LogStream> {
        let id = self.create(&block).await?;
        self.start(id, period_msec).await?;
        Ok(self.stream(block, id).await)
    }
}

fn check_status(response: &[u8], what: &str) -> Result<()> {
    match response.first() {
        Some(0) => Ok(()),
        Some(code) => Err(Error::CrtpCommandError(*code)),
        None => Err(Error::InvalidResponse(format!("{} returned an empty response", what))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::UsbDriver;
    use crate::drivers::Driver;
    use crate::toc::VariableType;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn toc_item(id: u16, var_type: VariableType, group: &str, name: &str) -> TocItem {
        TocItem {
            id,
            var_type,
            group: group.into(),
            name: name.into(),
            read_only: false,
        }
    }

    #[test]
    fn entry_packs_fetch_and_stored_type_nibbles() {
        let entry = LogBlockEntry {
            variable_id: 0x0102,
            stored_type: VariableType::Float32,
            fetch_type: VariableType::Int8,
        };
        let mut buf = Vec::new();
        entry.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();
        assert_eq!(buf[0], (VariableType::Int8.code() << 4) | VariableType::Float32.code());
        assert_eq!(&buf[1..], &[0x02, 0x01]);
    }

    #[test]
    fn packet_size_sums_fetch_type_widths() {
        let mut block = LogBlock::new();
        block.add(&toc_item(0, VariableType::Float32, "g", "a"), None);
        block.add(&toc_item(1, VariableType::Uint8, "g", "b"), None);
        assert_eq!(block.packet_size(), 5);
    }

    #[test]
    fn block_over_the_sample_limit_is_rejected() {
        let mut block = LogBlock::new();
        for i in 0..8 {
            block.add(&toc_item(i, VariableType::Uint64, "g", "v"), None);
        }
        assert!(block.validate().is_err());
    }

    #[test]
    fn sample_decodes_timestamp_and_values_in_order() {
        let mut block = LogBlock::new();
        block.add(&toc_item(0, VariableType::Uint8, "g", "a"), None);
        block.add(&toc_item(1, VariableType::Float32, "g", "b"), None);

        let mut data = vec![7u8, 0x01, 0x02, 0x03]; // block id, timestamp 0x030201
        data.push(42); // uint8 value
        data.extend_from_slice(&1.5f32.to_le_bytes());

        let sample = LogSample::decode(&data, &block).unwrap();
        assert_eq!(sample.block_id, 7);
        assert_eq!(sample.timestamp, 0x030201);
        assert_eq!(sample.values, vec![Value::Uint8(42), Value::Float32(1.5)]);
    }

    struct ScriptedHandle {
        responses: StdMutex<VecDeque<Vec<u8>>>,
    }

    impl crate::drivers::usb::UsbHandle for ScriptedHandle {
        fn bulk_write(&mut self, _data: &[u8], _timeout: Duration) -> std::io::Result<()> {
            Ok(())
        }

        fn bulk_read(&mut self, _timeout: Duration) -> std::io::Result<Vec<u8>> {
            Ok(self.responses.lock().unwrap().pop_front().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn create_assigns_sequential_ids_and_checks_status() {
        let response = crate::crtp::packet::Packet::new(
            Port::Logging,
            u8::from(LoggingChannel::Control),
            vec![u8::from(LoggingControlCommand::CreateBlockV2), 0, 0],
        )
        .unwrap()
        .encode(None);
        let handle = ScriptedHandle {
            responses: StdMutex::new(VecDeque::from([response])),
        };
        let driver = Driver::Usb(UsbDriver::spawn(Box::new(handle)));
        let device = Arc::new(Device::open(driver));
        let logging = LoggingSubsystem::new(device);

        let mut block = LogBlock::new();
        block.add(&toc_item(0, VariableType::Uint8, "g", "a"), None);

        let id = logging.create(&block).await.unwrap();
        assert_eq!(id, 0);
    }

    #[tokio::test]
    async fn start_with_out_of_range_period_is_rejected_before_sending() {
        let handle = ScriptedHandle {
            responses: StdMutex::new(VecDeque::new()),
        };
        let driver = Driver::Usb(UsbDriver::spawn(Box::new(handle)));
        let device = Arc::new(Device::open(driver));
        let logging = LoggingSubsystem::new(device);

        let result = logging.start(0, 3000).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
