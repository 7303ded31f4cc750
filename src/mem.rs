//! The memory subsystem: enumerating the Crazyflie's memory elements and
//! reading or writing them in request-sized chunks.
//!
//! Every read or write that doesn't fit in one CRTP packet is split by
//! [`chunks`] and issued as a sequence of [`Device::run_command`] calls, one
//! chunk at a time — the firmware has no notion of a multi-packet transfer on
//! this port.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::bytes::ByteReader;
use crate::checksum::crc32;
use crate::crtp::device::Device;
use crate::crtp::packet::Port;
use crate::error::{Error, Result};

/// The largest number of data bytes a single `READ` request may return.
pub const MAX_READ_REQUEST_LENGTH: usize = 20;

/// The largest number of data bytes a single `WRITE` request may carry.
pub const MAX_WRITE_REQUEST_LENGTH: usize = 25;

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum MemoryChannel(u8) {
        Info = 0,
        Read = 1,
        Write = 2,
    }
}

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum MemoryInfoCommand(u8) {
        GetNumberOfMemories = 1,
        GetDetails = 2,
    }
}

enum_with_unknown! {
    /// The kind of memory a [`MemoryElement`] exposes.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum MemoryType(u8) {
        I2C = 0,
        OneWire = 1,
        Led = 0x10,
        Loco = 0x11,
        Trajectory = 0x12,
        Loco2 = 0x13,
        Lighthouse = 0x14,
        Tester = 0x15,
        SdCard = 0x16,
        LedSequence = 0x17,
        App = 0x18,
        Deck = 0x19,
    }
}

/// One entry in the Crazyflie's memory directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryElement {
    pub index: u8,
    pub mem_type: MemoryType,
    pub size: u64,
    pub address: u64,
}

impl MemoryElement {
    /// Parses a `GET_DETAILS` response body: `<type:u8><size:u32><address:u64>`.
    ///
    /// The firmware reports `size` as 32 bits; this widens it to match
    /// [`MemoryElement::size`], which is 64 bits so it shares a type with
    /// `address` for memories that are addressed as a flat 64-bit space.
    fn from_bytes(index: u8, data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let mem_type = MemoryType::from(reader.read_u8()?);
        let size = u64::from(reader.read_u32_le()?);
        let address = reader.read_u64_le()?;
        Ok(MemoryElement {
            index,
            mem_type,
            size,
            address,
        })
    }
}

/// Splits a `[addr, addr+length)` transfer into `(start, size)` chunks no
/// larger than `step`, matching the firmware's per-packet transfer limit.
fn chunks(addr: u32, length: u32, step: u32) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut start = addr;
    let end = addr + length;
    while start < end {
        out.push((start, step.min(end - start)));
        start += step;
    }
    out
}

fn addressing_command(index: u8, addr: u32) -> Vec<u8> {
    let mut command = vec![index];
    command.extend_from_slice(&addr.to_le_bytes());
    command
}

/// A handle bound to a single [`MemoryElement`], able to read and write the
/// memory it describes.
pub struct MemoryHandle {
    device: Arc<Device>,
    element: MemoryElement,
}

impl MemoryHandle {
    fn new(device: Arc<Device>, element: MemoryElement) -> Self {
        MemoryHandle { device, element }
    }

    pub fn element(&self) -> &MemoryElement {
        &self.element
    }

    /// Reads the memory's entire contents, optionally stripping trailing
    /// zero bytes (useful for EEPROM-style memories that pad to a fixed size).
    pub async fn dump(&self, strip: bool) -> Result<Vec<u8>> {
        let data = self.read(0, self.element.size as u32).await?;
        if strip {
            let trimmed = data.len() - data.iter().rev().take_while(|&&b| b == 0).count();
            Ok(data[..trimmed].to_vec())
        } else {
            Ok(data)
        }
    }

    pub async fn read(&self, addr: u32, length: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(length as usize);
        for (start, size) in chunks(addr, length, MAX_READ_REQUEST_LENGTH as u32) {
            out.extend_from_slice(&self.read_chunk(start, size).await?);
        }
        Ok(out)
    }

    pub async fn write(&self, addr: u32, data: &[u8]) -> Result<()> {
        for (start, size) in chunks(0, data.len() as u32, MAX_WRITE_REQUEST_LENGTH as u32) {
            let slice = &data[start as usize..(start + size) as usize];
            self.write_chunk(addr + start, slice).await?;
        }
        Ok(())
    }

    /// Writes `data` at `addr`, prefixed by a checksum so repeated writes of
    /// identical data can be skipped.
    ///
    /// Zeros are written over the checksum area before the data itself, and
    /// the real checksum is written last — a write interrupted partway
    /// through never leaves a stale-but-valid checksum in front of
    /// partially-written data.
    pub async fn write_with_checksum(&self, addr: u32, data: &[u8], only_if_changed: bool) -> Result<usize> {
        let expected = crc32(data).to_le_bytes();

        let need_to_write = if only_if_changed {
            let observed = self.read(addr, expected.len() as u32).await?;
            observed != expected
        } else {
            true
        };

        if need_to_write {
            self.write(addr, &[0u8; 4]).await?;
            self.write(addr + expected.len() as u32, data).await?;
            self.write(addr, &expected).await?;
        }

        Ok(expected.len())
    }

    async fn read_chunk(&self, addr: u32, length: u32) -> Result<Vec<u8>> {
        let response = self
            .device
            .run_command_default(
                Port::Memory,
                u8::from(MemoryChannel::Read),
                Some(addressing_command(self.element.index, addr)),
                Some(vec![length as u8]),
            )
            .await?;
        match response.first() {
            Some(0) => Ok(response[1..].to_vec()),
            Some(status) => Err(Error::IoError(*status)),
            None => Err(Error::InvalidResponse("empty memory read response".into())),
        }
    }

    async fn write_chunk(&self, addr: u32, data: &[u8]) -> Result<()> {
        let response = self
            .device
            .run_command_default(
                Port::Memory,
                u8::from(MemoryChannel::Write),
                Some(addressing_command(self.element.index, addr)),
                Some(data.to_vec()),
            )
            .await?;
        match response.first() {
            Some(0) => Ok(()),
            Some(status) => Err(Error::IoError(*status)),
            None => Err(Error::InvalidResponse("empty memory write response".into())),
        }
    }
}

/// Handle to the Crazyflie's memory subsystem: element enumeration plus
/// shortcuts that look a memory element up by type before reading or writing
/// it.
pub struct MemorySubsystem {
    device: Arc<Device>,
    elements: AsyncMutex<Option<Vec<MemoryElement>>>,
}

impl MemorySubsystem {
    pub fn new(device: Arc<Device>) -> Self {
        MemorySubsystem {
            device,
            elements: AsyncMutex::new(None),
        }
    }

    /// Downloads the memory directory if it hasn't been already.
    pub async fn validate(&self) -> Result<()> {
        let mut elements = self.elements.lock().await;
        if elements.is_some() {
            return Ok(());
        }
        *elements = Some(self.fetch_elements().await?);
        Ok(())
    }

    async fn fetch_elements(&self) -> Result<Vec<MemoryElement>> {
        let count_response = self
            .device
            .run_command_default(
                Port::Memory,
                u8::from(MemoryChannel::Info),
                Some(vec![u8::from(MemoryInfoCommand::GetNumberOfMemories)]),
                None,
            )
            .await?;
        let count = *count_response.first().ok_or(Error::NotFound)?;

        let mut elements = Vec::with_capacity(count as usize);
        for index in 0..count {
            let response = self
                .device
                .run_command_default(
                    Port::Memory,
                    u8::from(MemoryChannel::Info),
                    Some(vec![u8::from(MemoryInfoCommand::GetDetails), index]),
                    None,
                )
                .await?;
            if response.is_empty() {
                return Err(Error::NotFound);
            }
            elements.push(MemoryElement::from_bytes(index, &response)?);
        }
        Ok(elements)
    }

    /// Finds the first memory element of `mem_type` and returns a handle to it.
    pub async fn find(&self, mem_type: MemoryType) -> Result<MemoryHandle> {
        self.validate().await?;
        let elements = self.elements.lock().await;
        let element = elements
            .as_ref()
            .expect("validated above")
            .iter()
            .find(|e| e.mem_type == mem_type)
            .copied()
            .ok_or_else(|| Error::InvalidResponse(format!("no memory matching type {:?}", mem_type)))?;
        Ok(MemoryHandle::new(Arc::clone(&self.device), element))
    }

    /// Finds every memory element of `mem_type`.
    pub async fn find_all(&self, mem_type: MemoryType) -> Result<Vec<MemoryHandle>> {
        self.validate().await?;
        let elements = self.elements.lock().await;
        Ok(elements
            .as_ref()
            .expect("validated above")
            .iter()
            .filter(|e| e.mem_type == mem_type)
            .map(|e| MemoryHandle::new(Arc::clone(&self.device), *e))
            .collect())
    }

    /// Shortcut for the internal EEPROM, where basic configuration is stored.
    pub async fn find_eeprom(&self) -> Result<MemoryHandle> {
        self.find(MemoryType::I2C).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_are_empty_for_zero_length() {
        assert_eq!(chunks(100, 0, 20), Vec::<(u32, u32)>::new());
    }

    #[test]
    fn chunks_yield_exactly_one_at_the_step_boundary() {
        assert_eq!(chunks(0, 20, 20), vec![(0, 20)]);
    }

    #[test]
    fn chunks_yield_a_remainder_chunk_past_the_boundary() {
        assert_eq!(chunks(0, 21, 20), vec![(0, 20), (20, 1)]);
    }

    #[test]
    fn chunks_start_from_a_nonzero_address() {
        assert_eq!(chunks(10, 45, 20), vec![(10, 20), (30, 20), (50, 5)]);
    }

    #[test]
    fn memory_element_widens_the_32_bit_wire_size_to_64_bits() {
        let mut data = vec![u8::from(MemoryType::Led)];
        data.extend_from_slice(&0xAABBCCDDu32.to_le_bytes());
        data.extend_from_slice(&0x0102030405060708u64.to_le_bytes());

        let element = MemoryElement::from_bytes(3, &data).unwrap();
        assert_eq!(element.index, 3);
        assert_eq!(element.mem_type, MemoryType::Led);
        assert_eq!(element.size, 0xAABBCCDDu64);
        assert_eq!(element.address, 0x0102030405060708);
    }
}
