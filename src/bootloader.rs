//! The bootloader's flashing protocol: target enumeration, buffered
//! firmware upload, and the reboot sequence that drops a Crazyflie into or
//! out of bootloader mode.
//!
//! Every command here travels over [`Port::LinkControl`], channel 3 — the
//! bootloader ignores that port's other channels, and firmware mode ignores
//! this one.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::bytes::ByteReader;
use crate::crtp::device::Device;
use crate::crtp::packet::{Packet, Port};
use crate::error::{Error, Result};

/// The channel the bootloader listens on, regardless of CRTP port routing
/// elsewhere in the stack.
const BOOTLOADER_CHANNEL: u8 = 3;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_ATTEMPTS: u32 = 5;

/// `WRITE_FLASH` is not resent: the STM32 bootloader's flash erase can take
/// over a second, and a resent write request while one is still in flight
/// confuses it.
const WRITE_FLASH_TIMEOUT: Duration = Duration::from_millis(2500);
const WRITE_FLASH_ATTEMPTS: u32 = 3;

/// Time given to the outbound worker to actually put a fire-and-forget reset
/// packet on the wire before the caller moves on (the bootloader never
/// acknowledges `RESET` itself).
const REBOOT_SETTLE_DELAY: Duration = Duration::from_millis(100);

const LOAD_BUFFER_CHUNK_SIZE: u32 = 25;
const READ_FLASH_CHUNK_SIZE: u32 = 25;

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum BootloaderTargetType(u8) {
        Nrf51 = 0xFE,
        Stm32 = 0xFF,
    }
}

enum_with_unknown! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum BootloaderCommand(u8) {
        Shutdown = 0x01,
        Suspend = 0x02,
        Resume = 0x03,
        GetBatteryVoltage = 0x04,
        GetTargetInfo = 0x10,
        SetAddress = 0x11,
        GetMapping = 0x12,
        LoadBuffer = 0x14,
        ReadBuffer = 0x15,
        WriteFlash = 0x18,
        ReadFlash = 0x1C,
        Reset = 0xF0,
        ResetInit = 0xFF,
    }
}

enum_with_unknown! {
    /// `0xFF` ("unknown") falls out of this naturally: it has no named
    /// variant, so it decodes to [`BootloaderProtocolVersion::Unknown`] the
    /// same as any other unrecognized code.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum BootloaderProtocolVersion(u8) {
        Cf1V0 = 0x00,
        Cf1V1 = 0x01,
        Cf2 = 0x10,
    }
}

impl BootloaderProtocolVersion {
    pub fn is_cf2(&self) -> bool {
        matches!(self, BootloaderProtocolVersion::Cf2)
    }
}

/// A flashing target's static geometry, as reported by `GET_TARGET_INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderTarget {
    pub id: BootloaderTargetType,
    pub protocol_version: BootloaderProtocolVersion,
    pub page_size: u16,
    pub buffer_pages: u16,
    pub flash_pages: u16,
    pub start_page: u16,
    pub cpu_id: [u8; 12],
}

impl BootloaderTarget {
    /// Parses a `GET_TARGET_INFO` response: `<page_size:u16><buffer_pages:u16>
    /// <flash_pages:u16><start_page:u16><cpu_id:12 bytes>`, with an optional
    /// trailing protocol-version byte on newer bootloaders.
    fn from_bytes(id: BootloaderTargetType, data: &[u8]) -> Result<Self> {
        const FIXED_SIZE: usize = 8 + 12;
        if data.len() < FIXED_SIZE {
            return Err(Error::InvalidResponse(
                "target info response too short".into(),
            ));
        }
        let mut reader = ByteReader::new(data);
        let page_size = reader.read_u16_le()?;
        let buffer_pages = reader.read_u16_le()?;
        let flash_pages = reader.read_u16_le()?;
        let start_page = reader.read_u16_le()?;
        let mut cpu_id = [0u8; 12];
        cpu_id.copy_from_slice(reader.read_bytes(12)?);

        let protocol_version = if data.len() > FIXED_SIZE {
            BootloaderProtocolVersion::from(data[FIXED_SIZE])
        } else {
            BootloaderProtocolVersion::Unknown(0xFF)
        };

        Ok(BootloaderTarget {
            id,
            protocol_version,
            page_size,
            buffer_pages,
            flash_pages,
            start_page,
            cpu_id,
        })
    }

    /// Size of the on-target upload buffer, in bytes.
    pub fn buffer_size(&self) -> u32 {
        u32::from(self.buffer_pages) * u32::from(self.page_size)
    }

    /// Address where firmware should be written in flash.
    pub fn firmware_address(&self) -> u32 {
        u32::from(self.start_page) * u32::from(self.page_size)
    }

    /// Total flash size available to firmware images, in bytes.
    pub fn flash_size(&self) -> u32 {
        u32::from(self.flash_pages) * u32::from(self.page_size)
    }

    /// Flash remaining for a firmware image once the bootloader's own
    /// reserved pages are excluded.
    pub fn max_firmware_size(&self) -> u32 {
        self.flash_size() - self.firmware_address()
    }
}

/// Handle to a Crazyflie that's currently in bootloader mode: target
/// enumeration plus the buffered flashing protocol.
pub struct BootloaderSession {
    device: Arc<Device>,
    targets: AsyncMutex<Option<Vec<BootloaderTarget>>>,
}

impl BootloaderSession {
    pub fn new(device: Arc<Device>) -> Self {
        BootloaderSession {
            device,
            targets: AsyncMutex::new(None),
        }
    }

    /// Downloads target info if it hasn't been already: the STM32 main CPU
    /// is always present; the NRF51 radio co-processor shows up alongside it
    /// only on Crazyflie 2.0 hardware.
    pub async fn validate(&self) -> Result<()> {
        let mut targets = self.targets.lock().await;
        if targets.is_some() {
            return Ok(());
        }

        let stm32 = self.get_target_info(BootloaderTargetType::Stm32).await?;
        let mut found = vec![stm32];
        if found[0].protocol_version.is_cf2() {
            found.push(self.get_target_info(BootloaderTargetType::Nrf51).await?);
        }
        *targets = Some(found);
        Ok(())
    }

    pub async fn targets(&self) -> Result<Vec<BootloaderTarget>> {
        self.validate().await?;
        Ok(self.targets.lock().await.clone().expect("validated above"))
    }

    pub async fn find_target(&self, target_type: BootloaderTargetType) -> Result<BootloaderTarget> {
        self.targets()
            .await?
            .into_iter()
            .find(|t| t.id == target_type)
            .ok_or(Error::NotFound)
    }

    async fn get_target_info(&self, target_type: BootloaderTargetType) -> Result<BootloaderTarget> {
        let response = self
            .run_command(
                vec![u8::from(target_type), u8::from(BootloaderCommand::GetTargetInfo)],
                None,
                DEFAULT_TIMEOUT,
                DEFAULT_ATTEMPTS,
            )
            .await?;
        BootloaderTarget::from_bytes(target_type, &response)
    }

    /// Reboots the connected device. `to_firmware` selects whether it comes
    /// back up running its firmware (`true`) or stays in bootloader mode
    /// (`false`, the default entry state after a cold boot into bootloader).
    pub async fn reboot(&self, to_firmware: bool) -> Result<()> {
        self.run_command(
            vec![
                u8::from(BootloaderTargetType::Nrf51),
                u8::from(BootloaderCommand::ResetInit),
            ],
            None,
            DEFAULT_TIMEOUT,
            DEFAULT_ATTEMPTS,
        )
        .await?;

        let packet = Packet::new(
            Port::LinkControl,
            BOOTLOADER_CHANNEL,
            vec![
                u8::from(BootloaderTargetType::Nrf51),
                u8::from(BootloaderCommand::Reset),
                to_firmware as u8,
            ],
        )?;
        self.device.driver().send_packet(&packet).await?;
        tokio::time::sleep(REBOOT_SETTLE_DELAY).await;
        Ok(())
    }

    /// Reads up to `length` bytes of flash starting at `address`. A negative
    /// `length` in the originating implementation meant "to the end of
    /// flash"; callers here pass `None` for the same effect.
    pub async fn read_flash(&self, target: &BootloaderTarget, address: u32, length: Option<u32>) -> Result<Vec<u8>> {
        let mut address = address;
        let mut to_read = length.unwrap_or_else(|| target.flash_size() - address);
        let mut out = Vec::new();

        while to_read > 0 {
            let page = address / u32::from(target.page_size);
            let offset = address % u32::from(target.page_size);
            let mut command = vec![u8::from(target.id), u8::from(BootloaderCommand::ReadFlash)];
            command.extend_from_slice(&concat_u16_le(page as u16, offset as u16));
            let chunk = self
                .run_command(command, None, DEFAULT_TIMEOUT, DEFAULT_ATTEMPTS)
                .await?;
            let read = chunk.len() as u32;
            out.extend_from_slice(&chunk);
            address += read;
            to_read = to_read.saturating_sub(read);
            if read < READ_FLASH_CHUNK_SIZE {
                break;
            }
        }
        Ok(out)
    }

    pub async fn read_firmware(&self, target: &BootloaderTarget, length: Option<u32>) -> Result<Vec<u8>> {
        self.read_flash(target, target.firmware_address(), length).await
    }

    /// Writes `data` at `address`, which must be page-aligned. The data is
    /// staged into the target's upload buffer in [`LOAD_BUFFER_CHUNK_SIZE`]
    /// pieces, then flushed to flash one buffer-load at a time.
    pub async fn write_flash(&self, target: &BootloaderTarget, address: u32, data: &[u8]) -> Result<()> {
        if address % u32::from(target.page_size) != 0 {
            return Err(Error::InvalidArgument(
                "write_flash address must be page-aligned".into(),
            ));
        }

        let mut address = address;
        let step = target.buffer_size();
        let mut start = 0u32;
        let len = data.len() as u32;
        while start < len {
            let size = step.min(len - start);
            let slice = &data[start as usize..(start + size) as usize];
            self.fill_buffer(target, slice).await?;
            self.flush_buffer_to_flash(target, address, size).await?;
            address += size;
            start += size;
        }
        Ok(())
    }

    pub async fn write_firmware(&self, target: &BootloaderTarget, firmware: &[u8]) -> Result<()> {
        self.write_flash(target, target.firmware_address(), firmware).await
    }

    async fn fill_buffer(&self, target: &BootloaderTarget, data: &[u8]) -> Result<()> {
        let mut start = 0u32;
        let len = data.len() as u32;
        while start < len {
            let size = LOAD_BUFFER_CHUNK_SIZE.min(len - start);
            let page = start / u32::from(target.page_size);
            let offset = start % u32::from(target.page_size);

            let mut payload = vec![u8::from(target.id), u8::from(BootloaderCommand::LoadBuffer)];
            payload.extend_from_slice(&concat_u16_le(page as u16, offset as u16));
            payload.extend_from_slice(&data[start as usize..(start + size) as usize]);

            let packet = Packet::new(Port::LinkControl, BOOTLOADER_CHANNEL, payload)?;
            self.device.driver().send_packet(&packet).await?;

            start += size;
        }
        Ok(())
    }

    async fn flush_buffer_to_flash(&self, target: &BootloaderTarget, start: u32, size: u32) -> Result<()> {
        let page_size = u32::from(target.page_size);
        if start % page_size != 0 {
            return Err(Error::InvalidArgument(
                "flash flush offset must be page-aligned".into(),
            ));
        }
        let start_page = start / page_size;
        let num_pages = (size + page_size - 1) / page_size;

        let mut data = vec![0u8, 0u8];
        data.extend_from_slice(&concat_u16_le(start_page as u16, num_pages as u16));

        let response = self
            .run_command(
                vec![u8::from(target.id), u8::from(BootloaderCommand::WriteFlash)],
                Some(data),
                WRITE_FLASH_TIMEOUT,
                WRITE_FLASH_ATTEMPTS,
            )
            .await?;

        if response.len() < 2 {
            return Err(Error::InvalidResponse(
                "flash write response shorter than 2 bytes".into(),
            ));
        }
        let done = response[0] > 0;
        let status = response[1];
        match status {
            0 if done => Ok(()),
            0 => Err(Error::InvalidResponse(
                "target reports write incomplete with no error code".into(),
            )),
            other => Err(Error::CrtpCommandError(other)),
        }
    }

    async fn run_command(
        &self,
        command: Vec<u8>,
        data: Option<Vec<u8>>,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Vec<u8>> {
        self.device
            .run_command(Port::LinkControl, BOOTLOADER_CHANNEL, Some(command), data, timeout, attempts)
            .await
    }
}

fn concat_u16_le(a: u16, b: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    out.extend_from_slice(&a.to_le_bytes());
    out.extend_from_slice(&b.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::{UsbDriver, UsbHandle};
    use crate::drivers::Driver;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

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

    fn target_info_response(protocol: Option<u8>) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&100u16.to_le_bytes()); // page_size
        data.extend_from_slice(&20u16.to_le_bytes()); // buffer_pages
        data.extend_from_slice(&1024u16.to_le_bytes()); // flash_pages
        data.extend_from_slice(&10u16.to_le_bytes()); // start_page
        data.extend_from_slice(&[0u8; 12]); // cpu_id
        if let Some(p) = protocol {
            data.push(p);
        }
        data
    }

    #[test]
    fn target_geometry_is_derived_from_pages_and_page_size() {
        let target = BootloaderTarget::from_bytes(
            BootloaderTargetType::Stm32,
            &target_info_response(Some(0x10)),
        )
        .unwrap();
        assert_eq!(target.page_size, 100);
        assert_eq!(target.buffer_size(), 2000);
        assert_eq!(target.firmware_address(), 1000);
        assert_eq!(target.flash_size(), 102400);
        assert_eq!(target.max_firmware_size(), 102400 - 1000);
        assert_eq!(target.protocol_version, BootloaderProtocolVersion::Cf2);
    }

    #[test]
    fn missing_protocol_byte_decodes_as_unknown() {
        let target =
            BootloaderTarget::from_bytes(BootloaderTargetType::Stm32, &target_info_response(None)).unwrap();
        assert_eq!(target.protocol_version, BootloaderProtocolVersion::Unknown(0xFF));
    }

    #[tokio::test]
    async fn validate_only_probes_nrf51_on_cf2_targets() {
        let mut prefix = vec![u8::from(BootloaderTargetType::Stm32), u8::from(BootloaderCommand::GetTargetInfo)];
        prefix.extend_from_slice(&target_info_response(Some(0x00))); // CF1, not CF2
        let response = Packet::new(Port::LinkControl, BOOTLOADER_CHANNEL, prefix)
            .unwrap()
            .encode(None);

        let handle = ScriptedHandle {
            responses: StdMutex::new(VecDeque::from([response])),
        };
        let driver = Driver::Usb(UsbDriver::spawn(Box::new(handle)));
        let device = Arc::new(Device::open(driver));
        let bootloader = BootloaderSession::new(device);

        let targets = bootloader.targets().await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, BootloaderTargetType::Stm32);
    }

    #[tokio::test]
    async fn write_flash_rejects_unaligned_addresses() {
        let handle = ScriptedHandle {
            responses: StdMutex::new(VecDeque::new()),
        };
        let driver = Driver::Usb(UsbDriver::spawn(Box::new(handle)));
        let device = Arc::new(Device::open(driver));
        let bootloader = BootloaderSession::new(device);

        let target = BootloaderTarget::from_bytes(
            BootloaderTargetType::Stm32,
            &target_info_response(Some(0x10)),
        )
        .unwrap();

        let result = bootloader.write_flash(&target, 1, &[1, 2, 3]).await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
