//! The CRTP wire packet: a 1-byte header followed by 0-30 bytes of payload.
//!
//! ```notrust
//! LSB                                            MSB
//! +------------+------------+--------------------+
//! |  Channel   |  Safe-link |       Port         |
//! |  (2 bits)  |  (2 bits)  |      (4 bits)       |
//! +------------+------------+--------------------+
//! ```
//!
//! Bits 7-4 carry the port, bits 3-2 carry the safe-link sequence state (set
//! to `0b11` whenever safe-link is not in use — legacy firmware requires
//! this), and bits 1-0 carry the channel. The "null" packet, header `0xFF`
//! with no payload, is used by the radio link worker as filler traffic while
//! polling a half-duplex downlink.

use crate::error::{Error, Result};

const SAFELINK_MASK: u8 = 0b0000_1100;
const CHANNEL_MASK: u8 = 0b0000_0011;
const PORT_SHIFT: u8 = 4;

/// CRTP port numbers. Unrecognized ports decode to [`Port::Unknown`]
/// rather than failing, since a packet's destination is routing information,
/// not something this crate should refuse to carry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Port {
    Console,
    Parameters,
    Commander,
    Memory,
    Logging,
    Localization,
    GenericCommander,
    HighLevelCommander,
    Platform,
    LinkControl,
    Unknown(u8),
}

impl Port {
    pub fn as_u8(&self) -> u8 {
        match self {
            Port::Console => 0,
            Port::Parameters => 2,
            Port::Commander => 3,
            Port::Memory => 4,
            Port::Logging => 5,
            Port::Localization => 6,
            Port::GenericCommander => 7,
            Port::HighLevelCommander => 8,
            Port::Platform => 13,
            Port::LinkControl => 15,
            Port::Unknown(n) => *n,
        }
    }
}

impl From<u8> for Port {
    fn from(n: u8) -> Self {
        match n {
            0 => Port::Console,
            2 => Port::Parameters,
            3 => Port::Commander,
            4 => Port::Memory,
            5 => Port::Logging,
            6 => Port::Localization,
            7 => Port::GenericCommander,
            8 => Port::HighLevelCommander,
            13 => Port::Platform,
            15 => Port::LinkControl,
            other => Port::Unknown(other),
        }
    }
}

/// An immutable-after-construction CRTP packet: `(port, channel, data)`.
///
/// `data` is capped at 30 bytes, leaving room for the 1-byte header within
/// the dongle's 31-byte-payload ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    port: Port,
    channel: u8,
    data: Vec<u8>,
}

/// Maximum payload length a `Packet` may carry.
pub const MAX_DATA_LEN: usize = 30;

impl Packet {
    /// Builds a packet, rejecting payloads over [`MAX_DATA_LEN`] or channels
    /// outside `0..=3`.
    pub fn new(port: Port, channel: u8, data: impl Into<Vec<u8>>) -> Result<Self> {
        let data = data.into();
        if channel > 3 {
            return Err(Error::InvalidArgument(format!(
                "channel {} is out of the 0..=3 range",
                channel
            )));
        }
        if data.len() > MAX_DATA_LEN {
            return Err(Error::InvalidArgument(format!(
                "packet data of {} bytes exceeds the {}-byte limit",
                data.len(),
                MAX_DATA_LEN
            )));
        }
        Ok(Packet { port, channel, data })
    }

    /// The canonical empty "keep the half-duplex link alive" filler packet:
    /// header `0xFF`, no data.
    pub fn null() -> Self {
        Packet {
            port: Port::Unknown(0x0F),
            channel: 0b11,
            data: Vec::new(),
        }
    }

    /// A packet is "null" if its header is `0xF3` or `0xFF` and it carries no
    /// data — `0xF3` is what a safe-link-tagged filler packet's header
    /// looks like once the sequence bits are OR-ed in.
    pub fn is_null(&self) -> bool {
        self.data.is_empty() && (self.port.as_u8() == 0x0F) && matches!(self.channel, 0b11)
    }

    pub fn port(&self) -> &Port {
        &self.port
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Encodes this packet as `header || data`, OR-ing in `safelink_bits`
    /// (already shifted into bits 3-2) or `0b1100` if safe-link is inactive —
    /// firmware treats those reserved bits set as the "not a safe-link
    /// sequence" marker.
    pub fn encode(&self, safelink_bits: Option<u8>) -> Vec<u8> {
        let safelink = safelink_bits.unwrap_or(SAFELINK_MASK) & SAFELINK_MASK;
        let header = (self.port.as_u8() << PORT_SHIFT) | safelink | (self.channel & CHANNEL_MASK);
        let mut out = Vec::with_capacity(1 + self.data.len());
        out.push(header);
        out.extend_from_slice(&self.data);
        out
    }

    /// Decodes a packet from raw wire bytes. The safe-link bits (header bits
    /// 3-2) are stripped and returned alongside the packet, since they carry
    /// link-level state rather than routing information.
    pub fn decode(bytes: &[u8]) -> Result<(Self, u8)> {
        let header = *bytes
            .first()
            .ok_or_else(|| Error::InvalidResponse("empty packet".into()))?;
        let port = Port::from(header >> PORT_SHIFT);
        let safelink = header & SAFELINK_MASK;
        let channel = header & CHANNEL_MASK;
        let data = bytes[1..].to_vec();
        Ok((Packet { port, channel, data }, safelink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_places_fields_in_expected_bits() {
        let p = Packet::new(Port::Memory, 1, vec![0xAA, 0xBB]).unwrap();
        let bytes = p.encode(None);
        assert_eq!(bytes.len(), p.data().len() + 1);
        assert_eq!(bytes[0] >> 4, Port::Memory.as_u8());
        assert_eq!(bytes[0] & CHANNEL_MASK, 1);
        assert_eq!(&bytes[1..], &[0xAA, 0xBB]);
    }

    #[test]
    fn non_safelink_packets_get_reserved_bits_set() {
        let p = Packet::new(Port::Console, 0, vec![]).unwrap();
        let bytes = p.encode(None);
        assert_eq!(bytes[0] & SAFELINK_MASK, SAFELINK_MASK);
    }

    #[test]
    fn decode_is_inverse_of_encode_modulo_safelink_bits() {
        let p = Packet::new(Port::Logging, 2, vec![1, 2, 3]).unwrap();
        let bytes = p.encode(Some(0b1000));
        let (decoded, safelink) = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.port(), p.port());
        assert_eq!(decoded.channel(), p.channel());
        assert_eq!(decoded.data(), p.data());
        assert_eq!(safelink, 0b1000);
    }

    #[test]
    fn null_packet_is_header_0xff_no_data() {
        let n = Packet::null();
        assert_eq!(n.encode(None), vec![0xFF]);
        assert!(n.is_null());
    }

    #[test]
    fn data_over_limit_is_rejected() {
        assert!(Packet::new(Port::Commander, 0, vec![0u8; 31]).is_err());
        assert!(Packet::new(Port::Commander, 0, vec![0u8; 30]).is_ok());
    }

    #[test]
    fn channel_over_range_is_rejected() {
        assert!(Packet::new(Port::Commander, 4, vec![]).is_err());
    }
}
