//! Radio addressing and the `(data_rate, channel, address)` tuple that fully
//! describes a dongle configuration.

use std::fmt;

use crate::error::{Error, Result};

/// A 5-byte radio address.
///
/// Always 5 bytes on the wire. Convenience constructors expand a single
/// byte against the default `E7 E7 E7 E7` prefix, or parse a 10-hex-digit
/// string.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct RadioAddress([u8; 5]);

impl RadioAddress {
    /// The default prefix used when expanding a single-byte address.
    pub const DEFAULT_PREFIX: [u8; 4] = [0xE7, 0xE7, 0xE7, 0xE7];

    /// The address every Crazyradio dongle and Crazyflie answer to out of the box.
    pub const DEFAULT: RadioAddress = RadioAddress([0xE7, 0xE7, 0xE7, 0xE7, 0xE7]);

    /// Builds an address from exactly 5 raw bytes.
    pub const fn new(bytes: [u8; 5]) -> Self {
        RadioAddress(bytes)
    }

    /// Expands a single byte against the default `E7E7E7E7` prefix.
    pub const fn from_byte(b: u8) -> Self {
        RadioAddress([
            Self::DEFAULT_PREFIX[0],
            Self::DEFAULT_PREFIX[1],
            Self::DEFAULT_PREFIX[2],
            Self::DEFAULT_PREFIX[3],
            b,
        ])
    }

    /// Parses a 10-hex-digit string (e.g. `"E7E7E7E704"`) into a 5-byte address.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 10 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidArgument(format!(
                "{:?} is not a 10-hex-digit radio address",
                s
            )));
        }
        let mut bytes = [0u8; 5];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        }
        Ok(RadioAddress(bytes))
    }

    /// Returns the raw 5 bytes, MSB first, as sent over the air.
    pub fn as_bytes(&self) -> &[u8; 5] {
        &self.0
    }
}

impl From<u8> for RadioAddress {
    fn from(b: u8) -> Self {
        RadioAddress::from_byte(b)
    }
}

impl std::str::FromStr for RadioAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl From<[u8; 5]> for RadioAddress {
    fn from(bytes: [u8; 5]) -> Self {
        RadioAddress(bytes)
    }
}

impl fmt::Debug for RadioAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl fmt::Display for RadioAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The dongle's over-the-air data rate.
///
/// Ordered so that `DataRate` comparisons cluster a sorted list of
/// [`RadioConfig`]s by rate first — switching data rate is the most expensive
/// reconfiguration the dongle can be asked to do.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataRate {
    Rate250K,
    Rate1M,
    Rate2M,
}

impl DataRate {
    /// The vendor-request wire value for this rate.
    pub fn as_u8(&self) -> u8 {
        match self {
            DataRate::Rate250K => 0,
            DataRate::Rate1M => 1,
            DataRate::Rate2M => 2,
        }
    }
}

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataRate::Rate250K => "250K",
            DataRate::Rate1M => "1M",
            DataRate::Rate2M => "2M",
        })
    }
}

impl std::str::FromStr for DataRate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "250K" => Ok(DataRate::Rate250K),
            "1M" => Ok(DataRate::Rate1M),
            "2M" => Ok(DataRate::Rate2M),
            other => Err(Error::InvalidArgument(format!(
                "{:?} is not a valid data rate",
                other
            ))),
        }
    }
}

/// The maximum channel number a Crazyradio/NRF24-style dongle accepts.
pub const MAX_CHANNEL: u8 = 125;

/// A full dongle configuration: data rate, channel, and address.
///
/// Ordered lexicographically by `(data_rate, channel, address)`: this
/// clusters a sorted sequence of configs by data rate, since changing data
/// rate is the dongle's most expensive reconfiguration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RadioConfig {
    pub data_rate: DataRate,
    pub channel: u8,
    pub address: RadioAddress,
}

impl RadioConfig {
    /// Builds a config, rejecting out-of-range channels.
    pub fn new(data_rate: DataRate, channel: u8, address: RadioAddress) -> Result<Self> {
        if channel > MAX_CHANNEL {
            return Err(Error::InvalidArgument(format!(
                "channel {} exceeds the maximum of {}",
                channel, MAX_CHANNEL
            )));
        }
        Ok(RadioConfig {
            data_rate,
            channel,
            address,
        })
    }

    /// The stack's defaults: channel 2, 2 Mbps, address `E7E7E7E7E7`.
    pub fn default_config() -> Self {
        RadioConfig {
            data_rate: DataRate::Rate2M,
            channel: 2,
            address: RadioAddress::DEFAULT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_byte_expands_against_default_prefix() {
        let addr = RadioAddress::from(0x04);
        assert_eq!(addr.as_bytes(), &[0xE7, 0xE7, 0xE7, 0xE7, 0x04]);
    }

    #[test]
    fn hex_string_parses_to_five_bytes() {
        let addr = RadioAddress::from_hex("E7E7E7E704").unwrap();
        assert_eq!(addr.as_bytes(), &[0xE7, 0xE7, 0xE7, 0xE7, 0x04]);
    }

    #[test]
    fn hex_string_wrong_length_is_rejected() {
        assert!(RadioAddress::from_hex("E7E7E704").is_err());
    }

    #[test]
    fn debug_representation_is_hex() {
        let addr = RadioAddress::from(0x04);
        assert_eq!(format!("{:?}", addr), "E7E7E7E704");
    }

    #[test]
    fn channel_over_max_is_rejected() {
        assert!(RadioConfig::new(DataRate::Rate2M, 126, RadioAddress::DEFAULT).is_err());
        assert!(RadioConfig::new(DataRate::Rate2M, 125, RadioAddress::DEFAULT).is_ok());
    }

    #[test]
    fn ordering_clusters_by_data_rate_first() {
        let a = RadioConfig::new(DataRate::Rate250K, 99, RadioAddress::DEFAULT).unwrap();
        let b = RadioConfig::new(DataRate::Rate1M, 0, RadioAddress::DEFAULT).unwrap();
        assert!(a < b);
    }
}
