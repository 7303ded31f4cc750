//! Connection URIs and the top-level `Driver` sum type: tagged variants
//! instead of a trait object, since the set of transports is closed.
//!
//! A URI names a driver and, optionally, one or more middleware tags to wrap
//! it in, joined with `+`: `radio://0/80/2M/E7E7E7E704`,
//! `radio+log://0/80/2M/E7E7E7E704`, `usb://0`, `sitl://localhost:5432`.

pub mod radio;
pub mod sitl;
pub mod usb;

use crate::crtp::packet::Packet;
use crate::error::{Error, Result};

/// A parsed connection URI: driver scheme, middleware tags (outermost last,
/// applied in listed order), and the remaining `scheme://path` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub driver: String,
    pub middleware: Vec<String>,
    pub path: String,
}

impl Uri {
    /// Parses `scheme[+middleware...]://path`.
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, path) = s.split_once("://").ok_or_else(|| Error::WrongUri {
            uri: s.to_string(),
            reason: "missing `://`".into(),
        })?;
        let mut parts = scheme.split('+');
        let driver = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::WrongUri {
                uri: s.to_string(),
                reason: "empty driver scheme".into(),
            })?
            .to_string();
        let middleware = parts.map(str::to_string).collect();
        Ok(Uri {
            driver,
            middleware,
            path: path.to_string(),
        })
    }

    /// The path's `/`-separated segments, with any leading slash stripped.
    pub fn segments(&self) -> Vec<&str> {
        self.path
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// The CRTP transport layer, as one of a closed set of variants: a
/// shared-radio link, a direct USB link, or the length-prefixed TCP framing
/// used by the simulator. Middleware (currently just packet logging) wraps
/// any of these without needing its own trait object.
pub enum Driver {
    Radio(self::radio::RadioLinkDriver),
    Usb(self::usb::UsbDriver),
    Sitl(self::sitl::SitlDriver),
    Logging(Box<Driver>),
}

impl Driver {
    /// Opens a driver (and any middleware it's wrapped in) from a parsed URI.
    pub async fn open(uri: &Uri) -> Result<Self> {
        let inner = match uri.driver.as_str() {
            "radio" => Driver::Radio(self::radio::RadioLinkDriver::open(uri).await?),
            "usb" => Driver::Usb(self::usb::UsbDriver::open(uri).await?),
            "sitl" => Driver::Sitl(self::sitl::SitlDriver::open(uri).await?),
            other => {
                return Err(Error::WrongUri {
                    uri: uri.path.clone(),
                    reason: format!("unknown driver scheme {:?}", other),
                })
            }
        };
        let mut driver = inner;
        for tag in &uri.middleware {
            driver = match tag.as_str() {
                "log" => Driver::Logging(Box::new(driver)),
                other => {
                    return Err(Error::WrongUri {
                        uri: uri.path.clone(),
                        reason: format!("unknown middleware tag {:?}", other),
                    })
                }
            };
        }
        Ok(driver)
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        match self {
            Driver::Radio(d) => d.send_packet(packet).await,
            Driver::Usb(d) => d.send_packet(packet).await,
            Driver::Sitl(d) => d.send_packet(packet).await,
            Driver::Logging(inner) => {
                log::debug!("-> {:?} ch{} {:?}", packet.port(), packet.channel(), packet.data());
                inner.send_packet(packet).await
            }
        }
    }

    pub async fn receive_packet(&self) -> Result<Packet> {
        match self {
            Driver::Radio(d) => d.receive_packet().await,
            Driver::Usb(d) => d.receive_packet().await,
            Driver::Sitl(d) => d.receive_packet().await,
            Driver::Logging(inner) => {
                let packet = inner.receive_packet().await?;
                log::debug!(
                    "<- {:?} ch{} {:?}",
                    packet.port(),
                    packet.channel(),
                    packet.data()
                );
                Ok(packet)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_and_middleware() {
        let uri = Uri::parse("radio+log://0/80/2M/E7E7E7E704").unwrap();
        assert_eq!(uri.driver, "radio");
        assert_eq!(uri.middleware, vec!["log".to_string()]);
        assert_eq!(uri.segments(), vec!["0", "80", "2M", "E7E7E7E704"]);
    }

    #[test]
    fn parses_bare_scheme() {
        let uri = Uri::parse("usb://0").unwrap();
        assert_eq!(uri.driver, "usb");
        assert!(uri.middleware.is_empty());
        assert_eq!(uri.segments(), vec!["0"]);
    }

    #[test]
    fn missing_separator_is_wrong_uri() {
        assert!(matches!(Uri::parse("not-a-uri"), Err(Error::WrongUri { .. })));
    }
}
