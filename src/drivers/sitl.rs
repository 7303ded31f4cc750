//! The SITL (software-in-the-loop) simulator driver: a length-prefixed TCP
//! framing of CRTP packets over the `sitl://host:port` URI scheme.
//!
//! Unlike the radio and USB drivers, the simulator's socket is ordinary
//! async TCP — there is no synchronous host USB stack to hide behind a
//! blocking worker, so this driver talks to the socket directly.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::crtp::packet::Packet;
use crate::error::{Error, Result};

use super::Uri;

/// Each frame on the wire is a 4-byte little-endian length prefix followed by
/// that many bytes of CRTP packet (header + data).
pub struct SitlDriver {
    write_half: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    read_half: Mutex<tokio::net::tcp::OwnedReadHalf>,
}

impl SitlDriver {
    pub async fn open(uri: &Uri) -> Result<Self> {
        let addr = uri.path.trim_start_matches('/');
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            Error::WrongUri {
                uri: uri.path.clone(),
                reason: format!("could not connect to simulator at {:?}: {}", addr, e),
            }
        })?;
        let (read_half, write_half) = stream.into_split();
        Ok(SitlDriver {
            write_half: Mutex::new(write_half),
            read_half: Mutex::new(read_half),
        })
    }

    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let body = packet.encode(None);
        let mut frame = (body.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&body);
        let mut write_half = self.write_half.lock().await;
        write_half
            .write_all(&frame)
            .await
            .map_err(|e| Error::LinkLost(format!("sitl write failed: {}", e)))
    }

    pub async fn receive_packet(&self) -> Result<Packet> {
        let mut read_half = self.read_half.lock().await;
        let mut len_buf = [0u8; 4];
        read_half
            .read_exact(&mut len_buf)
            .await
            .map_err(|e| Error::LinkLost(format!("sitl read failed: {}", e)))?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        read_half
            .read_exact(&mut body)
            .await
            .map_err(|e| Error::LinkLost(format!("sitl read failed: {}", e)))?;
        let (packet, _) = Packet::decode(&body)?;
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crtp::packet::Port;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trips_a_length_prefixed_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            socket.read_exact(&mut len_buf).await.unwrap();
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            socket.read_exact(&mut body).await.unwrap();

            let response = Packet::new(Port::Console, 0, vec![0x99]).unwrap().encode(None);
            let mut frame = (response.len() as u32).to_le_bytes().to_vec();
            frame.extend_from_slice(&response);
            socket.write_all(&frame).await.unwrap();
        });

        let uri = Uri::parse(&format!("sitl://{}", addr)).unwrap();
        let driver = SitlDriver::open(&uri).await.unwrap();

        driver
            .send_packet(&Packet::new(Port::Commander, 0, vec![0x01]).unwrap())
            .await
            .unwrap();

        let received = driver.receive_packet().await.unwrap();
        assert_eq!(received.port(), &Port::Console);
        assert_eq!(received.data(), &[0x99]);

        server.await.unwrap();
    }
}
