//! Wake-on-LAN: magic packet construction and a one-shot UDP broadcast.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::net::UdpSocket;

pub const DEFAULT_BROADCAST: &str = "255.255.255.255";
pub const DEFAULT_PORT: u16 = 9;

/// Magic packet length: 6 bytes of 0xFF plus the MAC repeated 16 times.
pub const PACKET_LEN: usize = 6 + 6 * 16;

#[derive(Debug, Error)]
pub enum WolError {
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
    #[error("failed to send magic packet: {0}")]
    Send(#[from] std::io::Error),
}

/// Parse a MAC address in `AA:BB:CC:DD:EE:FF` or `AA-BB-…` form.
pub fn parse_mac(mac: &str) -> Result<[u8; 6], WolError> {
    let parts: Vec<&str> = mac.split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 {
        return Err(WolError::InvalidMac(mac.to_string()));
    }
    let mut bytes = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return Err(WolError::InvalidMac(mac.to_string()));
        }
        bytes[i] = u8::from_str_radix(part, 16)
            .map_err(|_| WolError::InvalidMac(mac.to_string()))?;
    }
    Ok(bytes)
}

/// Build the 102-byte magic packet for a MAC.
pub fn magic_packet(mac: [u8; 6]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PACKET_LEN);
    buf.put_bytes(0xFF, 6);
    for _ in 0..16 {
        buf.put_slice(&mac);
    }
    buf.freeze()
}

/// Send one magic packet for `mac` as a UDP broadcast datagram.
/// Returns the `ip:port` target the packet was sent to.
pub async fn send_magic_packet(
    mac: &str,
    broadcast_ip: Option<&str>,
    port: Option<u16>,
) -> Result<String, WolError> {
    let packet = magic_packet(parse_mac(mac)?);
    let target = format!(
        "{}:{}",
        broadcast_ip.unwrap_or(DEFAULT_BROADCAST),
        port.unwrap_or(DEFAULT_PORT)
    );

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.set_broadcast(true)?;
    socket.send_to(&packet, &target).await?;
    tracing::info!(mac, target = %target, "magic packet sent");
    Ok(target)
}
