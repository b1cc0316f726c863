//! Bound UDP socket: send/receive datagrams, with a test-only
//! `pause_network` switch for fault injection (C3).

use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::membership::Endpoint;

/// Maximum single datagram this crate will read; comfortably above any
/// realistic path MTU (spec §4.1: "default fragmentation discouraged
/// but not forbidden").
const MAX_DATAGRAM: usize = 65_536;

pub struct Transport {
    socket: UdpSocket,
    paused: AtomicBool,
}

impl Transport {
    /// Binds a non-blocking UDP socket at `endpoint`, applying
    /// `socket_buffer_size` as both the send and receive buffer hint
    /// (spec §6 `SocketBufferSize`). Tokio's `UdpSocket` has no buffer
    /// size setter, so the socket is built and tuned with `socket2`
    /// then converted (see SPEC_FULL.md section E.5).
    pub fn bind(endpoint: Endpoint, socket_buffer_size: usize) -> io::Result<Self> {
        let domain = match endpoint {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.set_recv_buffer_size(socket_buffer_size)?;
        socket.set_send_buffer_size(socket_buffer_size)?;
        socket.bind(&endpoint.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Self {
            socket,
            paused: AtomicBool::new(false),
        })
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        self.socket.local_addr()
    }

    /// Enables or disables the fault-injection switch. While paused,
    /// `send` silently drops outgoing datagrams and `receive` discards
    /// anything arriving at the socket, simulating a network partition
    /// without tearing down the bound port (spec §4.2).
    pub fn set_pause_network(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Best-effort, non-blocking send. Errors (destination unreachable,
    /// buffer full) are the caller's to log and swallow (spec §4.2); this
    /// function returns the `io::Result` so callers can do exactly that
    /// without this module baking in a logging policy twice.
    pub async fn send(&self, datagram: &[u8], destination: Endpoint) -> io::Result<usize> {
        if self.paused.load(Ordering::SeqCst) {
            return Ok(datagram.len());
        }
        self.socket.send_to(datagram, destination).await
    }

    /// Receives the next datagram, skipping over any received while
    /// `pause_network` is set.
    pub async fn receive(&self) -> io::Result<(Vec<u8>, Endpoint)> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, source) = self.socket.recv_from(&mut buf).await?;
            if self.paused.load(Ordering::SeqCst) {
                continue;
            }
            return Ok((buf[..len].to_vec(), source));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loopback_round_trip() {
        let a = Transport::bind("127.0.0.1:0".parse().unwrap(), 1 << 16).unwrap();
        let b = Transport::bind("127.0.0.1:0".parse().unwrap(), 1 << 16).unwrap();
        let b_addr = b.local_endpoint().unwrap();

        a.send(b"hello", b_addr).await.unwrap();
        let (data, _source) = b.receive().await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn pause_network_drops_both_directions() {
        let a = Transport::bind("127.0.0.1:0".parse().unwrap(), 1 << 16).unwrap();
        let b = Transport::bind("127.0.0.1:0".parse().unwrap(), 1 << 16).unwrap();
        let b_addr = b.local_endpoint().unwrap();

        a.set_pause_network(true);
        a.send(b"dropped", b_addr).await.unwrap();

        b.set_pause_network(true);
        let a_addr = a.local_endpoint().unwrap();
        b.set_pause_network(false);
        a.set_pause_network(false);
        a.send(b"delivered", b_addr).await.unwrap();
        let (data, _) = b.receive().await.unwrap();
        assert_eq!(data, b"delivered");
        let _ = a_addr;
    }
}
