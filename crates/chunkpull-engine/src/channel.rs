//! Datagram channel to the remote peer.
//!
//! One UDP socket per session. Only datagrams from the configured peer are
//! delivered; anything else is foreign and dropped. The socket is shared by
//! reference between the sender (which only sends) and the receiver (which
//! only receives).

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::TransferError;
use crate::protocol::UDP_RECV_BUFFER;

pub struct Channel {
    socket: UdpSocket,
    remote: SocketAddr,
    max_datagram: usize,
}

impl Channel {
    /// Bind a fresh socket at `bind_addr` talking to `remote`.
    pub fn bind(bind_addr: SocketAddr, remote: SocketAddr, max_datagram: usize) -> io::Result<Self> {
        let socket = create_socket(bind_addr)?;
        Ok(Self::from_socket(socket, remote, max_datagram))
    }

    /// Wrap an already bound socket.
    pub fn from_socket(socket: UdpSocket, remote: SocketAddr, max_datagram: usize) -> Self {
        Self {
            socket,
            remote,
            max_datagram,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Fire-and-forget send to the peer.
    pub fn send(&self, message: &[u8]) -> io::Result<()> {
        self.socket.send_to(message, self.remote)?;
        Ok(())
    }

    /// Block up to `timeout` for one datagram from the peer.
    /// Returns `Ok(None)` on timeout.
    pub fn recv(&self, timeout: Duration) -> io::Result<Option<Bytes>> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; self.max_datagram];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // A zero read timeout means "block forever" to the OS.
            self.socket
                .set_read_timeout(Some(remaining.max(Duration::from_micros(100))))?;

            match self.socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    if src != self.remote {
                        debug!(%src, len, "dropping foreign datagram");
                        continue;
                    }
                    buf.truncate(len);
                    return Ok(Some(Bytes::from(buf)));
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    // read timeout expired (TimedOut on Windows, WouldBlock elsewhere)
                    return Ok(None);
                }
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    // ICMP port unreachable surfaced by some platforms; the peer may come back.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send `message` and wait for a reply accepted by `is_reply`, resending
    /// after each timeout. Replies rejected by `is_reply` (late chunk replies)
    /// are skipped without using up a try.
    pub fn request(
        &self,
        message: &[u8],
        timeout: Duration,
        tries: u32,
        is_reply: impl Fn(&[u8]) -> bool,
    ) -> Result<Bytes, TransferError> {
        for attempt in 1..=tries {
            self.send(message)?;
            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match self.recv(remaining)? {
                    Some(reply) if is_reply(&reply) => return Ok(reply),
                    Some(reply) => {
                        debug!(len = reply.len(), "skipping unrelated reply");
                    }
                    None => {
                        debug!(attempt, tries, "request timed out, retrying");
                        break;
                    }
                }
            }
        }
        Err(TransferError::NoReply { tries })
    }

    /// Discard every datagram already queued on the socket. Returns how many
    /// were dropped.
    pub fn flush(&self) -> io::Result<usize> {
        let mut buf = vec![0u8; self.max_datagram];
        let mut flushed = 0;
        self.socket.set_nonblocking(true)?;
        let result = loop {
            match self.socket.recv_from(&mut buf) {
                Ok(_) => flushed += 1,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(flushed),
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => break Err(e),
            }
        };
        self.socket.set_nonblocking(false)?;
        result
    }
}

/// Create a UDP socket bound to the given address with a large recv buffer.
fn create_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(false)?;
    socket.set_recv_buffer_size(UDP_RECV_BUFFER)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Channel, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let channel = Channel::bind(
            "127.0.0.1:0".parse().unwrap(),
            peer.local_addr().unwrap(),
            2048,
        )
        .unwrap();
        (channel, peer)
    }

    #[test]
    fn drops_foreign_datagrams() {
        let (channel, peer) = pair();
        let local = channel.local_addr().unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();

        stranger.send_to(b"Offset: 0\nNumBytes: 1\n\nx", local).unwrap();
        peer.send_to(b"from peer", local).unwrap();

        let got = channel.recv(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(&got[..], b"from peer");
    }

    #[test]
    fn recv_times_out() {
        let (channel, _peer) = pair();
        let start = Instant::now();
        assert!(channel.recv(Duration::from_millis(30)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn request_retries_then_gives_up() {
        let (channel, peer) = pair();
        let err = channel
            .request(b"SendSize\nReset\n\n", Duration::from_millis(20), 3, |_| true)
            .unwrap_err();
        assert!(matches!(err, TransferError::NoReply { tries: 3 }));

        // every try resent the request
        peer.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let mut buf = [0u8; 64];
        for _ in 0..3 {
            let (len, _) = peer.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..len], b"SendSize\nReset\n\n");
        }
    }

    #[test]
    fn request_skips_unrelated_replies() {
        let (channel, peer) = pair();
        let local = channel.local_addr().unwrap();
        let responder = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (_, src) = peer.recv_from(&mut buf).unwrap();
            assert_eq!(src, local);
            peer.send_to(b"Offset: 0\nNumBytes: 1\n\nx", src).unwrap();
            peer.send_to(b"Size: 3000\n\n", src).unwrap();
        });

        let reply = channel
            .request(b"SendSize\nReset\n\n", Duration::from_secs(1), 1, |raw| {
                !crate::protocol::is_chunk_response(raw)
            })
            .unwrap();
        assert_eq!(&reply[..], b"Size: 3000\n\n");
        responder.join().unwrap();
    }

    #[test]
    fn flush_drains_queue() {
        let (channel, peer) = pair();
        let local = channel.local_addr().unwrap();
        for _ in 0..3 {
            peer.send_to(b"late", local).unwrap();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(channel.flush().unwrap(), 3);
        assert!(channel.recv(Duration::from_millis(10)).unwrap().is_none());
    }
}
