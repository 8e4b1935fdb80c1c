//! FakeTCP client engine.
//!
//! The client runs synchronously within its caller's task: one handshake,
//! then one outstanding message at a time. Retransmission backs off
//! exponentially per attempt; packets from other peers or with unparseable
//! headers are drained and ignored without burning the attempt.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::codec::{
    decode_header, encode_header, encode_packet, Header, FLAG_ACK, FLAG_FIN, FLAG_PSH, FLAG_SYN,
    HEADER_LEN, PROTOCOL_VERSION,
};
use crate::crypto::{compute_hmac, rand_bytes, HANDSHAKE_NONCE_LEN};
use crate::error::{Error, Result};
use crate::socket::PacketSocket;

/// Wall-clock budget for receiving the SYN|ACK.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Retransmission attempts for one message.
pub const MAX_SEND_ATTEMPTS: u32 = 5;
/// Default wait for the server's echo PSH.
pub const DEFAULT_ECHO_TIMEOUT: Duration = Duration::from_secs(5);

// Client-chosen id carried in the SYN; the server assigns its own.
const CLIENT_CONN_ID: u16 = 0x2000;

/// An established client connection.
pub struct FakeTcpClient {
    socket: Arc<dyn PacketSocket>,
    server: SocketAddr,
    conn_id: u16,
    next_seq: u32,
    server_seq: u32,
}

impl std::fmt::Debug for FakeTcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTcpClient")
            .field("server", &self.server)
            .field("conn_id", &self.conn_id)
            .field("next_seq", &self.next_seq)
            .field("server_seq", &self.server_seq)
            .finish()
    }
}

impl FakeTcpClient {
    /// Binds an ephemeral UDP socket and performs the handshake.
    pub async fn connect(server: SocketAddr, psk: &[u8]) -> Result<Self> {
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        Self::connect_with_socket(Arc::new(socket), server, psk).await
    }

    /// Performs the handshake over an existing packet socket.
    ///
    /// The SYN payload is the 12-byte client nonce followed by its
    /// HMAC-SHA-256 under the PSK. A FIN|ACK with conn_id 0 while waiting
    /// for the SYN|ACK means the server rejected the proof.
    pub async fn connect_with_socket(
        socket: Arc<dyn PacketSocket>,
        server: SocketAddr,
        psk: &[u8],
    ) -> Result<Self> {
        let nonce = rand_bytes::<HANDSHAKE_NONCE_LEN>();
        let tag = compute_hmac(psk, &nonce)?;
        let mut syn_payload = Vec::with_capacity(HANDSHAKE_NONCE_LEN + tag.len());
        syn_payload.extend_from_slice(&nonce);
        syn_payload.extend_from_slice(&tag);

        let syn_seq: u32 = rand::random();
        let syn = Header::new(FLAG_SYN, CLIENT_CONN_ID, syn_seq, 0);
        socket
            .send_to(&encode_packet(&syn, &syn_payload), server)
            .await?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let (header, _) = recv_packet(&*socket, server, deadline, "handshake").await?;
            if header.has(FLAG_FIN) && header.has(FLAG_ACK) && header.conn_id == 0 {
                return Err(Error::AuthFailure);
            }
            if header.has(FLAG_SYN) && header.has(FLAG_ACK) {
                let conn_id = header.conn_id;
                let server_seq = header.seq;
                let ack = Header::new(FLAG_ACK, conn_id, syn_seq.wrapping_add(1), server_seq);
                socket.send_to(&encode_header(&ack), server).await?;
                info!("handshake done with {} conn_id={:#06x}", server, conn_id);
                return Ok(FakeTcpClient {
                    socket,
                    server,
                    conn_id,
                    next_seq: syn_seq.wrapping_add(1),
                    server_seq,
                });
            }
        }
    }

    /// Server-assigned connection id.
    pub fn conn_id(&self) -> u16 {
        self.conn_id
    }

    /// Sequence number the server announced in its SYN|ACK.
    pub fn server_seq(&self) -> u32 {
        self.server_seq
    }

    /// Sends one message reliably and blocks until it is acknowledged.
    ///
    /// Attempt `t` (0-indexed) waits `2^t` seconds for an ACK whose `ack`
    /// equals the message's sequence number, then retransmits with the same
    /// number. Five failed attempts surface as [`Error::AttemptsExhausted`].
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let seq = self.next_seq;
        let psh = Header::new(FLAG_PSH, self.conn_id, seq, 0);
        let pkt = encode_packet(&psh, payload);

        for attempt in 0..MAX_SEND_ATTEMPTS {
            self.socket.send_to(&pkt, self.server).await?;
            let deadline = Instant::now() + Duration::from_secs(1u64 << attempt);
            loop {
                match recv_packet(&*self.socket, self.server, deadline, "awaiting ack").await {
                    Ok((header, _)) => {
                        if header.has(FLAG_ACK) && header.ack == seq {
                            self.next_seq = self.next_seq.wrapping_add(1);
                            return Ok(());
                        }
                        // late echo or cumulative ack for something else
                    }
                    Err(Error::Timeout(_)) => break,
                    Err(e) => return Err(e),
                }
            }
            debug!(
                "no ack for seq {} within {}s (attempt {})",
                seq,
                1u64 << attempt,
                attempt + 1
            );
        }
        Err(Error::AttemptsExhausted)
    }

    /// Waits for the server's echo PSH and returns its payload.
    pub async fn recv_echo(&self, wait: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + wait;
        loop {
            let (header, payload) =
                recv_packet(&*self.socket, self.server, deadline, "awaiting echo").await?;
            if header.has(FLAG_PSH) {
                return Ok(payload);
            }
        }
    }

    /// Sends FIN and waits for its acknowledgement.
    pub async fn close(self) -> Result<()> {
        let seq = self.next_seq;
        let fin = Header::new(FLAG_FIN, self.conn_id, seq, 0);
        self.socket.send_to(&encode_header(&fin), self.server).await?;

        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        loop {
            let (header, _) =
                recv_packet(&*self.socket, self.server, deadline, "awaiting fin ack").await?;
            if header.has(FLAG_ACK) && header.ack == seq {
                info!("connection to {} closed", self.server);
                return Ok(());
            }
        }
    }
}

/// Reads packets until one from `from` parses, or the deadline passes.
async fn recv_packet(
    socket: &dyn PacketSocket,
    from: SocketAddr,
    deadline: Instant,
    what: &'static str,
) -> Result<(Header, Vec<u8>)> {
    let mut buf = vec![0u8; 65536];
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(Error::Timeout(what))?;
        let (n, peer) = match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(res) => res?,
            Err(_) => return Err(Error::Timeout(what)),
        };
        if peer != from {
            continue;
        }
        let Ok(header) = decode_header(&buf[..n]) else {
            continue;
        };
        if header.version != PROTOCOL_VERSION {
            continue;
        }
        return Ok((header, buf[HEADER_LEN..n].to_vec()));
    }
}
