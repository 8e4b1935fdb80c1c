//! ICMP tunnel: encrypted UDP payloads carried inside ICMP Echo packets.
//!
//! Outbound, a message is AES-encrypted, fragmented, and sent as one Echo
//! request per fragment. The server reassembles, decrypts, forwards the
//! plaintext to its backend UDP endpoint, and returns the backend's reply
//! through the same channel, encrypted and fragmented the same way.
//! Undecryptable or unparseable ingress is dropped; there is no sender to
//! notify at this layer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::net::UdpSocket;

use crate::codec::{
    build_icmp_echo, parse_fragment_payload, parse_icmp_echo, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST,
};
use crate::crypto::{aes_decrypt, aes_encrypt, TUNNEL_KEY_LEN};
use crate::error::{Error, Result};
use crate::fragment::{fragment, Reassembler};
use crate::socket::PacketSocket;

/// Default upper bound on fragment data bytes.
pub const DEFAULT_MAX_FRAGMENT_LEN: usize = 1400;
/// Partial reassembly sets are dropped after this long.
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the client waits for the tunneled response.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
/// How long the server waits for the backend's UDP reply.
pub const BACKEND_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

fn tunnel_key(key: &[u8]) -> Result<[u8; TUNNEL_KEY_LEN]> {
    key.try_into().map_err(|_| {
        Error::ConfigError(format!(
            "tunnel key must be {} bytes, got {}",
            TUNNEL_KEY_LEN,
            key.len()
        ))
    })
}

/// Client end of the tunnel. One request, one reassembled reply.
pub struct TunnelClient {
    socket: Arc<dyn PacketSocket>,
    key: [u8; TUNNEL_KEY_LEN],
    session: u16,
    next_seq: u16,
    max_fragment_len: usize,
}

impl TunnelClient {
    /// Session identifier defaults to the process id truncated to 16 bits.
    pub fn new(socket: Arc<dyn PacketSocket>, key: &[u8]) -> Result<Self> {
        Ok(TunnelClient {
            socket,
            key: tunnel_key(key)?,
            session: (std::process::id() & 0xFFFF) as u16,
            next_seq: 1,
            max_fragment_len: DEFAULT_MAX_FRAGMENT_LEN,
        })
    }

    pub fn with_session(mut self, session: u16) -> Self {
        self.session = session;
        self
    }

    pub fn with_max_fragment_len(mut self, max_len: usize) -> Self {
        self.max_fragment_len = max_len;
        self
    }

    /// Tunnels `data` to the server and returns the backend's reply.
    ///
    /// Each message takes the next sequence number, so replies to distinct
    /// in-flight messages of one session reassemble under distinct keys.
    pub async fn send(&mut self, server: SocketAddr, data: &[u8]) -> Result<Vec<u8>> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let sealed = aes_encrypt(&self.key, data)?;
        let frags = fragment(self.session, seq, &sealed, self.max_fragment_len)?;
        debug!(
            "session {} seq {}: sending {} fragment(s)",
            self.session,
            seq,
            frags.len()
        );
        for frag in &frags {
            let pkt = build_icmp_echo(ICMP_ECHO_REQUEST, 0, self.session, seq, frag);
            self.socket.send_to(&pkt, server).await?;
        }

        let mut reasm = Reassembler::new(DEFAULT_REASSEMBLY_TIMEOUT);
        let deadline = Instant::now() + RESPONSE_TIMEOUT;
        let mut buf = vec![0u8; 65536];
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::Timeout("awaiting tunnel response"))?;
            let (n, _) = match tokio::time::timeout(remaining, self.socket.recv_from(&mut buf)).await
            {
                Ok(res) => res?,
                Err(_) => return Err(Error::Timeout("awaiting tunnel response")),
            };
            let Ok((typ, _, _, _, payload)) = parse_icmp_echo(&buf[..n]) else {
                continue;
            };
            if typ != ICMP_ECHO_REPLY {
                continue;
            }
            let Ok((session, msg_seq, idx, total, part)) = parse_fragment_payload(payload) else {
                continue;
            };
            if session != self.session || msg_seq != seq {
                continue;
            }
            if let Some(assembled) = reasm.add(session, msg_seq, idx, total, part) {
                return aes_decrypt(&self.key, &assembled);
            }
        }
    }
}

/// Server end of the tunnel: reassembles requests, relays them to a backend
/// UDP endpoint, and echoes the reply back to the requester.
pub struct TunnelServer {
    socket: Arc<dyn PacketSocket>,
    backend: SocketAddr,
    key: [u8; TUNNEL_KEY_LEN],
    max_fragment_len: usize,
    reassembly_timeout: Duration,
}

impl TunnelServer {
    pub fn new(socket: Arc<dyn PacketSocket>, backend: SocketAddr, key: &[u8]) -> Result<Self> {
        Ok(TunnelServer {
            socket,
            backend,
            key: tunnel_key(key)?,
            max_fragment_len: DEFAULT_MAX_FRAGMENT_LEN,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
        })
    }

    pub fn with_max_fragment_len(mut self, max_len: usize) -> Self {
        self.max_fragment_len = max_len;
        self
    }

    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> Self {
        self.reassembly_timeout = timeout;
        self
    }

    /// Relay loop. Reply fragments reuse the request's session and message
    /// sequence, which is what the requester's filter keys on.
    pub async fn run(&self) -> Result<()> {
        let backend = UdpSocket::bind("0.0.0.0:0").await?;
        backend.connect(self.backend).await?;
        info!("icmp tunnel forwarding to {}", self.backend);

        let mut reasm = Reassembler::new(self.reassembly_timeout);
        let mut buf = vec![0u8; 65536];
        let mut rbuf = vec![0u8; 65536];
        loop {
            let (n, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("receive error: {}", e);
                    continue;
                }
            };
            let Ok((typ, _, _, _, payload)) = parse_icmp_echo(&buf[..n]) else {
                continue;
            };
            if typ != ICMP_ECHO_REQUEST {
                continue;
            }
            let Ok((session, seq, idx, total, part)) = parse_fragment_payload(payload) else {
                continue;
            };
            let Some(assembled) = reasm.add(session, seq, idx, total, part) else {
                continue;
            };
            let request = match aes_decrypt(&self.key, &assembled) {
                Ok(plain) => plain,
                Err(e) => {
                    warn!("dropping request from {}: {}", peer, e);
                    continue;
                }
            };

            debug!(
                "session {} seq {}: {} bytes to backend",
                session,
                seq,
                request.len()
            );
            if let Err(e) = backend.send(&request).await {
                warn!("backend send failed: {}", e);
                continue;
            }
            // A silent backend still gets an (empty) reply tunneled back.
            let reply = match tokio::time::timeout(BACKEND_REPLY_TIMEOUT, backend.recv(&mut rbuf))
                .await
            {
                Ok(Ok(nr)) => rbuf[..nr].to_vec(),
                Ok(Err(e)) => {
                    warn!("backend read failed: {}", e);
                    Vec::new()
                }
                Err(_) => Vec::new(),
            };

            let sealed = match aes_encrypt(&self.key, &reply) {
                Ok(sealed) => sealed,
                Err(e) => {
                    warn!("reply encryption failed: {}", e);
                    continue;
                }
            };
            let frags = match fragment(session, seq, &sealed, self.max_fragment_len) {
                Ok(frags) => frags,
                Err(e) => {
                    warn!("reply for session {} not fragmentable: {}", session, e);
                    continue;
                }
            };
            for frag in &frags {
                let pkt = build_icmp_echo(ICMP_ECHO_REPLY, 0, session, seq, frag);
                if let Err(e) = self.socket.send_to(&pkt, peer).await {
                    warn!("reply send to {} failed: {}", peer, e);
                }
            }
        }
    }
}
