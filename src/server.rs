//! FakeTCP server engine.
//!
//! One receive task reads packets off the socket and fans each one out to
//! its own task. Connection records live in a table keyed by peer address;
//! the table lock is held only for map operations, and every handler for a
//! given peer serializes on that connection's own lock, so per-peer state
//! mutation is ordered even under parallel dispatch.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::codec::{
    decode_header, encode_header, encode_packet, Header, FLAG_ACK, FLAG_FIN, FLAG_PSH, FLAG_SYN,
    HEADER_LEN, PROTOCOL_VERSION,
};
use crate::crypto::{verify_hmac, HANDSHAKE_NONCE_LEN, HMAC_LEN};
use crate::error::Result;
use crate::socket::PacketSocket;

/// First connection id handed out.
pub const INITIAL_CONN_ID: u16 = 0x1000;
/// Server-side sequence counter at accept time.
pub const INITIAL_SERVER_SEQ: u32 = 1000;
/// Connections idle longer than this are evicted by the sweep task.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Called once per in-order delivered message.
pub type MessageHandler = Arc<dyn Fn(SocketAddr, &[u8]) + Send + Sync>;

/// Per-peer connection record. Sequence numbers count messages.
#[derive(Debug)]
struct ConnState {
    conn_id: u16,
    peer: SocketAddr,
    server_seq: u32,
    expected_seq: u32,
    last_activity: Instant,
    established: bool,
}

/// The server half of the FakeTCP protocol: authenticated accept, in-order
/// delivery with echo replies, FIN teardown, idle eviction.
pub struct FakeTcpServer {
    socket: Arc<dyn PacketSocket>,
    psk: Vec<u8>,
    conns: Mutex<HashMap<SocketAddr, Arc<Mutex<ConnState>>>>,
    next_id: AtomicU16,
    idle_timeout: Duration,
    handler: MessageHandler,
}

impl FakeTcpServer {
    /// Binds a UDP socket on `listen` and wraps it in a server.
    pub async fn bind(
        listen: &str,
        psk: impl Into<Vec<u8>>,
        handler: MessageHandler,
    ) -> Result<Arc<Self>> {
        let socket = tokio::net::UdpSocket::bind(listen).await?;
        Ok(Self::with_socket(
            Arc::new(socket),
            psk,
            DEFAULT_IDLE_TIMEOUT,
            handler,
        ))
    }

    /// Builds a server over any packet socket.
    pub fn with_socket(
        socket: Arc<dyn PacketSocket>,
        psk: impl Into<Vec<u8>>,
        idle_timeout: Duration,
        handler: MessageHandler,
    ) -> Arc<Self> {
        Arc::new(FakeTcpServer {
            socket,
            psk: psk.into(),
            conns: Mutex::new(HashMap::new()),
            next_id: AtomicU16::new(INITIAL_CONN_ID),
            idle_timeout,
            handler,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive loop. Runs until the socket fails permanently; each packet
    /// is dispatched on its own task.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.sweep_idle().await });

        let mut buf = vec![0u8; 65536];
        loop {
            let (n, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("receive error: {}", e);
                    continue;
                }
            };
            let pkt = buf[..n].to_vec();
            let me = self.clone();
            tokio::spawn(async move { me.handle_packet(peer, pkt).await });
        }
    }

    async fn handle_packet(&self, peer: SocketAddr, pkt: Vec<u8>) {
        let Ok(header) = decode_header(&pkt) else {
            return;
        };
        if header.version != PROTOCOL_VERSION {
            return;
        }
        let payload = &pkt[HEADER_LEN..];

        // SYNs always take the handshake path, so a retransmitted or
        // restarted handshake resynchronizes an existing record instead of
        // being silently ignored.
        if header.has(FLAG_SYN) && !header.has(FLAG_ACK) {
            self.handle_syn(peer, &header, payload).await;
            return;
        }

        let existing = self.conns.lock().await.get(&peer).cloned();
        match existing {
            None => {} // non-SYN from an unknown peer: drop
            Some(conn) => self.handle_known_peer(conn, &header, payload).await,
        }
    }

    /// SYN path: authenticate, allocate (or resync) state, reply SYN|ACK.
    async fn handle_syn(&self, peer: SocketAddr, header: &Header, payload: &[u8]) {
        if payload.len() < HANDSHAKE_NONCE_LEN + HMAC_LEN {
            warn!("short SYN payload from {}", peer);
            self.reject(peer).await;
            return;
        }
        let (nonce, tag) = payload.split_at(HANDSHAKE_NONCE_LEN);
        if !verify_hmac(&self.psk, nonce, &tag[..HMAC_LEN]) {
            warn!("invalid client HMAC from {}", peer);
            self.reject(peer).await;
            return;
        }

        // Check-and-insert in one critical section. An authenticated SYN for
        // a peer that already has a record resyncs the record (idempotent
        // for a plain retransmission) instead of allocating a second one.
        let (conn_id, server_seq) = {
            let mut conns = self.conns.lock().await;
            if let Some(conn) = conns.get(&peer).cloned() {
                drop(conns);
                let mut cs = conn.lock().await;
                cs.last_activity = Instant::now();
                cs.expected_seq = header.seq.wrapping_add(1);
                (cs.conn_id, cs.server_seq)
            } else {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                conns.insert(
                    peer,
                    Arc::new(Mutex::new(ConnState {
                        conn_id: id,
                        peer,
                        server_seq: INITIAL_SERVER_SEQ,
                        expected_seq: header.seq.wrapping_add(1),
                        last_activity: Instant::now(),
                        established: true,
                    })),
                );
                info!("accepted connection from {} conn_id={:#06x}", peer, id);
                (id, INITIAL_SERVER_SEQ)
            }
        };
        self.send_header(&Header::new(FLAG_SYN | FLAG_ACK, conn_id, server_seq, header.seq), peer)
            .await;
    }

    /// Authentication failure: one FIN|ACK with conn_id 0, no state kept.
    async fn reject(&self, peer: SocketAddr) {
        let fin = Header {
            version: PROTOCOL_VERSION,
            flags: FLAG_FIN | FLAG_ACK,
            conn_id: 0,
            window: 0,
            seq: 0,
            ack: 0,
        };
        self.send_header(&fin, peer).await;
    }

    async fn handle_known_peer(
        &self,
        conn: Arc<Mutex<ConnState>>,
        header: &Header,
        payload: &[u8],
    ) {
        let mut cs = conn.lock().await;
        cs.last_activity = Instant::now();
        let peer = cs.peer;

        if header.has(FLAG_PSH) {
            if header.seq != cs.expected_seq {
                debug!(
                    "out-of-order PSH from {}: expected {}, received {}",
                    peer, cs.expected_seq, header.seq
                );
                let ack = Header::new(
                    FLAG_ACK,
                    cs.conn_id,
                    cs.server_seq,
                    cs.expected_seq.wrapping_sub(1),
                );
                self.send_header(&ack, peer).await;
                return;
            }

            debug!("delivering {} bytes from {}", payload.len(), peer);
            (self.handler)(peer, payload);
            cs.expected_seq = cs.expected_seq.wrapping_add(1);

            let ack = Header::new(FLAG_ACK, cs.conn_id, cs.server_seq, header.seq);
            self.send_header(&ack, peer).await;

            // Echo the payload back under the server's own counter.
            cs.server_seq = cs.server_seq.wrapping_add(1);
            let echo = Header::new(FLAG_PSH, cs.conn_id, cs.server_seq, header.seq);
            self.send_packet(&echo, payload, peer).await;
            return;
        }

        if header.has(FLAG_FIN) {
            let ack = Header::new(FLAG_ACK, cs.conn_id, cs.server_seq, header.seq);
            self.send_header(&ack, peer).await;
            let conn_id = cs.conn_id;
            drop(cs);
            self.conns.lock().await.remove(&peer);
            info!("connection from {} conn_id={:#06x} closed", peer, conn_id);
            return;
        }

        if header.has(FLAG_ACK) && header.ack == cs.server_seq && cs.established {
            info!("handshake completed with {} conn_id={:#06x}", peer, cs.conn_id);
        }
    }

    /// Evicts connections whose last activity is older than the ceiling.
    async fn sweep_idle(&self) {
        let period = (self.idle_timeout / 2).max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;

            let snapshot: Vec<(SocketAddr, Arc<Mutex<ConnState>>)> = self
                .conns
                .lock()
                .await
                .iter()
                .map(|(peer, conn)| (*peer, conn.clone()))
                .collect();

            let now = Instant::now();
            let mut stale = Vec::new();
            for (peer, conn) in snapshot {
                let cs = conn.lock().await;
                if now.duration_since(cs.last_activity) > self.idle_timeout {
                    stale.push(peer);
                }
            }
            if stale.is_empty() {
                continue;
            }
            let mut conns = self.conns.lock().await;
            for peer in stale {
                if conns.remove(&peer).is_some() {
                    info!("evicted idle connection {}", peer);
                }
            }
        }
    }

    async fn send_header(&self, header: &Header, peer: SocketAddr) {
        if let Err(e) = self.socket.send_to(&encode_header(header), peer).await {
            warn!("send to {} failed: {}", peer, e);
        }
    }

    async fn send_packet(&self, header: &Header, payload: &[u8], peer: SocketAddr) {
        if let Err(e) = self.socket.send_to(&encode_packet(header, payload), peer).await {
            warn!("send to {} failed: {}", peer, e);
        }
    }
}
