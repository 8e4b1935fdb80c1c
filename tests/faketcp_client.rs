//! Client engine against a scripted mock server, plus loss-injection via a
//! wrapper socket against the real server.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use faketcp_tunnel::codec::{
    decode_header, encode_header, encode_packet, Header, FLAG_ACK, FLAG_PSH, FLAG_SYN, HEADER_LEN,
};
use faketcp_tunnel::error::Error;
use faketcp_tunnel::server::{FakeTcpServer, MessageHandler};
use faketcp_tunnel::socket::PacketSocket;
use faketcp_tunnel::FakeTcpClient;

const PSK: &[u8] = b"supersecretkey123";

/// Replies SYN|ACK to any SYN and ACK-then-echo to any PSH; keeps no state.
async fn start_mock_server() -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 65536];
        loop {
            let Ok((n, peer)) = sock.recv_from(&mut buf).await else {
                return;
            };
            let Ok(h) = decode_header(&buf[..n]) else {
                continue;
            };
            if h.has(FLAG_SYN) {
                let resp = Header::new(FLAG_SYN | FLAG_ACK, 0x1000, 9999, h.seq);
                let _ = sock.send_to(&encode_header(&resp), peer).await;
                continue;
            }
            if h.has(FLAG_PSH) {
                let ack = Header::new(FLAG_ACK, h.conn_id, 0, h.seq);
                let _ = sock.send_to(&encode_header(&ack), peer).await;
                let echo = Header::new(FLAG_PSH, h.conn_id, 2000, h.seq);
                let payload = buf[HEADER_LEN..n].to_vec();
                let _ = sock.send_to(&encode_packet(&echo, &payload), peer).await;
                continue;
            }
        }
    });
    addr
}

#[tokio::test]
async fn handshake_and_reliable_send_with_echo() {
    let server = start_mock_server().await;
    let mut client = FakeTcpClient::connect(server, PSK).await.unwrap();
    assert_eq!(client.conn_id(), 0x1000);
    assert_eq!(client.server_seq(), 9999);

    for _ in 0..3 {
        client.send(b"test-message").await.unwrap();
        let echo = client.recv_echo(Duration::from_secs(2)).await.unwrap();
        assert_eq!(echo, b"test-message");
    }
}

#[tokio::test]
async fn handshake_times_out_against_silent_peer() {
    // bound but never answers
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap();

    let err = FakeTcpClient::connect(addr, PSK).await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {:?}", err);
}

#[tokio::test]
async fn wrong_psk_is_surfaced_as_auth_failure() {
    let handler: MessageHandler = Arc::new(|_, _: &[u8]| {});
    let server = FakeTcpServer::bind("127.0.0.1:0", PSK, handler)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    let err = FakeTcpClient::connect(addr, b"supersecretkey125")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AuthFailure), "got {:?}", err);
}

/// Swallows the first `drops` outgoing PSH transmissions.
struct LossySocket {
    inner: UdpSocket,
    drops: AtomicUsize,
}

#[async_trait]
impl PacketSocket for LossySocket {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        if buf.len() > 1 && buf[1] & FLAG_PSH != 0 {
            let remaining = self.drops.load(Ordering::Relaxed);
            if remaining > 0 {
                self.drops.store(remaining - 1, Ordering::Relaxed);
                return Ok(buf.len()); // lost on the "wire"
            }
        }
        tokio::net::UdpSocket::send_to(&self.inner, buf, peer).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::recv_from(&self.inner, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(&self.inner)
    }
}

#[tokio::test]
async fn retransmission_delivers_exactly_once_under_loss() {
    let delivered = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let sink = delivered.clone();
    let handler: MessageHandler = Arc::new(move |_, payload: &[u8]| {
        sink.lock().unwrap().push(payload.to_vec());
    });
    let server = FakeTcpServer::bind("127.0.0.1:0", PSK, handler)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    let lossy = Arc::new(LossySocket {
        inner: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        drops: AtomicUsize::new(2),
    });
    let mut client = FakeTcpClient::connect_with_socket(lossy, addr, PSK)
        .await
        .unwrap();

    // First two transmissions vanish; the third attempt gets through and
    // the message is delivered exactly once.
    client.send(b"survives loss").await.unwrap();
    let echo = client.recv_echo(Duration::from_secs(2)).await.unwrap();
    assert_eq!(echo, b"survives loss");

    let got = delivered.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0], b"survives loss");
}
