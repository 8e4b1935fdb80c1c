//! ICMP tunnel end to end over the packet-socket abstraction, with a UDP
//! echo backend. The framing is identical to the raw-socket deployment;
//! only the carrier differs.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use faketcp_tunnel::error::Error;
use faketcp_tunnel::tunnel::{TunnelClient, TunnelServer};

const KEY: &[u8] = b"0123456789abcdef";

/// UDP backend replying `ECHO: ` + request.
async fn start_backend() -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((n, peer)) = sock.recv_from(&mut buf).await else {
                return;
            };
            let mut response = b"ECHO: ".to_vec();
            response.extend_from_slice(&buf[..n]);
            let _ = sock.send_to(&response, peer).await;
        }
    });
    addr
}

async fn start_tunnel_server(backend: SocketAddr, max_fragment_len: usize) -> SocketAddr {
    let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = sock.local_addr().unwrap();
    let server = TunnelServer::new(sock, backend, KEY)
        .unwrap()
        .with_max_fragment_len(max_fragment_len);
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    addr
}

async fn tunnel_client(session: u16, max_fragment_len: usize) -> TunnelClient {
    let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    TunnelClient::new(sock, KEY)
        .unwrap()
        .with_session(session)
        .with_max_fragment_len(max_fragment_len)
}

#[tokio::test]
async fn request_is_relayed_and_reply_comes_back() {
    let backend = start_backend().await;
    let server = start_tunnel_server(backend, 1400).await;
    let mut client = tunnel_client(1234, 1400).await;

    let resp = client.send(server, b"Hello ").await.unwrap();
    assert_eq!(resp, b"ECHO: Hello ");

    // a second message on the same session
    let resp = client.send(server, b"Hello ").await.unwrap();
    assert_eq!(resp, b"ECHO: Hello ");
}

#[tokio::test]
async fn large_message_fragments_both_ways() {
    let backend = start_backend().await;
    // Each direction needs several fragments: the payload is far larger
    // than the 10-byte data limit, and the AES layout adds 16 bytes of IV.
    let server = start_tunnel_server(backend, 10).await;
    let mut client = tunnel_client(77, 10).await;

    let payload = b"Hello, this is a test payload for fragmenting and reassembling!";
    let resp = client.send(server, payload).await.unwrap();

    let mut expected = b"ECHO: ".to_vec();
    expected.extend_from_slice(payload);
    assert_eq!(resp, expected);
}

#[tokio::test]
async fn distinct_sessions_do_not_collide() {
    let backend = start_backend().await;
    let server = start_tunnel_server(backend, 1400).await;

    let mut a = tunnel_client(1, 1400).await;
    let mut b = tunnel_client(2, 1400).await;
    let ra = a.send(server, b"from a").await.unwrap();
    let rb = b.send(server, b"from b").await.unwrap();
    assert_eq!(ra, b"ECHO: from a");
    assert_eq!(rb, b"ECHO: from b");
}

#[tokio::test]
async fn wrong_key_request_is_dropped() {
    let backend = start_backend().await;
    let server = start_tunnel_server(backend, 1400).await;

    let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let mut client = TunnelClient::new(sock, b"ffffffffffffffff")
        .unwrap()
        .with_session(9);

    // The server cannot decrypt the request, drops it, and never replies.
    let err = client.send(server, b"garbled").await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {:?}", err);
}
