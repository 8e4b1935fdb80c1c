//! Two small reliable-datagram transports over connectionless carriers.
//!
//! * **FakeTCP over UDP**: an authenticated pseudo-TCP with a SYN /
//!   SYN|ACK / ACK handshake proven against a pre-shared key,
//!   per-connection state on the server, message-counted sequence numbers
//!   with cumulative acknowledgement, single-outstanding-message
//!   retransmission with exponential backoff, and request/echo delivery.
//!
//! * **ICMP tunnel**: arbitrary byte messages AES-encrypted, fragmented,
//!   and carried inside ICMP Echo packets; the server relays the plaintext
//!   to a backend UDP endpoint and tunnels the reply back the same way.
//!
//! Both engines consume the [`socket::PacketSocket`] abstraction, so they
//! run over `tokio`'s UDP socket, a Linux raw ICMP socket, or anything a
//! test harness provides. The wire codec, crypto primitives, and the
//! fragment/reassembly engine are usable on their own.
//!
//! Neither transport is a general-purpose reliable stream: there is no
//! congestion control, no sliding window, and a constant advertised window.
//! The handshake proves liveness of a key holder; it does not give forward
//! secrecy, and the tunnel's AES mode is confidentiality-only.

pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod fragment;
pub mod server;
pub mod socket;
pub mod tunnel;

pub use client::FakeTcpClient;
pub use error::{Error, Result};
pub use server::{FakeTcpServer, MessageHandler};
pub use socket::PacketSocket;
pub use tunnel::{TunnelClient, TunnelServer};
