//! Error kinds shared by both transports.
//!
//! Session-level problems (handshake, send exhaustion, crypto) propagate to
//! the caller, and configuration problems are fatal at startup. Packet-level
//! problems the engines handle locally and silently (a stray sequence number
//! gets a cumulative ACK, an unknown peer is dropped) never become values of
//! this enum; only the malformed-input kind appears here because the codec's
//! parsers return it.

use std::fmt::{self, Display, Formatter};
use std::io;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors produced by the protocol core.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A packet or frame was too short or otherwise unparseable.
    /// The parameter names the layer that rejected it.
    MalformedPacket(&'static str),

    /// The SYN payload's HMAC did not verify, or the server rejected
    /// the handshake with a FIN|ACK carrying conn_id 0.
    AuthFailure,

    /// A deadline expired. The parameter names the operation that timed out.
    Timeout(&'static str),

    /// The reliable send gave up after exhausting its retransmission budget.
    AttemptsExhausted,

    /// An AEAD open failed, or a ciphertext had an invalid length.
    CryptoFailure(&'static str),

    /// Invalid configuration: fragment limit too small, bad key length,
    /// unparseable config file.
    ConfigError(String),

    /// An underlying socket or file operation failed.
    Io(io::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedPacket(what) => write!(f, "malformed packet: {}", what),
            Error::AuthFailure => write!(f, "authentication failure"),
            Error::Timeout(what) => write!(f, "timeout: {}", what),
            Error::AttemptsExhausted => write!(f, "no ack after all attempts"),
            Error::CryptoFailure(what) => write!(f, "crypto failure: {}", what),
            Error::ConfigError(what) => write!(f, "config error: {}", what),
            Error::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => inner,
            Error::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, err.to_string()),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
