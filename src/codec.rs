//! Wire codec: the 14-byte FakeTCP header, the 8-byte ICMP Echo header
//! with its one's-complement checksum, and the 6-byte fragment sub-header.
//!
//! All fields are big-endian at fixed offsets. None of the parsers verify
//! checksums; a receiver that cares checks separately.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Connection start.
pub const FLAG_SYN: u8 = 1 << 0;
/// Acknowledgement.
pub const FLAG_ACK: u8 = 1 << 1;
/// Connection end.
pub const FLAG_FIN: u8 = 1 << 2;
/// Push data.
pub const FLAG_PSH: u8 = 1 << 3;

/// Fixed size of the FakeTCP header.
pub const HEADER_LEN: usize = 14;
/// Protocol version carried in every packet. Other values are reserved.
pub const PROTOCOL_VERSION: u8 = 1;
/// Advertised window. Informational; the protocol keeps one message in flight.
pub const ADVERTISED_WINDOW: u16 = 1024;

/// Fixed size of the ICMP Echo header.
pub const ICMP_HEADER_LEN: usize = 8;
/// ICMP Echo request type.
pub const ICMP_ECHO_REQUEST: u8 = 8;
/// ICMP Echo reply type.
pub const ICMP_ECHO_REPLY: u8 = 0;

/// Fixed size of the fragment sub-header: session(2) + seq(2) + idx(1) + total(1).
pub const FRAGMENT_HEADER_LEN: usize = 6;

/// The FakeTCP packet header.
///
/// Sequence numbers count messages, not bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub conn_id: u16,
    pub window: u16,
    pub seq: u32,
    pub ack: u32,
}

impl Header {
    /// Header with the given flags and the crate's fixed version and window.
    pub fn new(flags: u8, conn_id: u16, seq: u32, ack: u32) -> Self {
        Header {
            version: PROTOCOL_VERSION,
            flags,
            conn_id,
            window: ADVERTISED_WINDOW,
            seq,
            ack,
        }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Writes the header fields at their fixed offsets.
pub fn encode_header(h: &Header) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0] = h.version;
    buf[1] = h.flags;
    BigEndian::write_u16(&mut buf[2..4], h.conn_id);
    BigEndian::write_u16(&mut buf[4..6], h.window);
    BigEndian::write_u32(&mut buf[6..10], h.seq);
    BigEndian::write_u32(&mut buf[10..14], h.ack);
    buf
}

/// Reads a header back out. Fails on fewer than 14 bytes.
pub fn decode_header(buf: &[u8]) -> Result<Header> {
    if buf.len() < HEADER_LEN {
        return Err(Error::MalformedPacket("short header"));
    }
    Ok(Header {
        version: buf[0],
        flags: buf[1],
        conn_id: BigEndian::read_u16(&buf[2..4]),
        window: BigEndian::read_u16(&buf[4..6]),
        seq: BigEndian::read_u32(&buf[6..10]),
        ack: BigEndian::read_u32(&buf[10..14]),
    })
}

/// Header followed by payload, in one buffer.
pub fn encode_packet(h: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&encode_header(h));
    buf.extend_from_slice(payload);
    buf
}

/// Assembles an ICMP Echo message: 8-byte header with the checksum patched
/// in over (header || payload).
pub fn build_icmp_echo(typ: u8, code: u8, id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    buf.extend_from_slice(&[typ, code, 0, 0]);
    let mut words = [0u8; 4];
    BigEndian::write_u16(&mut words[0..2], id);
    BigEndian::write_u16(&mut words[2..4], seq);
    buf.extend_from_slice(&words);
    buf.extend_from_slice(payload);
    let check = icmp_checksum(&buf);
    BigEndian::write_u16(&mut buf[2..4], check);
    buf
}

/// Splits an ICMP Echo message into its fields. Requires at least 8 bytes.
/// The checksum is not verified here.
pub fn parse_icmp_echo(pkt: &[u8]) -> Result<(u8, u8, u16, u16, &[u8])> {
    if pkt.len() < ICMP_HEADER_LEN {
        return Err(Error::MalformedPacket("icmp packet too short"));
    }
    let typ = pkt[0];
    let code = pkt[1];
    let id = BigEndian::read_u16(&pkt[4..6]);
    let seq = BigEndian::read_u16(&pkt[6..8]);
    Ok((typ, code, id, seq, &pkt[ICMP_HEADER_LEN..]))
}

/// One's-complement sum of 16-bit big-endian words, odd trailing byte
/// padded high, carries folded, complemented.
pub fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        sum += u32::from(BigEndian::read_u16(&data[i..i + 2]));
        i += 2;
    }
    if data.len() % 2 != 0 {
        sum += u32::from(data[data.len() - 1]) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Prefixes `data` with the fragment sub-header.
pub fn build_fragment_payload(session: u16, seq: u16, idx: u8, total: u8, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAGMENT_HEADER_LEN + data.len());
    let mut head = [0u8; FRAGMENT_HEADER_LEN];
    BigEndian::write_u16(&mut head[0..2], session);
    BigEndian::write_u16(&mut head[2..4], seq);
    head[4] = idx;
    head[5] = total;
    buf.extend_from_slice(&head);
    buf.extend_from_slice(data);
    buf
}

/// Splits a fragment payload into sub-header fields and data.
pub fn parse_fragment_payload(buf: &[u8]) -> Result<(u16, u16, u8, u8, &[u8])> {
    if buf.len() < FRAGMENT_HEADER_LEN {
        return Err(Error::MalformedPacket("fragment too short"));
    }
    let session = BigEndian::read_u16(&buf[0..2]);
    let seq = BigEndian::read_u16(&buf[2..4]);
    let idx = buf[4];
    let total = buf[5];
    Ok((session, seq, idx, total, &buf[FRAGMENT_HEADER_LEN..]))
}
