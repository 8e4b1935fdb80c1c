//! Message fragmentation and out-of-order reassembly.
//!
//! A message is split into at most 255 fragments addressed by
//! `(session, seq, index, total)`; the reassembler collects them keyed by
//! `(session, seq)` and hands the concatenation back once every index is
//! present. Partial sets are evicted after a timeout.
//!
//! Fragments are unauthenticated at this layer. Callers that need integrity
//! encrypt before fragmenting.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::codec::{build_fragment_payload, FRAGMENT_HEADER_LEN};
use crate::error::{Error, Result};

/// Smallest permitted fragment limit: the 6-byte sub-header plus 4 data bytes.
pub const MIN_FRAGMENT_LEN: usize = FRAGMENT_HEADER_LEN + 4;

/// Splits `data` into fragment payloads of at most `max_len` data bytes each.
///
/// Empty input still produces a single zero-data fragment, so `total >= 1`
/// holds for every message on the wire.
pub fn fragment(session: u16, seq: u16, data: &[u8], max_len: usize) -> Result<Vec<Vec<u8>>> {
    if max_len < MIN_FRAGMENT_LEN {
        return Err(Error::ConfigError(format!(
            "fragment max_len {} below minimum {}",
            max_len, MIN_FRAGMENT_LEN
        )));
    }
    let mut total = (data.len() + max_len - 1) / max_len;
    if total == 0 {
        total = 1;
    }
    if total > u8::MAX as usize {
        return Err(Error::ConfigError(format!(
            "message of {} bytes needs {} fragments, limit is {}",
            data.len(),
            total,
            u8::MAX
        )));
    }

    let mut frags = Vec::with_capacity(total);
    for i in 0..total {
        let start = i * max_len;
        let end = (start + max_len).min(data.len());
        frags.push(build_fragment_payload(
            session,
            seq,
            i as u8,
            total as u8,
            &data[start..end],
        ));
    }
    Ok(frags)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    session: u16,
    seq: u16,
}

#[derive(Debug)]
struct PartialMessage {
    parts: HashMap<u8, Vec<u8>>,
    deadline: Instant,
}

/// Collects fragments until a `(session, seq)` set is complete.
///
/// Entries are created lazily on the first fragment and dropped either on
/// successful assembly or once their deadline passes. Duplicate indices
/// overwrite; retransmissions are therefore idempotent.
#[derive(Debug)]
pub struct Reassembler {
    pending: HashMap<FragmentKey, PartialMessage>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Reassembler {
            pending: HashMap::new(),
            timeout,
        }
    }

    /// Stores one fragment; returns the assembled message once all `total`
    /// indices are present, `None` while the set is incomplete.
    ///
    /// Fragments violating `index < total` or carrying `total == 0` are
    /// dropped silently, as is anything addressed to an expired entry's key
    /// (the entry is gone, a fresh one starts a new deadline).
    pub fn add(&mut self, session: u16, seq: u16, idx: u8, total: u8, data: &[u8]) -> Option<Vec<u8>> {
        self.sweep();

        if total == 0 || idx >= total {
            return None;
        }

        let key = FragmentKey { session, seq };
        let deadline = Instant::now() + self.timeout;
        let entry = self.pending.entry(key).or_insert_with(|| PartialMessage {
            parts: HashMap::new(),
            deadline,
        });
        entry.parts.insert(idx, data.to_vec());

        if entry.parts.len() < total as usize {
            return None;
        }
        // A peer may have shrunk `total` after the entry was created; only
        // a gap-free 0..total run assembles.
        let mut assembled = Vec::new();
        for i in 0..total {
            let part = entry.parts.get(&i)?;
            assembled.extend_from_slice(part);
        }
        self.pending.remove(&key);
        Some(assembled)
    }

    /// Evicts every partial set whose deadline has passed.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        self.pending.retain(|_, entry| entry.deadline > now);
    }

    /// Number of partial sets currently held.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_fragment_payload;

    #[test]
    fn fragment_reassemble_reverse_order() {
        let data = b"Hello, this is a test payload for fragmenting and reassembling!";
        let frags = fragment(1234, 1, data, 10).unwrap();
        assert_eq!(frags.len(), 7);

        let mut r = Reassembler::new(Duration::from_secs(2));
        let mut assembled = None;
        for frag in frags.iter().rev() {
            let (session, seq, idx, total, part) = parse_fragment_payload(frag).unwrap();
            if let Some(out) = r.add(session, seq, idx, total, part) {
                assert!(assembled.is_none(), "completed more than once");
                assembled = Some(out);
            }
        }
        assert_eq!(assembled.as_deref(), Some(&data[..]));
        assert_eq!(r.pending_len(), 0);
    }

    #[test]
    fn strict_subset_stays_incomplete() {
        let data = vec![7u8; 95];
        let frags = fragment(9, 3, &data, 10).unwrap();
        let mut r = Reassembler::new(Duration::from_secs(2));
        for frag in frags.iter().skip(1) {
            let (session, seq, idx, total, part) = parse_fragment_payload(frag).unwrap();
            assert!(r.add(session, seq, idx, total, part).is_none());
        }
        assert_eq!(r.pending_len(), 1);
    }

    #[test]
    fn empty_message_is_one_empty_fragment() {
        let frags = fragment(5, 8, b"", 1400).unwrap();
        assert_eq!(frags.len(), 1);
        let (session, seq, idx, total, data) = parse_fragment_payload(&frags[0]).unwrap();
        assert_eq!((session, seq, idx, total), (5, 8, 0, 1));
        assert!(data.is_empty());

        let mut r = Reassembler::new(Duration::from_secs(1));
        assert_eq!(r.add(session, seq, idx, total, data).as_deref(), Some(&b""[..]));
    }

    #[test]
    fn max_len_too_small() {
        assert!(matches!(
            fragment(1, 1, b"data", 9),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn duplicate_fragment_is_idempotent() {
        let frags = fragment(2, 2, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12], 10).unwrap();
        assert_eq!(frags.len(), 2);
        let mut r = Reassembler::new(Duration::from_secs(2));

        let (s, q, i0, t, d0) = parse_fragment_payload(&frags[0]).unwrap();
        assert!(r.add(s, q, i0, t, d0).is_none());
        assert!(r.add(s, q, i0, t, d0).is_none());
        let (_, _, i1, _, d1) = parse_fragment_payload(&frags[1]).unwrap();
        assert_eq!(
            r.add(s, q, i1, t, d1).unwrap(),
            vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
        );
    }

    #[test]
    fn expired_entry_forgets_fragments() {
        let mut r = Reassembler::new(Duration::from_millis(30));
        assert!(r.add(1, 1, 0, 2, b"left").is_none());
        std::thread::sleep(Duration::from_millis(60));
        // The old half is gone; the late sibling starts a fresh entry.
        assert!(r.add(1, 1, 1, 2, b"right").is_none());
        assert_eq!(r.pending_len(), 1);
    }

    #[test]
    fn invalid_index_dropped() {
        let mut r = Reassembler::new(Duration::from_secs(1));
        assert!(r.add(1, 1, 2, 2, b"bad").is_none());
        assert!(r.add(1, 1, 0, 0, b"bad").is_none());
        assert_eq!(r.pending_len(), 0);
    }

    #[test]
    fn sessions_do_not_mix() {
        let mut r = Reassembler::new(Duration::from_secs(2));
        assert!(r.add(1, 1, 0, 2, b"aa").is_none());
        assert!(r.add(2, 1, 0, 2, b"bb").is_none());
        assert_eq!(r.add(1, 1, 1, 2, b"cc").unwrap(), b"aacc");
        assert_eq!(r.pending_len(), 1);
    }
}
