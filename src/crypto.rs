//! Crypto primitives: PSK-keyed HMAC for the handshake, an HKDF-derived
//! AES-256-GCM session AEAD, and the confidentiality-only AES pair used by
//! the ICMP tunnel.
//!
//! The HMAC functions back the FakeTCP handshake and the AES pair backs the
//! tunnel. The session AEAD is a standalone building block: neither wire
//! path calls it (see [`SessionAead`]).
//!
//! Keys and plaintext never reach the log output.

use core::fmt::{Debug, Formatter};

use aes_gcm::{
    aead::{Aead, KeyInit, Nonce},
    Aes256Gcm,
};
use ctr::cipher::{KeyIvInit, StreamCipher};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;
type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Client nonce length in the SYN payload.
pub const HANDSHAKE_NONCE_LEN: usize = 12;
/// HMAC-SHA-256 output length.
pub const HMAC_LEN: usize = 32;
/// AES-GCM nonce length.
pub const AEAD_NONCE_LEN: usize = 12;
/// Key length for the tunnel's confidentiality-only cipher (AES-128).
pub const TUNNEL_KEY_LEN: usize = 16;
/// IV prefix length of the confidentiality-only ciphertext layout.
pub const AES_IV_LEN: usize = 16;

/// HMAC-SHA-256 of `data` under `key`.
pub fn compute_hmac(key: &[u8], data: &[u8]) -> Result<[u8; HMAC_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|_| Error::CryptoFailure("hmac key rejected"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time verification of `tag` against HMAC-SHA-256(key, data).
pub fn verify_hmac(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        return false;
    };
    mac.update(data);
    mac.verify_slice(tag).is_ok()
}

/// `n` bytes from the system CSPRNG.
pub fn rand_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// AEAD for one session, derived from the PSK and a nonce from each peer.
///
/// Deliberately not wired into either transport: the FakeTCP data plane
/// carries opaque payloads without per-packet protection (the handshake only
/// proves liveness of a key holder), and no packet on the wire carries a
/// server nonce to derive from. Exported for applications that layer an
/// authenticated channel above the transport and exchange the nonces
/// themselves.
pub struct SessionAead {
    cipher: Aes256Gcm,
}

impl Debug for SessionAead {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("SessionAead").field(&"*****").finish()
    }
}

/// Expands `psk || client_nonce || server_nonce` through HKDF-SHA-256
/// (empty salt, info `"faketcp-session"`) into an AES-256-GCM key.
pub fn derive_session_aead(
    psk: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<SessionAead> {
    let mut ikm = Vec::with_capacity(psk.len() + client_nonce.len() + server_nonce.len());
    ikm.extend_from_slice(psk);
    ikm.extend_from_slice(client_nonce);
    ikm.extend_from_slice(server_nonce);

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut key = [0u8; 32];
    hk.expand(b"faketcp-session", &mut key)
        .map_err(|_| Error::CryptoFailure("hkdf expansion failed"))?;
    Ok(SessionAead {
        cipher: Aes256Gcm::new(&key.into()),
    })
}

impl SessionAead {
    /// Seals `plain` under a fresh random nonce and returns `nonce || ciphertext`.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = rand_bytes::<AEAD_NONCE_LEN>();
        let sealed = self
            .cipher
            .encrypt(Nonce::<Aes256Gcm>::from_slice(&nonce_bytes), plain)
            .map_err(|_| Error::CryptoFailure("aead seal failed"))?;
        let mut out = Vec::with_capacity(AEAD_NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Splits off the nonce prefix and opens the remainder.
    pub fn decrypt(&self, input: &[u8]) -> Result<Vec<u8>> {
        if input.len() < AEAD_NONCE_LEN {
            return Err(Error::CryptoFailure("input too short for nonce"));
        }
        let (nonce, ct) = input.split_at(AEAD_NONCE_LEN);
        self.cipher
            .decrypt(Nonce::<Aes256Gcm>::from_slice(nonce), ct)
            .map_err(|_| Error::CryptoFailure("aead open failed"))
    }
}

/// Encrypts `plain` with AES-128-CTR under a random IV; returns `iv || ciphertext`.
///
/// Confidentiality only: nothing binds the ciphertext to the fragment header
/// around it, and a tampered ciphertext decrypts to garbage rather than an
/// error. Integrity, where a caller needs it, has to be layered on top.
pub fn aes_encrypt(key: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
    let iv = rand_bytes::<AES_IV_LEN>();
    let mut cipher = Aes128Ctr::new_from_slices(key, &iv)
        .map_err(|_| Error::ConfigError(format!("invalid aes key length {}", key.len())))?;
    let mut out = Vec::with_capacity(AES_IV_LEN + plain.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(plain);
    cipher.apply_keystream(&mut out[AES_IV_LEN..]);
    Ok(out)
}

/// Inverse of [`aes_encrypt`]. Rejects inputs shorter than the IV prefix.
pub fn aes_decrypt(key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
    if input.len() < AES_IV_LEN {
        return Err(Error::CryptoFailure("ciphertext shorter than iv"));
    }
    let (iv, ct) = input.split_at(AES_IV_LEN);
    let mut cipher = Aes128Ctr::new_from_slices(key, iv)
        .map_err(|_| Error::ConfigError(format!("invalid aes key length {}", key.len())))?;
    let mut out = ct.to_vec();
    cipher.apply_keystream(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_verifies_and_rejects() {
        let psk = b"supersecretkey123";
        let nonce = rand_bytes::<12>();
        let tag = compute_hmac(psk, &nonce).unwrap();
        assert!(verify_hmac(psk, &nonce, &tag));
        assert!(!verify_hmac(b"supersecretkey125", &nonce, &tag));

        let mut tampered = tag;
        tampered[0] ^= 1;
        assert!(!verify_hmac(psk, &nonce, &tampered));
    }

    #[test]
    fn session_aead_roundtrip() {
        let psk = b"super-secret-pre-shared-key";
        let client_nonce = rand_bytes::<16>();
        let server_nonce = rand_bytes::<16>();
        let aead = derive_session_aead(psk, &client_nonce, &server_nonce).unwrap();

        let plain = b"hello faketcp with encryption";
        let sealed = aead.encrypt(plain).unwrap();
        assert_eq!(aead.decrypt(&sealed).unwrap(), plain);
    }

    #[test]
    fn session_aead_same_inputs_same_key() {
        let psk = b"psk";
        let cn = [1u8; 16];
        let sn = [2u8; 16];
        let a = derive_session_aead(psk, &cn, &sn).unwrap();
        let b = derive_session_aead(psk, &cn, &sn).unwrap();
        let sealed = a.encrypt(b"cross-derivation").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap(), b"cross-derivation");
    }

    #[test]
    fn session_aead_detects_tampering() {
        let aead = derive_session_aead(b"psk", &[0u8; 16], &[0u8; 16]).unwrap();
        let sealed = aead.encrypt(b"payload").unwrap();
        for i in 0..sealed.len() {
            let mut copy = sealed.clone();
            copy[i] ^= 0x40;
            assert!(matches!(
                aead.decrypt(&copy),
                Err(Error::CryptoFailure(_))
            ));
        }
        // untouched input still opens
        assert_eq!(aead.decrypt(&sealed).unwrap(), b"payload");
    }

    #[test]
    fn session_aead_rejects_short_input() {
        let aead = derive_session_aead(b"psk", &[0u8; 16], &[0u8; 16]).unwrap();
        assert!(matches!(
            aead.decrypt(&[0u8; AEAD_NONCE_LEN - 1]),
            Err(Error::CryptoFailure(_))
        ));
    }

    #[test]
    fn aes_roundtrip() {
        let key = b"0123456789abcdef";
        let plain = b"This is a secret message!";
        let ct = aes_encrypt(key, plain).unwrap();
        assert_ne!(&ct[..], &plain[..]);
        assert_eq!(aes_decrypt(key, &ct).unwrap(), plain);
    }

    #[test]
    fn aes_empty_plaintext() {
        let key = b"0123456789abcdef";
        let ct = aes_encrypt(key, b"").unwrap();
        assert_eq!(ct.len(), AES_IV_LEN);
        assert_eq!(aes_decrypt(key, &ct).unwrap(), b"");
    }

    #[test]
    fn aes_rejects_bad_key_length() {
        assert!(matches!(
            aes_encrypt(b"short", b"data"),
            Err(Error::ConfigError(_))
        ));
        assert!(matches!(
            aes_decrypt(b"0123456789abcdef0", &[0u8; 32]),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn aes_rejects_short_ciphertext() {
        let key = b"0123456789abcdef";
        assert!(matches!(
            aes_decrypt(key, &[0u8; AES_IV_LEN - 1]),
            Err(Error::CryptoFailure(_))
        ));
    }
}
