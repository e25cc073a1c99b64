//! The encrypted control stream that follows a successful pairing
//!
//! Both directions share one counter. Each message the host sends takes the
//! next counter value as its nonce, and the device answers under the same
//! nonce.

use chacha20poly1305::{
    ChaCha20Poly1305, Key, KeyInit, Nonce,
    aead::{Aead, Payload},
};
use hkdf::Hkdf;
use sha2::Sha512;
use tracing::{trace, warn};

use crate::LinkError;

pub const NONCE_LEN: usize = 12;

/// HKDF-SHA512 expanded to a 32 byte key
pub fn derive_key(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> Result<[u8; 32], LinkError> {
    let hk = Hkdf::<Sha512>::new(salt, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| LinkError::HandshakeFailure(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// A nonce made of a short ASCII label, left-padded with zeros
pub fn labeled_nonce(label: &[u8; 8]) -> [u8; NONCE_LEN] {
    let mut n = [0u8; NONCE_LEN];
    n[4..].copy_from_slice(label);
    n
}

/// The nonce of the `counter`-th host message
pub fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut n = [0u8; NONCE_LEN];
    n[..8].copy_from_slice(&counter.to_le_bytes());
    n
}

pub fn seal(key: &[u8; 32], nonce: &[u8; NONCE_LEN], msg: &[u8]) -> Result<Vec<u8>, LinkError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(Nonce::from_slice(nonce), Payload { msg, aad: &[] })
        .map_err(|e| {
            warn!("ChaCha20-Poly1305 seal failed: {e:?}");
            LinkError::HandshakeFailure("encryption failed".into())
        })
}

pub fn open(key: &[u8; 32], nonce: &[u8; NONCE_LEN], msg: &[u8]) -> Result<Vec<u8>, LinkError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(Nonce::from_slice(nonce), Payload { msg, aad: &[] })
        .map_err(|_| LinkError::Decode("ciphertext failed authentication".into()))
}

pub struct CipherStream {
    client_key: [u8; 32],
    server_key: [u8; 32],
    counter: u64,
    last_nonce: [u8; NONCE_LEN],
}

impl std::fmt::Debug for CipherStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherStream")
            .field("counter", &self.counter)
            .finish()
    }
}

impl CipherStream {
    /// Derives both directions from the pairing session key
    pub fn new(session_key: &[u8]) -> Result<Self, LinkError> {
        Ok(Self {
            client_key: derive_key(session_key, None, b"ClientEncrypt-main")?,
            server_key: derive_key(session_key, None, b"ServerEncrypt-main")?,
            counter: 0,
            last_nonce: counter_nonce(0),
        })
    }

    /// Number of messages sent so far
    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, LinkError> {
        self.last_nonce = counter_nonce(self.counter);
        let res = seal(&self.client_key, &self.last_nonce, plaintext)?;
        trace!("Sealed control message {}", self.counter);
        self.counter += 1;
        Ok(res)
    }

    /// Opens the device's answer to the last message sent
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, LinkError> {
        open(&self.server_key, &self.last_nonce, ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION_KEY: [u8; 32] = [0x5a; 32];

    #[test]
    fn nonces_follow_the_send_counter() {
        let mut stream = CipherStream::new(&SESSION_KEY).unwrap();
        let client_key = derive_key(&SESSION_KEY, None, b"ClientEncrypt-main").unwrap();

        for k in 0..3u64 {
            let ct = stream.encrypt(b"{\"request\":{}}").unwrap();
            let mut expected = k.to_le_bytes().to_vec();
            expected.extend_from_slice(&[0, 0, 0, 0]);
            assert_eq!(counter_nonce(k).to_vec(), expected);
            assert_eq!(open(&client_key, &counter_nonce(k), &ct).unwrap(), b"{\"request\":{}}");
        }
        assert_eq!(stream.counter(), 3);
    }

    #[test]
    fn replies_open_only_under_the_matching_counter() {
        let mut stream = CipherStream::new(&SESSION_KEY).unwrap();
        let server_key = derive_key(&SESSION_KEY, None, b"ServerEncrypt-main").unwrap();
        stream.encrypt(b"first").unwrap();
        stream.encrypt(b"second").unwrap();

        let good = seal(&server_key, &counter_nonce(1), b"reply").unwrap();
        assert_eq!(stream.decrypt(&good).unwrap(), b"reply");

        let stale = seal(&server_key, &counter_nonce(0), b"reply").unwrap();
        assert!(matches!(stream.decrypt(&stale), Err(LinkError::Decode(_))));
    }

    #[test]
    fn labeled_nonce_is_left_padded() {
        assert_eq!(&labeled_nonce(b"PV-Msg03"), b"\x00\x00\x00\x00PV-Msg03");
    }
}
