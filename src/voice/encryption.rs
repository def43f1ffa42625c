use std::sync::Arc;

use xsalsa20poly1305::{
    Key, Nonce, Tag, XSalsa20Poly1305,
    aead::{AeadInPlace, KeyInit},
};

use crate::common::errors::{ConfigError, CryptoError};
use crate::voice::constants::{KEY_LEN, NONCE_LEN, TAG_LEN};

/// Every provider this build can construct, in default preference order.
pub const KNOWN_PROVIDERS: [&str; 1] = ["xsalsa20poly1305"];

/// Builds per-session packet ciphers. Resolved once from a priority list.
pub trait CryptoProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn cipher(&self, key: &[u8]) -> Result<Box<dyn PacketCipher>, CryptoError>;
}

/// A secretbox keyed with one session's secret.
///
/// Boxes use the NaCl layout: the 16-byte tag followed by the ciphertext.
pub trait PacketCipher: Send + Sync {
    /// Appends the box for `plaintext` to `out`.
    fn seal_into(
        &self,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError>;

    fn open(&self, nonce: &[u8; NONCE_LEN], sealed: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub struct XSalsaProvider;

impl CryptoProvider for XSalsaProvider {
    fn name(&self) -> &'static str {
        "xsalsa20poly1305"
    }

    fn cipher(&self, key: &[u8]) -> Result<Box<dyn PacketCipher>, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        Ok(Box::new(XSalsaCipher(XSalsa20Poly1305::new(
            Key::from_slice(key),
        ))))
    }
}

struct XSalsaCipher(XSalsa20Poly1305);

impl PacketCipher for XSalsaCipher {
    fn seal_into(
        &self,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let start = out.len();
        out.extend_from_slice(&[0u8; TAG_LEN]);
        out.extend_from_slice(plaintext);

        let tag = self
            .0
            .encrypt_in_place_detached(Nonce::from_slice(nonce), b"", &mut out[start + TAG_LEN..])
            .map_err(|_| CryptoError::Encrypt)?;
        out[start..start + TAG_LEN].copy_from_slice(tag.as_slice());
        Ok(())
    }

    fn open(&self, nonce: &[u8; NONCE_LEN], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < TAG_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (tag, ciphertext) = sealed.split_at(TAG_LEN);
        let mut buffer = ciphertext.to_vec();
        self.0
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                b"",
                &mut buffer,
                Tag::from_slice(tag),
            )
            .map_err(|_| CryptoError::Decrypt)?;
        Ok(buffer)
    }
}

fn provider_by_name(name: &str) -> Option<Arc<dyn CryptoProvider>> {
    match name {
        "xsalsa20poly1305" => Some(Arc::new(XSalsaProvider)),
        _ => None,
    }
}

/// Returns the first provider of `priority` that this build supports.
pub fn resolve_provider(priority: &[String]) -> Result<Arc<dyn CryptoProvider>, ConfigError> {
    priority
        .iter()
        .find_map(|name| provider_by_name(name))
        .ok_or_else(|| ConfigError::MissingCrypto {
            options: KNOWN_PROVIDERS.to_vec(),
        })
}
