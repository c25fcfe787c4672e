//! Authenticated framing for client-held state.
//!
//! Wire layout: `base64url(iv || aes256-cfb(plaintext || sha256(plaintext)))`.
//! The digest rides inside the same keystream, so a client that flips any
//! ciphertext bit corrupts either the plaintext or the tag and `open` fails.

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type Aes256CfbEnc = cfb_mode::Encryptor<aes::Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<aes::Aes256>;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CodecError {
    #[error("sealed value is not url-safe base64")]
    Encoding,
    #[error("sealed value is too short ({len} bytes)")]
    TooShort { len: usize },
    #[error("sealed value failed integrity verification")]
    Integrity,
    #[error("invalid cookie key: {0}")]
    Key(String),
}

/// Process-wide symmetric key for sealing cookies.
#[derive(Clone)]
pub struct CookieKey([u8; KEY_LEN]);

impl CookieKey {
    /// Generate a new random key. Cookies sealed with it die with the process.
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0_u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse 64 hex characters (surrounding whitespace ignored).
    ///
    /// # Errors
    /// Returns [`CodecError::Key`] when the text is not hex or not 32 bytes long.
    pub fn from_hex(raw: &str) -> Result<Self, CodecError> {
        let bytes = hex::decode(raw.trim()).map_err(|err| CodecError::Key(err.to_string()))?;
        let key: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            CodecError::Key(format!("expected {KEY_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self(key))
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for CookieKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CookieKey").field(&"[REDACTED]").finish()
    }
}

#[derive(Debug, Clone)]
pub struct CookieCodec {
    key: CookieKey,
}

impl CookieCodec {
    #[must_use]
    pub fn new(key: CookieKey) -> Self {
        Self { key }
    }

    /// Encrypt `plaintext` under a fresh IV and return the transport string.
    #[must_use]
    pub fn seal(&self, plaintext: &[u8]) -> String {
        let mut iv = [0_u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut body = Vec::with_capacity(plaintext.len() + DIGEST_LEN);
        body.extend_from_slice(plaintext);
        body.extend_from_slice(&Sha256::digest(plaintext));
        Aes256CfbEnc::new(&self.key.0.into(), &iv.into()).encrypt(&mut body);

        let mut framed = Vec::with_capacity(IV_LEN + body.len());
        framed.extend_from_slice(&iv);
        framed.extend_from_slice(&body);
        URL_SAFE.encode(framed)
    }

    /// Reverse [`CookieCodec::seal`].
    ///
    /// # Errors
    /// Returns [`CodecError::Encoding`] for bad base64, [`CodecError::TooShort`]
    /// when no room is left for the IV and digest, and [`CodecError::Integrity`]
    /// when the recovered digest does not match the recovered plaintext.
    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, CodecError> {
        let framed = URL_SAFE.decode(sealed.trim()).map_err(|_| CodecError::Encoding)?;
        if framed.len() < IV_LEN + DIGEST_LEN {
            return Err(CodecError::TooShort { len: framed.len() });
        }

        let (iv_bytes, ciphertext) = framed.split_at(IV_LEN);
        let mut iv = [0_u8; IV_LEN];
        iv.copy_from_slice(iv_bytes);

        let mut body = ciphertext.to_vec();
        Aes256CfbDec::new(&self.key.0.into(), &iv.into()).decrypt(&mut body);

        let (plaintext, tag) = body.split_at(body.len() - DIGEST_LEN);
        let expected = Sha256::digest(plaintext);
        if bool::from(expected.as_slice().ct_eq(tag)) {
            Ok(plaintext.to_vec())
        } else {
            Err(CodecError::Integrity)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fixture_codec() -> CookieCodec {
        CookieCodec::new(CookieKey::from_bytes([7_u8; KEY_LEN]))
    }

    #[test]
    fn sealed_text_opens_to_original_plaintext() {
        let codec = fixture_codec();
        let text = "Now is the time for all good men to come to the aid of their country.";

        let sealed = codec.seal(text.as_bytes());
        let opened = codec.open(&sealed).unwrap_or_else(|err| panic!("open failed: {err}"));

        assert_eq!(opened, text.as_bytes());
    }

    #[test]
    fn sealing_twice_yields_different_ciphertexts() {
        let codec = fixture_codec();
        assert_ne!(codec.seal(b"same"), codec.seal(b"same"));
    }

    #[test]
    fn empty_plaintext_is_sealable() {
        let codec = fixture_codec();
        let sealed = codec.seal(b"");
        assert_eq!(codec.open(&sealed), Ok(Vec::new()));
    }

    #[test]
    fn other_key_cannot_open() {
        let sealed = fixture_codec().seal(b"cursor");
        let stranger = CookieCodec::new(CookieKey::from_bytes([9_u8; KEY_LEN]));
        assert_eq!(stranger.open(&sealed), Err(CodecError::Integrity));
    }

    #[test]
    fn malformed_inputs_are_rejected() {
        let codec = fixture_codec();
        assert_eq!(codec.open("not base64 at all!"), Err(CodecError::Encoding));
        assert_eq!(codec.open(""), Err(CodecError::TooShort { len: 0 }));
        let short = URL_SAFE.encode([0_u8; IV_LEN + DIGEST_LEN - 1]);
        assert_eq!(codec.open(&short), Err(CodecError::TooShort { len: IV_LEN + DIGEST_LEN - 1 }));
    }

    #[test]
    fn keys_parse_from_hex() {
        let key = CookieKey::generate();
        let parsed = CookieKey::from_hex(&format!("  {}\n", key.to_hex()))
            .unwrap_or_else(|err| panic!("hex key should parse: {err}"));
        assert_eq!(parsed.to_hex(), key.to_hex());

        assert!(matches!(CookieKey::from_hex("abcd"), Err(CodecError::Key(_))));
        assert!(matches!(CookieKey::from_hex("zz"), Err(CodecError::Key(_))));
        assert_eq!(format!("{key:?}"), "CookieKey(\"[REDACTED]\")");
    }

    proptest! {
        #[test]
        fn property_open_inverts_seal(payload in proptest::collection::vec(any::<u8>(), 0..512), key in any::<[u8; KEY_LEN]>()) {
            let codec = CookieCodec::new(CookieKey::from_bytes(key));
            let sealed = codec.seal(&payload);
            prop_assert_eq!(codec.open(&sealed), Ok(payload));
        }

        #[test]
        fn property_single_bit_flip_is_detected(payload in proptest::collection::vec(any::<u8>(), 0..256), bit in any::<usize>()) {
            let codec = fixture_codec();
            let sealed = codec.seal(&payload);
            let mut framed = URL_SAFE.decode(&sealed).unwrap_or_else(|err| panic!("sealed output must decode: {err}"));
            let bit = bit % (framed.len() * 8);
            framed[bit / 8] ^= 1 << (bit % 8);

            let tampered = URL_SAFE.encode(&framed);
            prop_assert_eq!(codec.open(&tampered), Err(CodecError::Integrity));
        }
    }
}
