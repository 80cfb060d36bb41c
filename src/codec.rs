//! Link token codec.
//!
//! Storage URLs are encrypted with AES-256-CBC (PKCS#7 padding) under a
//! process-wide key and IV and serialized as lowercase hex so they can sit in
//! a single URL path segment. The IV is fixed, so equal URLs yield equal
//! tokens. Changing any of this invalidates every link already handed out.

use aes::Aes256;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{IV_LEN, KEY_LEN};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("{name} is missing")]
    Missing { name: &'static str },

    #[error("{name} is not valid hex: {source}")]
    InvalidHex {
        name: &'static str,
        source: hex::FromHexError,
    },

    #[error("{name} must be {expected} bytes, got {actual}")]
    WrongLength {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("token is empty")]
    Empty,

    #[error("token is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("token length {0} is not a multiple of the cipher block size")]
    Misaligned(usize),

    #[error("token was not produced with this key or has been corrupted")]
    BadPadding,

    #[error("token does not decrypt to UTF-8 text")]
    NotUtf8,
}

/// Key and IV loaded once at startup.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretMaterial {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl SecretMaterial {
    pub fn new(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// Parse hex-encoded key and IV; both must decode to exactly the cipher's sizes.
    pub fn from_hex(key_hex: &str, iv_hex: &str) -> Result<Self, SecretError> {
        let key = decode_exact::<KEY_LEN>("ENCRYPTION_KEY", key_hex)?;
        let iv = decode_exact::<IV_LEN>("ENCRYPTION_IV", iv_hex)?;
        Ok(Self::new(key, iv))
    }
}

impl std::fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretMaterial")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

fn decode_exact<const N: usize>(name: &'static str, value: &str) -> Result<[u8; N], SecretError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SecretError::Missing { name });
    }

    let mut bytes = hex::decode(value).map_err(|source| SecretError::InvalidHex { name, source })?;
    let result = <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| SecretError::WrongLength {
        name,
        expected: N,
        actual: bytes.len(),
    });
    bytes.zeroize();
    result
}

#[derive(Debug, Clone)]
pub struct TokenCodec {
    secrets: SecretMaterial,
}

impl TokenCodec {
    pub fn new(secrets: SecretMaterial) -> Self {
        Self { secrets }
    }

    /// Encrypt `plaintext` into a lowercase hex token.
    pub fn encode(&self, plaintext: &str) -> String {
        let ciphertext = Aes256CbcEnc::new(&self.secrets.key.into(), &self.secrets.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        hex::encode(ciphertext)
    }

    /// Recover the plaintext of a token produced by [`TokenCodec::encode`].
    pub fn decode(&self, token: &str) -> Result<String, DecodeError> {
        if token.is_empty() {
            return Err(DecodeError::Empty);
        }

        let ciphertext = hex::decode(token)?;
        if ciphertext.len() % IV_LEN != 0 {
            return Err(DecodeError::Misaligned(ciphertext.len()));
        }

        let plaintext = Aes256CbcDec::new(&self.secrets.key.into(), &self.secrets.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| DecodeError::BadPadding)?;

        String::from_utf8(plaintext).map_err(|_| DecodeError::NotUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://storage.example/bucket/3d-views/alice/1700000000000-photo.jpg";

    fn codec() -> TokenCodec {
        TokenCodec::new(SecretMaterial::new([7u8; KEY_LEN], [9u8; IV_LEN]))
    }

    fn flip_hex_char(token: &str, index: usize) -> String {
        let mut chars: Vec<char> = token.chars().collect();
        chars[index] = if chars[index] == '0' { '1' } else { '0' };
        chars.into_iter().collect()
    }

    #[test]
    fn round_trips_urls() {
        let codec = codec();
        for url in [
            URL,
            "https://storage.example/bucket/photo.jpg",
            "",
            "https://storage.example/bucket/ünïcødé-360°.png",
            "exactly sixteen!",
        ] {
            let token = codec.encode(url);
            assert_eq!(codec.decode(&token).unwrap(), url);
        }
    }

    #[test]
    fn encoding_is_deterministic_lowercase_hex() {
        let codec = codec();
        let first = codec.encode(URL);
        let second = codec.encode(URL);
        assert_eq!(first, second);
        assert!(first
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn ciphertext_is_padded_to_whole_blocks() {
        let codec = codec();
        // PKCS#7 always adds at least one byte, so 16 bytes of input become 32.
        assert_eq!(codec.encode("exactly sixteen!").len(), 64);
        assert_eq!(codec.encode("short").len(), 32);
        assert_eq!(codec.encode("").len(), 32);
    }

    #[test]
    fn different_urls_produce_different_tokens() {
        let codec = codec();
        assert_ne!(
            codec.encode("https://storage.example/bucket/a.jpg"),
            codec.encode("https://storage.example/bucket/b.jpg")
        );
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let codec = codec();
        let token = codec.encode(URL);
        for index in 0..token.len() {
            let tampered = flip_hex_char(&token, index);
            assert_ne!(tampered, token);
            assert!(codec.decode(&tampered).is_err(), "flip at {index} decoded");
        }
    }

    #[test]
    fn truncated_tokens_are_rejected() {
        let codec = codec();
        let token = codec.encode(URL);

        assert!(matches!(
            codec.decode(&token[..token.len() - 1]),
            Err(DecodeError::InvalidHex(_))
        ));
        assert!(matches!(
            codec.decode(&token[..token.len() - 2]),
            Err(DecodeError::Misaligned(_))
        ));
        // Dropping the final block leaves URL text where the padding should be.
        assert_eq!(
            codec.decode(&token[..token.len() - 32]),
            Err(DecodeError::BadPadding)
        );
    }

    #[test]
    fn foreign_key_or_iv_fails() {
        let token = codec().encode(URL);

        let other_key = TokenCodec::new(SecretMaterial::new([8u8; KEY_LEN], [9u8; IV_LEN]));
        assert!(other_key.decode(&token).is_err());

        let other_iv = TokenCodec::new(SecretMaterial::new([7u8; KEY_LEN], [1u8; IV_LEN]));
        // A wrong IV only garbles the first block, so this may decode to different text.
        assert_ne!(other_iv.decode(&token).ok().as_deref(), Some(URL));
    }

    #[test]
    fn garbage_input_is_a_decode_error() {
        let codec = codec();
        assert_eq!(codec.decode(""), Err(DecodeError::Empty));
        assert!(matches!(codec.decode("not-hex!!"), Err(DecodeError::InvalidHex(_))));
        assert!(matches!(codec.decode("abcd"), Err(DecodeError::Misaligned(2))));
    }

    #[test]
    fn secrets_parse_from_hex() {
        let key = "00".repeat(KEY_LEN);
        let iv = "ff".repeat(IV_LEN);
        let secrets = SecretMaterial::from_hex(&key, &iv).unwrap();
        assert_eq!(secrets.key, [0u8; KEY_LEN]);
        assert_eq!(secrets.iv, [0xffu8; IV_LEN]);
    }

    #[test]
    fn secrets_reject_missing_bad_or_short_values() {
        let key = "00".repeat(KEY_LEN);
        let iv = "ff".repeat(IV_LEN);

        assert!(matches!(
            SecretMaterial::from_hex("", &iv),
            Err(SecretError::Missing { name: "ENCRYPTION_KEY" })
        ));
        assert!(matches!(
            SecretMaterial::from_hex(&key, "zz"),
            Err(SecretError::InvalidHex { name: "ENCRYPTION_IV", .. })
        ));
        assert!(matches!(
            SecretMaterial::from_hex(&key[..32], &iv),
            Err(SecretError::WrongLength { expected: 32, actual: 16, .. })
        ));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let secrets = SecretMaterial::new([0xabu8; KEY_LEN], [0xcdu8; IV_LEN]);
        let printed = format!("{:?}", secrets);
        assert!(printed.contains("redacted"));
        assert!(!printed.contains("171"));
    }
}
