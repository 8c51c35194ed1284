//! Classification and key encodings for `hyper://` identifiers.
//!
//! User facing entry points accept either a raw 32 byte key, an encoded key
//! (z-base-32 or hex), a petname for a locally derived resource, or a full
//! `hyper://` URL whose host is an encoded key or a DNS hostname.

use crate::error::{Error, Result};
use url::Url;

pub const HYPER_PROTOCOL_SCHEME: &str = "hyper://";

/// Keys are always ed25519-sized.
pub const KEY_BYTES: usize = 32;

/// A 32 byte key encodes to 52 z-base-32 characters, or 64 hex characters.
const Z32_LEN: usize = 52;
const HEX_LEN: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identifier {
    /// A key given directly, raw or in one of the two text encodings.
    RawKey([u8; KEY_BYTES]),
    /// A petname, only meaningful to the local instance that derives it.
    Name(String),
    /// A `hyper://` URL whose host needs DNS resolution.
    Url { hostname: String, path: String },
}

impl Identifier {
    /// Classifies raw bytes; anything other than exactly 32 bytes is invalid.
    pub fn from_bytes(input: &[u8]) -> Result<Identifier> {
        if input.len() == KEY_BYTES {
            let mut key = [0u8; KEY_BYTES];
            key.copy_from_slice(input);
            Ok(Identifier::RawKey(key))
        } else {
            Err(Error::InvalidIdentifier(format!(
                "expected {} key bytes, got {}",
                KEY_BYTES,
                input.len()
            )))
        }
    }
}

/// Classifies a string identifier without performing any network access.
///
/// Decision order: `hyper://` URLs are split into key-hosts and DNS hosts by
/// whether the host contains a dot, then bare strings are tried as encoded
/// keys, and anything left over is treated as a petname.
pub fn classify(input: &str) -> Result<Identifier> {
    if input.is_empty() {
        return Err(Error::InvalidIdentifier("empty identifier".into()));
    }
    if input.starts_with(HYPER_PROTOCOL_SCHEME) {
        let url = Url::parse(input)
            .map_err(|e| Error::InvalidIdentifier(format!("{:?}: {}", input, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidIdentifier(format!("{:?} has no host", input)))?;
        if host.contains('.') {
            return Ok(Identifier::Url {
                hostname: host.to_string(),
                path: url.path().to_string(),
            });
        }
        return match decode_key(host) {
            Some(key) => Ok(Identifier::RawKey(key)),
            None => Err(Error::InvalidIdentifier(format!(
                "{:?} host is neither an encoded key nor a hostname",
                input
            ))),
        };
    }
    match decode_key(input) {
        Some(key) => Ok(Identifier::RawKey(key)),
        None => Ok(Identifier::Name(input.to_string())),
    }
}

/// Decodes a 52 character z-base-32 or 64 character hex key. Returns `None`
/// for anything else so callers can fall back to treating it as a name.
pub fn decode_key(s: &str) -> Option<[u8; KEY_BYTES]> {
    let bytes = match s.len() {
        Z32_LEN => base32::decode(base32::Alphabet::Z, s)?,
        HEX_LEN => hex::decode(s).ok()?,
        _ => return None,
    };
    if bytes.len() < KEY_BYTES {
        return None;
    }
    let mut key = [0u8; KEY_BYTES];
    key.copy_from_slice(&bytes[..KEY_BYTES]);
    Some(key)
}

pub fn encode_key_z32(key: &[u8; KEY_BYTES]) -> String {
    base32::encode(base32::Alphabet::Z, key)
}

pub fn encode_key_hex(key: &[u8; KEY_BYTES]) -> String {
    hex::encode(key)
}

/// Canonical URL form: z-base-32 host and a trailing slash.
pub fn format_url(key: &[u8; KEY_BYTES]) -> String {
    format!("{}{}/", HYPER_PROTOCOL_SCHEME, encode_key_z32(key))
}

/// A classified identifier after DNS resolution, holding at least one of a
/// key or a name. The constructors are the only way to build one, so the
/// "at least one present" invariant holds for every live value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolved {
    key: Option<[u8; KEY_BYTES]>,
    name: Option<String>,
}

impl Resolved {
    pub fn from_key(key: [u8; KEY_BYTES]) -> Resolved {
        Resolved {
            key: Some(key),
            name: None,
        }
    }

    pub fn from_name(name: impl Into<String>) -> Result<Resolved> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::InvalidIdentifier("empty name".into()));
        }
        Ok(Resolved {
            key: None,
            name: Some(name),
        })
    }

    pub fn key(&self) -> Option<&[u8; KEY_BYTES]> {
        self.key.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Identity used for in-flight construction dedup: names win over keys
    /// because a name is resolvable without touching the derivation secret.
    pub(crate) fn cache_id(&self) -> String {
        match (&self.name, &self.key) {
            (Some(name), _) => name.clone(),
            (None, Some(key)) => encode_key_hex(key),
            (None, None) => unreachable!("constructors require a key or a name"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn key_roundtrips_both_encodings() {
        let key = decode_key(KEY_HEX).unwrap();
        assert_eq!(decode_key(&encode_key_z32(&key)), Some(key));
        assert_eq!(decode_key(&encode_key_hex(&key)), Some(key));
        assert_eq!(encode_key_z32(&key).len(), Z32_LEN);
    }

    #[test]
    fn null_key_is_all_y() {
        // z-base-32 maps the zero bit pattern to 'y'
        let z32 = encode_key_z32(&[0u8; KEY_BYTES]);
        assert_eq!(z32, "y".repeat(Z32_LEN));
        assert_eq!(decode_key(&z32), Some([0u8; KEY_BYTES]));
    }

    #[test]
    fn classify_equivalent_forms() {
        let key = decode_key(KEY_HEX).unwrap();
        let same = [
            KEY_HEX.to_string(),
            encode_key_z32(&key),
            format!("hyper://{}", KEY_HEX),
            format!("hyper://{}/", encode_key_z32(&key)),
            format!("hyper://{}/some/path", encode_key_z32(&key)),
        ];
        for input in &same {
            match classify(input) {
                Ok(Identifier::RawKey(k)) => assert_eq!(k, key, "{:?}", input),
                other => panic!("{:?} classified as {:?}", input, other),
            }
        }
    }

    #[test]
    fn classify_names_and_urls() {
        let names = ["example", "example drive 1", "not-a-key-at-all"];
        for input in &names {
            match classify(input) {
                Ok(Identifier::Name(name)) => assert_eq!(&name, input),
                other => panic!("{:?} classified as {:?}", input, other),
            }
        }
        match classify("hyper://example.mauve.moe/some/path").unwrap() {
            Identifier::Url { hostname, path } => {
                assert_eq!(hostname, "example.mauve.moe");
                assert_eq!(path, "/some/path");
            }
            other => panic!("classified as {:?}", other),
        }
    }

    #[test]
    fn classify_rejects_garbage() {
        let bad = [
            "",
            "hyper://",
            // right scheme, host is neither a key nor dotted
            "hyper://nonsense",
            "hyper://zzzz",
        ];
        for input in &bad {
            assert!(classify(input).is_err(), "{:?} should be rejected", input);
        }
    }

    #[test]
    fn from_bytes_requires_exact_length() {
        assert!(Identifier::from_bytes(&[0u8; 32]).is_ok());
        assert!(Identifier::from_bytes(&[0u8; 31]).is_err());
        assert!(Identifier::from_bytes(&[0u8; 33]).is_err());
    }

    #[test]
    fn resolved_requires_key_or_name() {
        assert!(Resolved::from_name("").is_err());
        let by_name = Resolved::from_name("example").unwrap();
        assert_eq!(by_name.cache_id(), "example");
        let by_key = Resolved::from_key([0u8; KEY_BYTES]);
        assert_eq!(by_key.cache_id(), encode_key_hex(&[0u8; KEY_BYTES]));
    }
}
