//! Opaque identifier codec for pipeline values.
//!
//! Every value the core hands across its boundary (containers, directories,
//! files, secrets, sockets, cache volumes) travels as an opaque string ID:
//! the canonical JSON serialization of the value, base64-encoded, behind a
//! short type tag. Equal values produce byte-equal IDs, which is what makes
//! the IDs content addresses; decoding verifies the tag and the shape and
//! fails with [`Error::InvalidId`] on anything else.
//!
//! Canonicality relies on two properties of the value types: struct fields
//! serialize in declaration order, and every ordered collection is a `Vec`
//! (never a hash map), so serialization order never depends on hashing.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

use crate::constants::{
    CACHE_ID_PREFIX, CONTAINER_ID_PREFIX, DIRECTORY_ID_PREFIX, FILE_ID_PREFIX,
    MAX_ENCODED_ID_LEN, SECRET_ID_PREFIX, SOCKET_ID_PREFIX,
};
use crate::error::{Error, Result};

/// Encodes a value as a tagged opaque ID string.
pub(crate) fn encode<T: Serialize>(prefix: &'static str, kind: &'static str, value: &T) -> Result<String> {
    let json = serde_json::to_vec(value).map_err(|e| {
        Error::invalid_id(kind, format!("canonical serialization failed: {e}"))
    })?;
    Ok(format!("{}{}", prefix, URL_SAFE_NO_PAD.encode(json)))
}

/// Decodes a tagged opaque ID string back into its value.
pub(crate) fn decode<T: DeserializeOwned>(
    prefix: &'static str,
    kind: &'static str,
    encoded: &str,
) -> Result<T> {
    if encoded.len() > MAX_ENCODED_ID_LEN {
        return Err(Error::invalid_id(kind, "encoded id exceeds size limit"));
    }
    let body = encoded
        .strip_prefix(prefix)
        .ok_or_else(|| Error::invalid_id(kind, format!("missing '{prefix}' tag")))?;
    let json = URL_SAFE_NO_PAD
        .decode(body)
        .map_err(|e| Error::invalid_id(kind, format!("base64: {e}")))?;
    serde_json::from_slice(&json).map_err(|e| Error::invalid_id(kind, format!("payload: {e}")))
}

/// Hex SHA-256 of an encoded ID, used wherever a short stable digest of a
/// value is needed (solve keys, hostnames, export layer names).
pub(crate) fn digest_of(encoded: &str) -> String {
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

macro_rules! typed_id {
    ($(#[$doc:meta])* $name:ident, $prefix:path, $kind:literal) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Encodes a value into this ID type.
            pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Self> {
                Ok(Self(encode($prefix, $kind, value)?))
            }

            /// Decodes this ID back into its value.
            pub(crate) fn decode<T: DeserializeOwned>(&self) -> Result<T> {
                decode($prefix, $kind, &self.0)
            }

            /// Wraps an externally-provided encoded string, verifying the tag.
            pub fn parse(encoded: impl Into<String>) -> Result<Self> {
                let encoded = encoded.into();
                if !encoded.starts_with($prefix) {
                    return Err(Error::invalid_id($kind, format!("missing '{}' tag", $prefix)));
                }
                Ok(Self(encoded))
            }

            /// Returns the encoded string form.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Hex SHA-256 digest of the encoded form.
            pub fn digest(&self) -> String {
                digest_of(&self.0)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(
    /// Content-addressed ID of a [`Container`](crate::container::Container) value.
    ContainerId,
    CONTAINER_ID_PREFIX,
    "container"
);

typed_id!(
    /// Content-addressed ID of a [`Directory`](crate::artifact::Directory) value.
    DirectoryId,
    DIRECTORY_ID_PREFIX,
    "directory"
);

typed_id!(
    /// Content-addressed ID of a [`File`](crate::artifact::File) value.
    FileId,
    FILE_ID_PREFIX,
    "file"
);

typed_id!(
    /// Opaque reference to a backend-held secret.
    SecretId,
    SECRET_ID_PREFIX,
    "secret"
);

typed_id!(
    /// Opaque reference to a caller-owned unix socket endpoint.
    SocketId,
    SOCKET_ID_PREFIX,
    "socket"
);

typed_id!(
    /// Deterministic ID of a named cache volume.
    CacheId,
    CACHE_ID_PREFIX,
    "cache"
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        count: u32,
    }

    #[test]
    fn roundtrip() {
        let payload = Payload {
            name: "redis".to_string(),
            count: 3,
        };
        let id = ContainerId::encode(&payload).unwrap();
        let decoded: Payload = id.decode().unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn equal_values_equal_ids() {
        let a = CacheId::encode(&Payload {
            name: "m".into(),
            count: 1,
        })
        .unwrap();
        let b = CacheId::encode(&Payload {
            name: "m".into(),
            count: 1,
        })
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn wrong_tag_rejected() {
        let id = SecretId::encode(&Payload {
            name: "token".into(),
            count: 0,
        })
        .unwrap();
        assert!(SocketId::parse(id.as_str()).is_err());

        let reparsed: Result<Payload> =
            decode(crate::constants::SOCKET_ID_PREFIX, "socket", id.as_str());
        assert!(reparsed.is_err());
    }

    #[test]
    fn garbage_rejected() {
        assert!(ContainerId::parse("not-a-container-id").is_err());
        let bad = format!("{}%%%", crate::constants::CONTAINER_ID_PREFIX);
        let decoded: Result<Payload> =
            decode(crate::constants::CONTAINER_ID_PREFIX, "container", &bad);
        assert!(decoded.is_err());
    }
}
