//! The per-object metadata dictionary: canonical key names, value encoding,
//! and parse-with-fallback for a legacy unprefixed form.
//!
//! Grounded on `canonical.rs`'s build/verify/to_string deterministic
//! serialization idiom, carried over here as "build always emits one
//! canonical shape, parse accepts more than one", adapted from a
//! line-oriented header format to a prefixed string map.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

pub type MetadataDict = BTreeMap<String, String>;

pub const FIELD_DEK_ALGORITHM: &str = "dek-algorithm";
pub const FIELD_KEK_ALGORITHM: &str = "kek-algorithm";
pub const FIELD_KEK_FINGERPRINT: &str = "kek-fingerprint";
pub const FIELD_ENCRYPTED_DEK: &str = "encrypted-dek";
pub const FIELD_AES_IV: &str = "aes-iv";
pub const FIELD_HMAC: &str = "hmac";
pub const FIELD_CONTENT_TYPE: &str = "content-type";
pub const FIELD_UPLOAD_ID: &str = "upload-id";
pub const FIELD_TOTAL_PARTS: &str = "total-parts";

const ALL_FIELDS: &[&str] = &[
    FIELD_DEK_ALGORITHM,
    FIELD_KEK_ALGORITHM,
    FIELD_KEK_FINGERPRINT,
    FIELD_ENCRYPTED_DEK,
    FIELD_AES_IV,
    FIELD_HMAC,
    FIELD_CONTENT_TYPE,
    FIELD_UPLOAD_ID,
    FIELD_TOTAL_PARTS,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DekAlgorithm {
    Aes256Gcm,
    Aes256Ctr,
    None,
}

impl DekAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            DekAlgorithm::Aes256Gcm => "aes-256-gcm",
            DekAlgorithm::Aes256Ctr => "aes-256-ctr",
            DekAlgorithm::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aes-256-gcm" => Some(DekAlgorithm::Aes256Gcm),
            "aes-256-ctr" => Some(DekAlgorithm::Aes256Ctr),
            "none" => Some(DekAlgorithm::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KekAlgorithm {
    Aes,
    Rsa,
    None,
}

impl KekAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            KekAlgorithm::Aes => "aes",
            KekAlgorithm::Rsa => "rsa",
            KekAlgorithm::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "aes" => Some(KekAlgorithm::Aes),
            "rsa" => Some(KekAlgorithm::Rsa),
            "none" => Some(KekAlgorithm::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Whole,
    Multipart,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Whole => "whole",
            ContentType::Multipart => "multipart",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "whole" => Some(ContentType::Whole),
            "multipart" => Some(ContentType::Multipart),
            _ => None,
        }
    }
}

/// Typed view over a parsed metadata dictionary. Every field is optional at
/// this layer; the orchestrator decides which combinations are valid.
#[derive(Debug, Clone, Default)]
pub struct ParsedMetadata {
    pub dek_algorithm: Option<DekAlgorithm>,
    pub kek_algorithm: Option<KekAlgorithm>,
    pub kek_fingerprint: Option<String>,
    pub encrypted_dek: Option<Vec<u8>>,
    pub aes_iv: Option<Vec<u8>>,
    pub hmac: Option<Vec<u8>>,
    pub content_type: Option<ContentType>,
    pub upload_id: Option<String>,
    pub total_parts: Option<u32>,
}

/// Inputs to [`build`]. Every field mirrors a metadata field one-to-one;
/// `None` means "omit this key".
#[derive(Debug, Clone, Default)]
pub struct BuildFields<'a> {
    pub dek_algorithm: DekAlgorithm,
    pub kek_algorithm: KekAlgorithm,
    pub kek_fingerprint: &'a str,
    pub encrypted_dek: Option<&'a [u8]>,
    pub aes_iv: Option<&'a [u8]>,
    pub hmac: Option<&'a [u8]>,
    pub content_type: ContentType,
    pub upload_id: Option<&'a str>,
    pub total_parts: Option<u32>,
}

/// Codec over the metadata dictionary, parameterized on the configured
/// prefix (default `s3ep-`).
#[derive(Debug, Clone)]
pub struct MetadataCodec {
    prefix: String,
}

impl MetadataCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        MetadataCodec { prefix: prefix.into() }
    }

    fn prefixed(&self, field: &str) -> String {
        format!("{}{}", self.prefix, field)
    }

    /// Always emits the prefixed form of every key.
    pub fn build(&self, fields: &BuildFields<'_>) -> MetadataDict {
        let mut dict = MetadataDict::new();
        dict.insert(self.prefixed(FIELD_DEK_ALGORITHM), fields.dek_algorithm.as_str().to_string());
        dict.insert(self.prefixed(FIELD_KEK_ALGORITHM), fields.kek_algorithm.as_str().to_string());
        dict.insert(self.prefixed(FIELD_KEK_FINGERPRINT), fields.kek_fingerprint.to_string());
        if let Some(dek) = fields.encrypted_dek {
            dict.insert(self.prefixed(FIELD_ENCRYPTED_DEK), BASE64.encode(dek));
        }
        if let Some(iv) = fields.aes_iv {
            dict.insert(self.prefixed(FIELD_AES_IV), BASE64.encode(iv));
        }
        if let Some(hmac) = fields.hmac {
            dict.insert(self.prefixed(FIELD_HMAC), BASE64.encode(hmac));
        }
        dict.insert(self.prefixed(FIELD_CONTENT_TYPE), fields.content_type.as_str().to_string());
        if let Some(uid) = fields.upload_id {
            dict.insert(self.prefixed(FIELD_UPLOAD_ID), uid.to_string());
        }
        if let Some(tp) = fields.total_parts {
            dict.insert(self.prefixed(FIELD_TOTAL_PARTS), tp.to_string());
        }
        dict
    }

    /// Looks up `field` under the prefixed name first, falling back to the
    /// bare (legacy) name if absent.
    fn lookup<'a>(&self, dict: &'a MetadataDict, field: &str) -> Option<&'a str> {
        dict.get(&self.prefixed(field))
            .or_else(|| dict.get(field))
            .map(String::as_str)
    }

    pub fn parse(&self, dict: &MetadataDict) -> ParsedMetadata {
        let encrypted_dek = self
            .lookup(dict, FIELD_ENCRYPTED_DEK)
            .and_then(|s| BASE64.decode(s).ok());
        let aes_iv = self.lookup(dict, FIELD_AES_IV).and_then(|s| BASE64.decode(s).ok());
        let hmac = self.lookup(dict, FIELD_HMAC).and_then(|s| BASE64.decode(s).ok());
        let total_parts = self.lookup(dict, FIELD_TOTAL_PARTS).and_then(|s| s.parse().ok());

        ParsedMetadata {
            dek_algorithm: self.lookup(dict, FIELD_DEK_ALGORITHM).and_then(DekAlgorithm::parse),
            kek_algorithm: self.lookup(dict, FIELD_KEK_ALGORITHM).and_then(KekAlgorithm::parse),
            kek_fingerprint: self.lookup(dict, FIELD_KEK_FINGERPRINT).map(String::from),
            encrypted_dek,
            aes_iv,
            hmac,
            content_type: self.lookup(dict, FIELD_CONTENT_TYPE).and_then(ContentType::parse),
            upload_id: self.lookup(dict, FIELD_UPLOAD_ID).map(String::from),
            total_parts,
        }
    }

    /// Whether `name` (as it would appear in the object store's raw
    /// user-metadata map) is one this codec owns, prefixed or legacy.
    pub fn is_encryption_key(&self, name: &str) -> bool {
        if let Some(stripped) = name.strip_prefix(&self.prefix) {
            return ALL_FIELDS.contains(&stripped);
        }
        ALL_FIELDS.contains(&name)
    }

    /// Removes every key this codec owns so client-visible responses don't
    /// leak internal fields. Unknown/unrelated keys pass through untouched.
    pub fn strip_for_client(&self, dict: &MetadataDict) -> MetadataDict {
        dict.iter()
            .filter(|(k, _)| !self.is_encryption_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> MetadataCodec {
        MetadataCodec::new("s3ep-")
    }

    #[test]
    fn build_emits_prefixed_keys_only() {
        let dict = codec().build(&BuildFields {
            dek_algorithm: DekAlgorithm::Aes256Gcm,
            kek_algorithm: KekAlgorithm::Aes,
            kek_fingerprint: "deadbeef",
            encrypted_dek: Some(b"wrapped"),
            aes_iv: None,
            hmac: None,
            content_type: ContentType::Whole,
            upload_id: None,
            total_parts: None,
        });
        for k in dict.keys() {
            assert!(k.starts_with("s3ep-"), "key {k} not prefixed");
        }
        assert_eq!(dict.get("s3ep-dek-algorithm").unwrap(), "aes-256-gcm");
        assert!(!dict.contains_key("s3ep-aes-iv"));
    }

    #[test]
    fn parse_prefers_prefixed_over_legacy() {
        let codec = codec();
        let mut dict = MetadataDict::new();
        dict.insert("s3ep-dek-algorithm".into(), "aes-256-gcm".into());
        dict.insert("dek-algorithm".into(), "aes-256-ctr".into());
        let parsed = codec.parse(&dict);
        assert_eq!(parsed.dek_algorithm, Some(DekAlgorithm::Aes256Gcm));
    }

    #[test]
    fn parse_falls_back_to_legacy_when_prefixed_absent() {
        let codec = codec();
        let mut dict = MetadataDict::new();
        dict.insert("dek-algorithm".into(), "aes-256-ctr".into());
        let parsed = codec.parse(&dict);
        assert_eq!(parsed.dek_algorithm, Some(DekAlgorithm::Aes256Ctr));
    }

    #[test]
    fn strip_for_client_removes_all_prefixed_keys() {
        let codec = codec();
        let dict = codec().build(&BuildFields {
            dek_algorithm: DekAlgorithm::Aes256Ctr,
            kek_algorithm: KekAlgorithm::Aes,
            kek_fingerprint: "fp",
            encrypted_dek: Some(b"x"),
            aes_iv: Some(b"0123456789012345"),
            hmac: Some(b"tag-bytes-here-32"),
            content_type: ContentType::Multipart,
            upload_id: Some("u1"),
            total_parts: Some(3),
        });
        let stripped = codec.strip_for_client(&dict);
        assert!(stripped.is_empty());
    }

    #[test]
    fn strip_for_client_preserves_unrelated_keys() {
        let codec = codec();
        let mut dict = MetadataDict::new();
        dict.insert("s3ep-dek-algorithm".into(), "none".into());
        dict.insert("user-custom-tag".into(), "value".into());
        let stripped = codec.strip_for_client(&dict);
        assert_eq!(stripped.len(), 1);
        assert_eq!(stripped.get("user-custom-tag").unwrap(), "value");
    }

    #[test]
    fn is_encryption_key_recognizes_both_forms() {
        let codec = codec();
        assert!(codec.is_encryption_key("s3ep-hmac"));
        assert!(codec.is_encryption_key("hmac"));
        assert!(!codec.is_encryption_key("s3ep-unrelated"));
        assert!(!codec.is_encryption_key("completely-unrelated"));
    }
}
