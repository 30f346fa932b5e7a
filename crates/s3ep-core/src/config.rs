use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// One configured Key Encryption Key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub alias: String,
    #[serde(rename = "type")]
    pub kind: ProviderKind,
    /// Type-specific key material. For `aes`, 32 raw bytes. For `rsa`, a
    /// DER-encoded PKCS#8 private key. Unused for `none`.
    #[serde(default, with = "hex_opt")]
    pub key_material: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Aes,
    Rsa,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HmacPolicyMode {
    Always,
    Never,
    Auto,
}

impl Default for HmacPolicyMode {
    fn default() -> Self {
        HmacPolicyMode::Auto
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityPolicy {
    Strict,
    Lax,
    Hybrid,
}

impl Default for IntegrityPolicy {
    fn default() -> Self {
        IntegrityPolicy::Strict
    }
}

fn default_metadata_prefix() -> String {
    "s3ep-".to_string()
}

fn default_segment_size() -> usize {
    12 * 1024 * 1024
}

fn default_threshold() -> usize {
    5 * 1024 * 1024
}

fn default_session_idle_timeout() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_dek_cache_max_entries() -> usize {
    4096
}

fn default_dek_cache_max_age() -> Duration {
    Duration::from_secs(10 * 60)
}

/// Loaded once at startup; the registry and every engine treat it as
/// immutable thereafter. Key rotation is a process restart with a new
/// config, not a config reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub providers: Vec<ProviderConfig>,
    pub active_provider_alias: String,

    #[serde(default = "default_metadata_prefix")]
    pub metadata_prefix: String,

    #[serde(default = "default_segment_size")]
    pub streaming_segment_size: usize,

    #[serde(default = "default_threshold")]
    pub streaming_threshold: usize,

    #[serde(default)]
    pub hmac_policy: HmacPolicyMode,

    #[serde(default)]
    pub integrity_verification: IntegrityPolicy,

    #[serde(default = "default_session_idle_timeout", with = "duration_secs")]
    pub session_idle_timeout: Duration,

    #[serde(default = "default_dek_cache_max_entries")]
    pub dek_cache_max_entries: usize,

    #[serde(default = "default_dek_cache_max_age", with = "duration_secs")]
    pub dek_cache_max_age: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            providers: Vec::new(),
            active_provider_alias: String::new(),
            metadata_prefix: default_metadata_prefix(),
            streaming_segment_size: default_segment_size(),
            streaming_threshold: default_threshold(),
            hmac_policy: HmacPolicyMode::default(),
            integrity_verification: IntegrityPolicy::default(),
            session_idle_timeout: default_session_idle_timeout(),
            dek_cache_max_entries: default_dek_cache_max_entries(),
            dek_cache_max_age: default_dek_cache_max_age(),
        }
    }
}

impl CoreConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: CoreConfig =
            serde_json::from_str(s).map_err(|e| CoreError::ConfigError(format!("malformed config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            return Err(CoreError::ConfigError("providers list is empty".into()));
        }
        if !self
            .providers
            .iter()
            .any(|p| p.alias == self.active_provider_alias)
        {
            return Err(CoreError::ConfigError(format!(
                "active_provider_alias {:?} does not match any configured provider",
                self.active_provider_alias
            )));
        }
        if self.streaming_segment_size == 0 {
            return Err(CoreError::ConfigError("streaming_segment_size must be non-zero".into()));
        }
        for p in &self.providers {
            match p.kind {
                ProviderKind::Aes => {
                    let len = p.key_material.as_ref().map(|k| k.len()).unwrap_or(0);
                    if len != 32 {
                        return Err(CoreError::ConfigError(format!(
                            "provider {:?}: aes key material must be 32 bytes, got {len}",
                            p.alias
                        )));
                    }
                }
                ProviderKind::Rsa => {
                    if p.key_material.is_none() {
                        return Err(CoreError::ConfigError(format!(
                            "provider {:?}: rsa provider requires key_material",
                            p.alias
                        )));
                    }
                }
                ProviderKind::None => {}
            }
        }
        Ok(())
    }
}

mod hex_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> std::result::Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<Vec<u8>>, D::Error> {
        let opt: Option<String> = Option::deserialize(d)?;
        match opt {
            Some(s) => hex::decode(s.as_bytes())
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        r#"{
            "providers": [
                {"alias": "k1", "type": "aes", "key_material": "0101010101010101010101010101010101010101010101010101010101010101"},
                {"alias": "none", "type": "none"}
            ],
            "active_provider_alias": "k1"
        }"#
        .replace("0101010101010101010101010101010101010101010101010101010101010101", &"01".repeat(32))
    }

    #[test]
    fn loads_with_defaults() {
        let cfg = CoreConfig::from_json(&sample_json()).unwrap();
        assert_eq!(cfg.metadata_prefix, "s3ep-");
        assert_eq!(cfg.streaming_threshold, 5 * 1024 * 1024);
        assert_eq!(cfg.integrity_verification, IntegrityPolicy::Strict);
    }

    #[test]
    fn rejects_unknown_active_alias() {
        let mut cfg = CoreConfig::from_json(&sample_json()).unwrap();
        cfg.active_provider_alias = "missing".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_empty_providers() {
        let cfg = CoreConfig {
            providers: vec![],
            active_provider_alias: "x".into(),
            ..CoreConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_short_aes_key() {
        let cfg = CoreConfig {
            providers: vec![ProviderConfig {
                alias: "k1".into(),
                kind: ProviderKind::Aes,
                key_material: Some(vec![0u8; 16]),
            }],
            active_provider_alias: "k1".into(),
            ..CoreConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
