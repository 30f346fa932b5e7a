//! Provider Registry: owns the configured KEKs, performs wrap/unwrap,
//! exposes fingerprints, and caches unwrapped DEKs.
//!
//! The AES path is grounded on `derivation.rs`'s `wrap_dek`/`unwrap_dek`
//! (AES-256-GCM, explicit nonce). The cache's concurrent-map shape and
//! audit-style bookkeeping are grounded on `hanzo-kbs/src/kms/memory_kms.rs`'s
//! `DashMap`-backed key store, but not its fixed wrap nonce (that source
//! snippet itself flags a fixed nonce as unsuitable for production): every
//! wrap here draws a fresh random nonce.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce as GcmNonce};
use dashmap::DashMap;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::config::{CoreConfig, ProviderConfig, ProviderKind};
use crate::crypto::GCM_NONCE_LEN;
use crate::error::{CoreError, Result};

pub const NONE_PROVIDER_FINGERPRINT: &str = "none-provider-fingerprint";

/// A single configured Key Encryption Key, tagged by kind as a variant of
/// {AES, RSA, None} rather than via a class hierarchy.
enum Kek {
    Aes { key: Secret<[u8; 32]> },
    #[cfg(feature = "rsa-provider")]
    Rsa {
        private: Box<rsa::RsaPrivateKey>,
        public: Box<rsa::RsaPublicKey>,
    },
    None,
}

impl Kek {
    fn wrap(&self, dek: &[u8; 32]) -> Result<Vec<u8>> {
        match self {
            Kek::Aes { key } => {
                let mut nonce = [0u8; GCM_NONCE_LEN];
                rand::rngs::OsRng.fill_bytes(&mut nonce);
                let cipher = Aes256Gcm::new_from_slice(key.expose_secret())
                    .map_err(|e| CoreError::CryptoError(e.to_string()))?;
                let ct = cipher
                    .encrypt(GcmNonce::from_slice(&nonce), Payload { msg: dek.as_slice(), aad: &[] })
                    .map_err(|_| CoreError::CryptoError("kek wrap failed".into()))?;
                let mut out = Vec::with_capacity(GCM_NONCE_LEN + ct.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&ct);
                Ok(out)
            }
            #[cfg(feature = "rsa-provider")]
            Kek::Rsa { public, .. } => {
                use rsa::Oaep;
                let padding = Oaep::new::<sha2::Sha256>();
                public
                    .encrypt(&mut rand::rngs::OsRng, padding, dek.as_slice())
                    .map_err(|e| CoreError::CryptoError(format!("rsa wrap failed: {e}")))
            }
            Kek::None => Ok(dek.to_vec()),
        }
    }

    fn unwrap(&self, wrapped: &[u8]) -> Result<[u8; 32]> {
        match self {
            Kek::Aes { key } => {
                if wrapped.len() < GCM_NONCE_LEN {
                    return Err(CoreError::CryptoError("wrapped dek too short".into()));
                }
                let (nonce, ct) = wrapped.split_at(GCM_NONCE_LEN);
                let cipher = Aes256Gcm::new_from_slice(key.expose_secret())
                    .map_err(|e| CoreError::CryptoError(e.to_string()))?;
                let pt = cipher
                    .decrypt(GcmNonce::from_slice(nonce), Payload { msg: ct, aad: &[] })
                    .map_err(|_| CoreError::CryptoError("kek unwrap failed (tampered or wrong kek)".into()))?;
                if pt.len() != 32 {
                    return Err(CoreError::CryptoError("unwrapped dek has wrong length".into()));
                }
                let mut dek = [0u8; 32];
                dek.copy_from_slice(&pt);
                Ok(dek)
            }
            #[cfg(feature = "rsa-provider")]
            Kek::Rsa { private, .. } => {
                use rsa::Oaep;
                let padding = Oaep::new::<sha2::Sha256>();
                let pt = private
                    .decrypt(padding, wrapped)
                    .map_err(|e| CoreError::CryptoError(format!("rsa unwrap failed: {e}")))?;
                if pt.len() != 32 {
                    return Err(CoreError::CryptoError("unwrapped dek has wrong length".into()));
                }
                let mut dek = [0u8; 32];
                dek.copy_from_slice(&pt);
                Ok(dek)
            }
            Kek::None => {
                if wrapped.len() != 32 {
                    return Err(CoreError::CryptoError("unwrapped dek has wrong length".into()));
                }
                let mut dek = [0u8; 32];
                dek.copy_from_slice(wrapped);
                Ok(dek)
            }
        }
    }

    /// SHA-256 of the canonical key encoding, truncated to 16 bytes, hex
    /// encoded.
    fn fingerprint(&self) -> String {
        match self {
            Kek::Aes { key } => {
                let digest = Sha256::digest(key.expose_secret());
                hex::encode(&digest[..16])
            }
            #[cfg(feature = "rsa-provider")]
            Kek::Rsa { public, .. } => {
                use rsa::traits::PublicKeyParts;
                let mut material = public.n().to_bytes_be();
                material.extend_from_slice(&public.e().to_bytes_be());
                let digest = Sha256::digest(&material);
                hex::encode(&digest[..16])
            }
            Kek::None => NONE_PROVIDER_FINGERPRINT.to_string(),
        }
    }
}

struct CachedDek {
    dek: Secret<[u8; 32]>,
    inserted_at: Instant,
}

/// Bounded cache from (fingerprint, object-key) to unwrapped DEK. Bounds
/// are enforced lazily on insert rather than via a background task: the
/// sweeper that matters for resource release is the multipart session
/// sweeper, and this cache is small and checked on its own hot path.
struct DekCache {
    entries: DashMap<(String, String), CachedDek>,
    max_entries: usize,
    max_age: Duration,
}

impl DekCache {
    fn new(max_entries: usize, max_age: Duration) -> Self {
        DekCache {
            entries: DashMap::new(),
            max_entries,
            max_age,
        }
    }

    fn get(&self, fingerprint: &str, object_key: &str) -> Option<[u8; 32]> {
        let key = (fingerprint.to_string(), object_key.to_string());
        let hit = self.entries.get(&key)?;
        if hit.inserted_at.elapsed() > self.max_age {
            drop(hit);
            self.entries.remove(&key);
            return None;
        }
        Some(*hit.dek.expose_secret())
    }

    fn insert(&self, fingerprint: &str, object_key: &str, dek: [u8; 32]) {
        if self.entries.len() >= self.max_entries {
            // Evict the single oldest entry rather than the whole cache,
            // which stays bounded and avoids a stop-the-world clear under load.
            if let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|e| e.value().inserted_at)
                .map(|e| e.key().clone())
            {
                self.entries.remove(&oldest_key);
            }
        }
        self.entries.insert(
            (fingerprint.to_string(), object_key.to_string()),
            CachedDek {
                dek: Secret::new(dek),
                inserted_at: Instant::now(),
            },
        );
    }

    /// Clear every cached entry on demand.
    fn clear(&self) {
        self.entries.clear();
    }
}

/// Owns every configured KEK plus the DEK cache. Constructed once at
/// startup from [`CoreConfig`] and never mutated afterward: treated as
/// constructed at startup and destroyed at shutdown.
pub struct ProviderRegistry {
    keks: HashMap<String, Kek>,
    fingerprints: HashMap<String, String>,
    active_alias: String,
    cache: DekCache,
}

impl ProviderRegistry {
    pub fn new(config: &CoreConfig) -> Result<Self> {
        config.validate()?;
        let mut keks = HashMap::new();
        let mut fingerprints = HashMap::new();
        for p in &config.providers {
            let kek = build_kek(p)?;
            fingerprints.insert(p.alias.clone(), kek.fingerprint());
            keks.insert(p.alias.clone(), kek);
        }
        Ok(ProviderRegistry {
            keks,
            fingerprints,
            active_alias: config.active_provider_alias.clone(),
            cache: DekCache::new(config.dek_cache_max_entries, config.dek_cache_max_age),
        })
    }

    fn active_kek(&self) -> Result<&Kek> {
        self.keks
            .get(&self.active_alias)
            .ok_or_else(|| CoreError::provider(Some(&self.active_alias), "no active kek configured"))
    }

    /// Wrap `dek` under the active KEK.
    pub fn wrap(&self, dek: &[u8; 32]) -> Result<Vec<u8>> {
        tracing::debug!(alias = %self.active_alias, "wrapping dek");
        self.active_kek()?.wrap(dek)
    }

    /// Unwrap `wrapped`, looking up the KEK by `fingerprint`. The result is
    /// cached under (fingerprint, object_key) to amortize repeated GETs of
    /// the same object.
    pub fn unwrap(&self, wrapped: &[u8], fingerprint: &str, object_key: &str) -> Result<[u8; 32]> {
        if let Some(dek) = self.cache.get(fingerprint, object_key) {
            tracing::debug!(%fingerprint, object_key, "dek cache hit");
            return Ok(dek);
        }
        if fingerprint == NONE_PROVIDER_FINGERPRINT {
            let dek = Kek::None.unwrap(wrapped)?;
            return Ok(dek);
        }
        let alias = self
            .fingerprints
            .iter()
            .find(|(_, fp)| fp.as_str() == fingerprint)
            .map(|(alias, _)| alias.clone())
            .ok_or_else(|| CoreError::provider(None, format!("no kek matches fingerprint {fingerprint}")))?;
        tracing::debug!(%fingerprint, object_key, %alias, "dek cache miss, unwrapping");
        let kek = self
            .keks
            .get(&alias)
            .ok_or_else(|| CoreError::provider(Some(&alias), "kek disappeared from registry"))?;
        let dek = kek.unwrap(wrapped)?;
        self.cache.insert(fingerprint, object_key, dek);
        Ok(dek)
    }

    pub fn fingerprint_of(&self, alias: &str) -> Result<String> {
        self.fingerprints
            .get(alias)
            .cloned()
            .ok_or_else(|| CoreError::provider(Some(alias), "unknown provider alias"))
    }

    pub fn active_fingerprint(&self) -> Result<String> {
        self.fingerprint_of(&self.active_alias)
    }

    pub fn active_provider_alias(&self) -> &str {
        &self.active_alias
    }

    pub fn provider_aliases(&self) -> Vec<String> {
        let mut v: Vec<String> = self.keks.keys().cloned().collect();
        v.sort();
        v
    }

    pub fn is_active_none(&self) -> bool {
        matches!(self.keks.get(&self.active_alias), Some(Kek::None))
    }

    pub fn clear_dek_cache(&self) {
        self.cache.clear();
    }
}

fn build_kek(p: &ProviderConfig) -> Result<Kek> {
    match p.kind {
        ProviderKind::Aes => {
            let material = p
                .key_material
                .as_ref()
                .ok_or_else(|| CoreError::ConfigError(format!("provider {:?}: missing key_material", p.alias)))?;
            if material.len() != 32 {
                return Err(CoreError::ConfigError(format!(
                    "provider {:?}: aes key material must be 32 bytes",
                    p.alias
                )));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(material);
            let kek = Kek::Aes { key: Secret::new(key) };
            key.zeroize();
            Ok(kek)
        }
        ProviderKind::Rsa => {
            #[cfg(feature = "rsa-provider")]
            {
                let der = p
                    .key_material
                    .as_ref()
                    .ok_or_else(|| CoreError::ConfigError(format!("provider {:?}: missing key_material", p.alias)))?;
                use rsa::pkcs8::DecodePrivateKey;
                let private = rsa::RsaPrivateKey::from_pkcs8_der(der)
                    .map_err(|e| CoreError::ConfigError(format!("provider {:?}: invalid rsa key: {e}", p.alias)))?;
                let public = rsa::RsaPublicKey::from(&private);
                Ok(Kek::Rsa {
                    private: Box::new(private),
                    public: Box::new(public),
                })
            }
            #[cfg(not(feature = "rsa-provider"))]
            {
                Err(CoreError::ConfigError(format!(
                    "provider {:?}: rsa support not compiled in (enable the rsa-provider feature)",
                    p.alias
                )))
            }
        }
        ProviderKind::None => Ok(Kek::None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aes_config(alias: &str, key_byte: u8) -> ProviderConfig {
        ProviderConfig {
            alias: alias.to_string(),
            kind: ProviderKind::Aes,
            key_material: Some(vec![key_byte; 32]),
        }
    }

    fn registry_with(providers: Vec<ProviderConfig>, active: &str) -> ProviderRegistry {
        let cfg = CoreConfig {
            providers,
            active_provider_alias: active.to_string(),
            ..CoreConfig::default()
        };
        ProviderRegistry::new(&cfg).unwrap()
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let reg = registry_with(vec![aes_config("k1", 7)], "k1");
        let dek = [42u8; 32];
        let wrapped = reg.wrap(&dek).unwrap();
        let fp = reg.active_fingerprint().unwrap();
        let back = reg.unwrap(&wrapped, &fp, "obj").unwrap();
        assert_eq!(back, dek);
    }

    #[test]
    fn wrap_uses_random_nonce_each_time() {
        let reg = registry_with(vec![aes_config("k1", 7)], "k1");
        let dek = [1u8; 32];
        let w1 = reg.wrap(&dek).unwrap();
        let w2 = reg.wrap(&dek).unwrap();
        assert_ne!(w1, w2, "wrap must not be deterministic across calls");
        let fp = reg.active_fingerprint().unwrap();
        assert_eq!(reg.unwrap(&w1, &fp, "o1").unwrap(), dek);
        assert_eq!(reg.unwrap(&w2, &fp, "o2").unwrap(), dek);
    }

    #[test]
    fn unwrap_with_unknown_fingerprint_fails() {
        let reg = registry_with(vec![aes_config("k1", 7)], "k1");
        let wrapped = reg.wrap(&[1u8; 32]).unwrap();
        let err = reg.unwrap(&wrapped, "0000000000000000000000000000000", "obj").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Provider);
    }

    #[test]
    fn unwrap_tampered_ciphertext_fails() {
        let reg = registry_with(vec![aes_config("k1", 7)], "k1");
        let mut wrapped = reg.wrap(&[9u8; 32]).unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x01;
        let fp = reg.active_fingerprint().unwrap();
        assert!(reg.unwrap(&wrapped, &fp, "obj").is_err());
    }

    #[test]
    fn none_provider_passes_through() {
        let providers = vec![ProviderConfig {
            alias: "none".into(),
            kind: ProviderKind::None,
            key_material: None,
        }];
        let reg = registry_with(providers, "none");
        assert_eq!(reg.active_fingerprint().unwrap(), NONE_PROVIDER_FINGERPRINT);
        let dek = [5u8; 32];
        let wrapped = reg.wrap(&dek).unwrap();
        assert_eq!(wrapped, dek.to_vec());
        assert!(reg.is_active_none());
    }

    #[test]
    fn dek_cache_amortizes_repeat_unwraps() {
        let reg = registry_with(vec![aes_config("k1", 3)], "k1");
        let dek = [11u8; 32];
        let wrapped = reg.wrap(&dek).unwrap();
        let fp = reg.active_fingerprint().unwrap();
        let first = reg.unwrap(&wrapped, &fp, "same-key").unwrap();
        // Corrupt the wrapped bytes; a cache hit must still return the
        // original DEK without touching the (now-invalid) ciphertext.
        let mut corrupted = wrapped.clone();
        corrupted[0] ^= 0xff;
        let second = reg.unwrap(&corrupted, &fp, "same-key").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn clear_dek_cache_forces_recompute() {
        let reg = registry_with(vec![aes_config("k1", 3)], "k1");
        let dek = [11u8; 32];
        let wrapped = reg.wrap(&dek).unwrap();
        let fp = reg.active_fingerprint().unwrap();
        reg.unwrap(&wrapped, &fp, "k").unwrap();
        reg.clear_dek_cache();
        let mut corrupted = wrapped.clone();
        corrupted[0] ^= 0xff;
        assert!(reg.unwrap(&corrupted, &fp, "k").is_err());
    }

    #[test]
    fn fingerprint_stable_for_same_key_material() {
        let reg1 = registry_with(vec![aes_config("k1", 99)], "k1");
        let reg2 = registry_with(vec![aes_config("k1", 99)], "k1");
        assert_eq!(reg1.active_fingerprint().unwrap(), reg2.active_fingerprint().unwrap());
    }

    #[test]
    fn provider_aliases_lists_all_configured() {
        let reg = registry_with(vec![aes_config("a", 1), aes_config("b", 2)], "a");
        assert_eq!(reg.provider_aliases(), vec!["a".to_string(), "b".to_string()]);
    }
}
