//! Orchestrator: top-level dispatch. Chooses an engine from content hints
//! and size, and assembles the externally-visible metadata.
//!
//! Owns every other component and is the one type the S3 protocol layer
//! actually talks to. Grounded on `qsfs-core/src/lib.rs`'s `seal`/`unseal`
//! entry points, which likewise own the provider/derivation state and
//! dispatch to the lower-level primitives based on a request shape.

use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::config::{CoreConfig, HmacPolicyMode, IntegrityPolicy};
use crate::crypto;
use crate::error::{CoreError, Result};
use crate::hmac_policy::{should_attach_hmac, AlgorithmAuthenticates};
use crate::metadata::{BuildFields, ContentType, DekAlgorithm, KekAlgorithm, MetadataCodec, MetadataDict};
use crate::multipart::{MultipartDecryptManager, MultipartManager, PartResult};
use crate::provider::ProviderRegistry;
use crate::single_part;
use crate::streaming::{self, BufferPool, CancellationToken, DecryptingReader, EncryptingReader};

/// Explicit content-type override for `encrypt_bytes`: an explicit hint
/// always wins over the size-based routing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentTypeHint {
    Whole,
    Multipart,
}

/// Resolves once an [`EncryptingReader`]-backed stream reaches EOF: the
/// immediate fields (fingerprint, wrapped DEK, IV) are known up front, only
/// the HMAC tag depends on having seen every byte.
pub struct StreamMetadataHandle {
    codec: MetadataCodec,
    kek_algorithm: KekAlgorithm,
    kek_fingerprint: String,
    wrapped_dek: Vec<u8>,
    iv: [u8; crypto::CTR_IV_LEN],
    with_hmac: bool,
    inner: streaming::MetadataHandle,
}

impl StreamMetadataHandle {
    /// `None` until the paired reader has been fully drained.
    pub fn try_get(&self) -> Option<MetadataDict> {
        let final_meta = self.inner.try_get()?;
        Some(self.codec.build(&BuildFields {
            dek_algorithm: DekAlgorithm::Aes256Ctr,
            kek_algorithm: self.kek_algorithm,
            kek_fingerprint: &self.kek_fingerprint,
            encrypted_dek: Some(&self.wrapped_dek),
            aes_iv: Some(&self.iv),
            hmac: final_meta.hmac.as_ref().filter(|_| self.with_hmac).map(|t| t.as_slice()),
            content_type: ContentType::Multipart,
            upload_id: None,
            total_parts: None,
        }))
    }
}

/// Owns every configured component; this is the type the S3 protocol layer
/// constructs once at startup and calls into per request.
pub struct Orchestrator {
    registry: ProviderRegistry,
    codec: MetadataCodec,
    config: CoreConfig,
    pool: Arc<BufferPool>,
    multipart: MultipartManager,
    multipart_decrypt: MultipartDecryptManager,
}

impl Orchestrator {
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        let registry = ProviderRegistry::new(&config)?;
        let codec = MetadataCodec::new(config.metadata_prefix.clone());
        let pool = BufferPool::new(config.streaming_segment_size);
        let multipart = MultipartManager::new(config.session_idle_timeout);
        let multipart_decrypt = MultipartDecryptManager::new(config.session_idle_timeout);
        Ok(Orchestrator {
            registry,
            codec,
            config,
            pool,
            multipart,
            multipart_decrypt,
        })
    }

    fn kek_algorithm(&self) -> KekAlgorithm {
        if self.registry.is_active_none() {
            KekAlgorithm::None
        } else {
            KekAlgorithm::Aes
        }
    }

    fn use_gcm(&self, hint: Option<ContentTypeHint>, len: usize) -> bool {
        match hint {
            Some(ContentTypeHint::Whole) => true,
            Some(ContentTypeHint::Multipart) => false,
            None => len < self.config.streaming_threshold,
        }
    }

    /// `encrypt_bytes`. Passes through untouched when the active
    /// provider is `none`.
    pub fn encrypt_bytes(
        &self,
        object_key: &str,
        plaintext: &[u8],
        content_type_hint: Option<ContentTypeHint>,
    ) -> Result<(Vec<u8>, Vec<u8>, MetadataDict)> {
        if self.registry.is_active_none() {
            return Ok((plaintext.to_vec(), Vec::new(), MetadataDict::new()));
        }
        if self.use_gcm(content_type_hint, plaintext.len()) {
            let blob = single_part::gcm_encrypt(&self.registry, &self.codec, object_key, plaintext)?;
            Ok((blob.ciphertext, blob.wrapped_dek, blob.metadata))
        } else {
            let blob = single_part::ctr_encrypt(&self.registry, &self.codec, object_key, plaintext, self.config.hmac_policy)?;
            Ok((blob.ciphertext, blob.wrapped_dek, blob.metadata))
        }
    }

    /// `decrypt_bytes`. Dispatches on the `dek-algorithm` metadata field;
    /// missing metadata is handled per `integrity_verification` policy.
    pub fn decrypt_bytes(&self, ciphertext: &[u8], wrapped_dek: &[u8], metadata: &MetadataDict, object_key: &str) -> Result<Vec<u8>> {
        let parsed = self.codec.parse(metadata);
        let algo = match parsed.dek_algorithm {
            Some(a) => a,
            None => return self.handle_missing_metadata(ciphertext, object_key),
        };
        match algo {
            DekAlgorithm::None => Ok(ciphertext.to_vec()),
            DekAlgorithm::Aes256Gcm => {
                let fp = parsed
                    .kek_fingerprint
                    .ok_or_else(|| CoreError::Policy("metadata missing kek-fingerprint".into()))?;
                single_part::gcm_decrypt(&self.registry, wrapped_dek, &fp, object_key, ciphertext)
            }
            DekAlgorithm::Aes256Ctr => {
                let fp = parsed
                    .kek_fingerprint
                    .ok_or_else(|| CoreError::Policy("metadata missing kek-fingerprint".into()))?;
                let iv_bytes = parsed.aes_iv.ok_or_else(|| CoreError::Policy("metadata missing aes-iv".into()))?;
                if iv_bytes.len() != crypto::CTR_IV_LEN {
                    return Err(CoreError::Policy("aes-iv has wrong length".into()));
                }
                let mut iv = [0u8; crypto::CTR_IV_LEN];
                iv.copy_from_slice(&iv_bytes);
                single_part::ctr_decrypt(&self.registry, wrapped_dek, &fp, object_key, &iv, ciphertext, parsed.hmac.as_deref())
            }
        }
    }

    fn handle_missing_metadata(&self, ciphertext: &[u8], object_key: &str) -> Result<Vec<u8>> {
        match self.config.integrity_verification {
            IntegrityPolicy::Strict => Err(CoreError::Policy(format!(
                "object {object_key:?} has no encryption metadata under strict integrity_verification policy"
            ))),
            IntegrityPolicy::Lax => Ok(ciphertext.to_vec()),
            IntegrityPolicy::Hybrid => {
                tracing::warn!(object_key, "no encryption metadata found, treating object as plaintext");
                Ok(ciphertext.to_vec())
            }
        }
    }

    /// `encrypt_reader`. Always routes through the streaming engine
    /// (AES-256-CTR): a reader's total length is not known up front, so the
    /// GCM/CTR size-threshold rule for single-part objects does not apply here.
    pub fn encrypt_reader<R: AsyncRead + Unpin>(&self, reader: R, cancel: CancellationToken) -> Result<(EncryptingReader<R>, StreamMetadataHandle)> {
        let dek = crypto::generate_dek();
        let iv = crypto::generate_ctr_iv();
        let with_hmac = should_attach_hmac(self.config.hmac_policy, AlgorithmAuthenticates::No);
        let wrapped_dek = self.registry.wrap(&dek)?;
        let kek_fingerprint = self.registry.active_fingerprint()?;

        let (enc, stream_handle) = EncryptingReader::new(reader, &dek, &iv, self.pool.clone(), with_hmac, cancel)?;
        let handle = StreamMetadataHandle {
            codec: self.codec.clone(),
            kek_algorithm: self.kek_algorithm(),
            kek_fingerprint,
            wrapped_dek,
            iv,
            with_hmac,
            inner: stream_handle,
        };
        Ok((enc, handle))
    }

    /// `decrypt_reader`. `wrapped_dek` and the IV/HMAC tag are taken
    /// from `metadata`, so only the ciphertext source and object key (for
    /// the DEK cache key) need to be supplied by the caller.
    pub fn decrypt_reader<R: AsyncRead + Unpin>(
        &self,
        reader: R,
        metadata: &MetadataDict,
        object_key: &str,
        cancel: CancellationToken,
    ) -> Result<DecryptingReader<R>> {
        let parsed = self.codec.parse(metadata);
        if parsed.dek_algorithm != Some(DekAlgorithm::Aes256Ctr) {
            return Err(CoreError::Policy("decrypt_reader requires an aes-256-ctr object".into()));
        }
        let fingerprint = parsed
            .kek_fingerprint
            .ok_or_else(|| CoreError::Policy("metadata missing kek-fingerprint".into()))?;
        let wrapped_dek = parsed
            .encrypted_dek
            .ok_or_else(|| CoreError::Policy("metadata missing encrypted-dek".into()))?;
        let iv_bytes = parsed.aes_iv.ok_or_else(|| CoreError::Policy("metadata missing aes-iv".into()))?;
        if iv_bytes.len() != crypto::CTR_IV_LEN {
            return Err(CoreError::Policy("aes-iv has wrong length".into()));
        }
        let mut iv = [0u8; crypto::CTR_IV_LEN];
        iv.copy_from_slice(&iv_bytes);

        let dek = self.registry.unwrap(&wrapped_dek, &fingerprint, object_key)?;
        let expected_hmac: Option<[u8; 32]> = match parsed.hmac {
            Some(bytes) if bytes.len() == 32 => {
                let mut t = [0u8; 32];
                t.copy_from_slice(&bytes);
                Some(t)
            }
            Some(_) => return Err(CoreError::Policy("hmac metadata has wrong length".into())),
            None => None,
        };

        DecryptingReader::new(reader, &dek, &iv, self.pool.clone(), expected_hmac, cancel)
    }

    // -- Multipart (encrypt side) --

    pub fn initiate(&self, upload_id: &str, object_key: &str, bucket: &str) -> Result<()> {
        self.multipart.initiate(&self.registry, upload_id, object_key, bucket)
    }

    pub fn process_part(&self, upload_id: &str, part_number: u32, plaintext: &[u8]) -> Result<PartResult> {
        let attach_hmac = should_attach_hmac(self.config.hmac_policy, AlgorithmAuthenticates::No);
        self.multipart.process_part(attach_hmac, upload_id, part_number, plaintext)
    }

    pub fn record_etag(&self, upload_id: &str, part_number: u32, etag: &str) -> Result<()> {
        self.multipart.record_etag(upload_id, part_number, etag)
    }

    pub fn finalize(&self, upload_id: &str) -> Result<MetadataDict> {
        let attach_hmac = should_attach_hmac(self.config.hmac_policy, AlgorithmAuthenticates::No);
        self.multipart.finalize(&self.registry, &self.codec, upload_id, attach_hmac)
    }

    pub fn abort(&self, upload_id: &str) {
        self.multipart.abort(upload_id)
    }

    pub fn sweep_multipart_idle(&self) {
        self.multipart.sweep_idle();
        self.multipart_decrypt.sweep_idle();
    }

    // -- Multipart (decrypt side) --

    pub fn initiate_decrypt(&self, session_id: &str, object_key: &str, wrapped_dek: &[u8], metadata: &MetadataDict) -> Result<()> {
        self.multipart_decrypt
            .initiate_decrypt(&self.registry, session_id, object_key, wrapped_dek, &self.codec, metadata)
    }

    pub fn decrypt_part(&self, session_id: &str, part_number: u32, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.multipart_decrypt.decrypt_part(session_id, part_number, ciphertext)
    }

    pub fn complete_decrypt(&self, session_id: &str) -> Result<()> {
        self.multipart_decrypt.complete_decrypt(session_id)
    }

    pub fn cleanup_decrypt(&self, session_id: &str) {
        self.multipart_decrypt.cleanup_decrypt(session_id)
    }

    // -- Introspection --

    pub fn active_provider_alias(&self) -> &str {
        self.registry.active_provider_alias()
    }

    pub fn provider_aliases(&self) -> Vec<String> {
        self.registry.provider_aliases()
    }

    pub fn strip_metadata_for_client(&self, dict: &MetadataDict) -> MetadataDict {
        self.codec.strip_for_client(dict)
    }

    pub fn clear_dek_cache(&self) {
        self.registry.clear_dek_cache()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, ProviderKind};
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    fn config_with(providers: Vec<ProviderConfig>, active: &str) -> CoreConfig {
        CoreConfig {
            providers,
            active_provider_alias: active.to_string(),
            streaming_threshold: 1024,
            ..CoreConfig::default()
        }
    }

    fn aes_provider(alias: &str) -> ProviderConfig {
        ProviderConfig {
            alias: alias.to_string(),
            kind: ProviderKind::Aes,
            key_material: Some(vec![9u8; 32]),
        }
    }

    #[test]
    fn small_object_routes_to_gcm_scenario_1() {
        let orch = Orchestrator::new(config_with(vec![aes_provider("k1")], "k1")).unwrap();
        let (ct, wrapped, meta) = orch.encrypt_bytes("obj", b"small payload", None).unwrap();
        assert_eq!(meta.get("s3ep-dek-algorithm").unwrap(), "aes-256-gcm");
        let back = orch.decrypt_bytes(&ct, &wrapped, &meta, "obj").unwrap();
        assert_eq!(back, b"small payload");
    }

    #[test]
    fn large_object_routes_to_ctr_scenario_2() {
        let orch = Orchestrator::new(config_with(vec![aes_provider("k1")], "k1")).unwrap();
        let plaintext = vec![5u8; 2048];
        let (ct, wrapped, meta) = orch.encrypt_bytes("obj", &plaintext, None).unwrap();
        assert_eq!(meta.get("s3ep-dek-algorithm").unwrap(), "aes-256-ctr");
        let back = orch.decrypt_bytes(&ct, &wrapped, &meta, "obj").unwrap();
        assert_eq!(back, plaintext);
    }

    #[test]
    fn none_provider_passthrough_scenario_5() {
        let orch = Orchestrator::new(config_with(
            vec![ProviderConfig {
                alias: "none".into(),
                kind: ProviderKind::None,
                key_material: None,
            }],
            "none",
        ))
        .unwrap();
        let (ct, wrapped, meta) = orch.encrypt_bytes("obj", b"plaintext passes through", None).unwrap();
        assert_eq!(ct, b"plaintext passes through");
        assert!(wrapped.is_empty());
        assert!(meta.is_empty());
    }

    #[test]
    fn strict_policy_rejects_missing_metadata_scenario_6() {
        let orch = Orchestrator::new(config_with(vec![aes_provider("k1")], "k1")).unwrap();
        let err = orch.decrypt_bytes(b"raw bytes", b"", &MetadataDict::new(), "obj").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Policy);
    }

    #[test]
    fn lax_policy_passes_through_missing_metadata() {
        let mut cfg = config_with(vec![aes_provider("k1")], "k1");
        cfg.integrity_verification = IntegrityPolicy::Lax;
        let orch = Orchestrator::new(cfg).unwrap();
        let back = orch.decrypt_bytes(b"raw bytes", b"", &MetadataDict::new(), "obj").unwrap();
        assert_eq!(back, b"raw bytes");
    }

    #[tokio::test]
    async fn encrypt_reader_round_trips_through_decrypt_reader() {
        let orch = Orchestrator::new(config_with(vec![aes_provider("k1")], "k1")).unwrap();
        let plaintext: Vec<u8> = (0..50_000u32).map(|i| (i % 256) as u8).collect();

        let (enc, handle) = orch.encrypt_reader(Cursor::new(plaintext.clone()), CancellationToken::new()).unwrap();
        let mut ciphertext = Vec::new();
        {
            let mut enc = enc;
            enc.read_to_end(&mut ciphertext).await.unwrap();
        }
        let metadata = handle.try_get().expect("metadata ready after EOF");

        let dec = orch
            .decrypt_reader(Cursor::new(ciphertext), &metadata, "stream/object", CancellationToken::new())
            .unwrap();
        let mut back = Vec::new();
        {
            let mut dec = dec;
            dec.read_to_end(&mut back).await.unwrap();
        }
        assert_eq!(back, plaintext);
    }

    #[test]
    fn introspection_exposes_configured_providers() {
        let orch = Orchestrator::new(config_with(vec![aes_provider("k1"), aes_provider("k2")], "k1")).unwrap();
        assert_eq!(orch.active_provider_alias(), "k1");
        assert_eq!(orch.provider_aliases(), vec!["k1".to_string(), "k2".to_string()]);
    }
}
