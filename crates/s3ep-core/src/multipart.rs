//! Multipart Session Manager: correlates many part-upload/part-GET requests
//! into one encrypted object, one contiguous CTR keystream, and one HMAC
//! accumulator per upload.
//!
//! Grounded on `hanzo-kbs/src/kbs.rs`'s `DashMap<Uuid, SessionInfo>` shape
//! for the concurrent session map. The per-session `Mutex` plus "map lock
//! before session lock" ordering falls out of that directly: DashMap shards
//! already give the sharded map lock, and the `Mutex` inside each entry is
//! the per-session lock.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use secrecy::{ExposeSecret, Secret};
use zeroize::Zeroize;

use crate::crypto::{self, CtrCipher};
use crate::error::{CoreError, Result};
use crate::hmac_policy::HmacAccumulator;
use crate::metadata::{BuildFields, ContentType, DekAlgorithm, KekAlgorithm, MetadataCodec, MetadataDict};
use crate::provider::ProviderRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Completed,
    Aborted,
}

struct EncryptSession {
    object_key: String,
    #[allow(dead_code)]
    bucket: String,
    dek: Option<Secret<[u8; 32]>>,
    iv: [u8; crypto::CTR_IV_LEN],
    kek_fingerprint: String,
    hmac: HmacAccumulator,
    next_expected: u32,
    total_plaintext_len: u64,
    part_sizes: Vec<(u32, u64)>,
    etags: Vec<(u32, String)>,
    created_at: Instant,
    state: SessionState,
}

/// One part's ciphertext plus the metadata the S3 layer should attach to
/// that part's upload (rarely more than the content type tag; the full
/// envelope metadata is only known at `finalize`).
pub struct PartResult {
    pub ciphertext: Vec<u8>,
}

/// Encrypt-side multipart sessions, keyed by upload id.
pub struct MultipartManager {
    sessions: DashMap<String, Mutex<EncryptSession>>,
    idle_timeout: Duration,
}

impl MultipartManager {
    pub fn new(idle_timeout: Duration) -> Self {
        MultipartManager {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    pub fn initiate(&self, registry: &ProviderRegistry, upload_id: &str, object_key: &str, bucket: &str) -> Result<()> {
        if self.sessions.contains_key(upload_id) {
            return Err(CoreError::Conflict(upload_id.to_string()));
        }
        let dek = crypto::generate_dek();
        let iv = crypto::generate_ctr_iv();
        let kek_fingerprint = registry.active_fingerprint()?;
        let session = EncryptSession {
            object_key: object_key.to_string(),
            bucket: bucket.to_string(),
            hmac: HmacAccumulator::new(&dek),
            dek: Some(Secret::new(dek)),
            iv,
            kek_fingerprint,
            next_expected: 1,
            total_plaintext_len: 0,
            part_sizes: Vec::new(),
            etags: Vec::new(),
            created_at: Instant::now(),
            state: SessionState::Open,
        };
        self.sessions.insert(upload_id.to_string(), Mutex::new(session));
        tracing::info!(upload_id, object_key, "multipart session opened");
        Ok(())
    }

    /// Encrypt one part. Counter offset is the running plaintext byte total
    /// *before* this part, which keeps every part a disjoint window of a
    /// single contiguous CTR keystream.
    pub fn process_part(
        &self,
        hmac_policy_attach: bool,
        upload_id: &str,
        part_number: u32,
        plaintext: &[u8],
    ) -> Result<PartResult> {
        let entry = self
            .sessions
            .get(upload_id)
            .ok_or_else(|| CoreError::NotFound(upload_id.to_string()))?;
        let mut session = entry.lock().expect("session mutex poisoned");
        if session.state != SessionState::Open {
            return Err(CoreError::Conflict(format!("{upload_id} is not open")));
        }
        if part_number != session.next_expected {
            return Err(CoreError::OutOfOrder {
                upload_id: upload_id.to_string(),
                expected: session.next_expected,
                got: part_number,
            });
        }
        let dek = *session
            .dek
            .as_ref()
            .expect("dek present while session is open")
            .expose_secret();
        let offset = session.total_plaintext_len;

        let mut ciphertext = plaintext.to_vec();
        let mut cipher = CtrCipher::new(&dek, &session.iv)?;
        cipher.seek_to(offset)?;
        cipher.apply(&mut ciphertext);

        if hmac_policy_attach {
            // Non-terminal update: sequential enforcement already happened
            // above against the session's own counter, so a plain update
            // (not update_sequential) is correct and avoids double-checking
            // against the accumulator's independent counter.
            session.hmac.update(plaintext);
        }

        session.total_plaintext_len += plaintext.len() as u64;
        session.part_sizes.push((part_number, plaintext.len() as u64));
        session.next_expected += 1;

        tracing::debug!(upload_id, part_number, len = plaintext.len(), "multipart part encrypted");
        Ok(PartResult { ciphertext })
    }

    pub fn record_etag(&self, upload_id: &str, part_number: u32, etag: &str) -> Result<()> {
        let entry = self
            .sessions
            .get(upload_id)
            .ok_or_else(|| CoreError::NotFound(upload_id.to_string()))?;
        let mut session = entry.lock().expect("session mutex poisoned");
        session.etags.push((part_number, etag.to_string()));
        Ok(())
    }

    /// Wrap the session DEK once, emit the completion metadata dictionary,
    /// and mark the session COMPLETED. The session entry itself is removed
    /// immediately after: a completed or aborted session must not satisfy
    /// any subsequent lookup, so finalize or abort happens-before any
    /// later lookup sees NotFound.
    pub fn finalize(&self, registry: &ProviderRegistry, codec: &MetadataCodec, upload_id: &str, hmac_attached: bool) -> Result<MetadataDict> {
        let (_, entry) = self
            .sessions
            .remove(upload_id)
            .ok_or_else(|| CoreError::NotFound(upload_id.to_string()))?;
        let mut session = entry.into_inner().expect("session mutex poisoned");
        if session.state != SessionState::Open {
            return Err(CoreError::Conflict(format!("{upload_id} already finalized or aborted")));
        }

        let dek = *session
            .dek
            .as_ref()
            .expect("dek present while session is open")
            .expose_secret();
        let wrapped_dek = registry.wrap(&dek)?;
        let tag = hmac_attached.then(|| session.hmac.finalize());

        let metadata = codec.build(&BuildFields {
            dek_algorithm: DekAlgorithm::Aes256Ctr,
            kek_algorithm: if registry.is_active_none() { KekAlgorithm::None } else { KekAlgorithm::Aes },
            kek_fingerprint: &session.kek_fingerprint,
            encrypted_dek: Some(&wrapped_dek),
            aes_iv: Some(&session.iv),
            hmac: tag.as_ref().map(|t| t.as_slice()),
            content_type: ContentType::Multipart,
            upload_id: Some(upload_id),
            total_parts: Some(session.part_sizes.len() as u32),
        });

        session.state = SessionState::Completed;
        if let Some(dek) = session.dek.take() {
            let mut bytes = *dek.expose_secret();
            bytes.zeroize();
        }
        tracing::info!(upload_id, object_key = %session.object_key, "multipart session completed");
        Ok(metadata)
    }

    /// Idempotent: aborting an already-absent (or already-terminal) upload
    /// is not an error, since callers may race an abort against a finalize
    /// that already removed the session.
    pub fn abort(&self, upload_id: &str) {
        if let Some((_, entry)) = self.sessions.remove(upload_id) {
            let mut session = entry.into_inner().expect("session mutex poisoned");
            session.state = SessionState::Aborted;
            if let Some(dek) = session.dek.take() {
                let mut bytes = *dek.expose_secret();
                bytes.zeroize();
            }
            tracing::info!(upload_id, "multipart session aborted");
        }
    }

    /// Aborts every session whose last activity exceeds the configured idle
    /// timeout. Intended to be driven by a periodic background tick.
    pub fn sweep_idle(&self) {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().lock().expect("session mutex poisoned").created_at.elapsed() > self.idle_timeout)
            .map(|e| e.key().clone())
            .collect();
        for upload_id in stale {
            tracing::warn!(upload_id, "multipart session idle timeout, aborting");
            self.abort(&upload_id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

struct DecryptSession {
    dek: Option<Secret<[u8; 32]>>,
    iv: [u8; crypto::CTR_IV_LEN],
    hmac: Option<HmacAccumulator>,
    expected_hmac: Option<[u8; 32]>,
    next_expected: u32,
    total_plaintext_len: u64,
    created_at: Instant,
    state: SessionState,
}

/// Decrypt-side counterpart of [`MultipartManager`], for streaming a
/// multipart GET back out part by part.
pub struct MultipartDecryptManager {
    sessions: DashMap<String, Mutex<DecryptSession>>,
    idle_timeout: Duration,
}

impl MultipartDecryptManager {
    pub fn new(idle_timeout: Duration) -> Self {
        MultipartDecryptManager {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    pub fn initiate_decrypt(
        &self,
        registry: &ProviderRegistry,
        session_id: &str,
        object_key: &str,
        wrapped_dek: &[u8],
        codec: &MetadataCodec,
        metadata: &MetadataDict,
    ) -> Result<()> {
        if self.sessions.contains_key(session_id) {
            return Err(CoreError::Conflict(session_id.to_string()));
        }
        let parsed = codec.parse(metadata);
        let fingerprint = parsed
            .kek_fingerprint
            .ok_or_else(|| CoreError::Policy("metadata missing kek-fingerprint".into()))?;
        let iv_bytes = parsed.aes_iv.ok_or_else(|| CoreError::Policy("metadata missing aes-iv".into()))?;
        if iv_bytes.len() != crypto::CTR_IV_LEN {
            return Err(CoreError::Policy("aes-iv has wrong length".into()));
        }
        let mut iv = [0u8; crypto::CTR_IV_LEN];
        iv.copy_from_slice(&iv_bytes);

        let dek = registry.unwrap(wrapped_dek, &fingerprint, object_key)?;
        let expected_hmac: Option<[u8; 32]> = match parsed.hmac {
            Some(bytes) if bytes.len() == 32 => {
                let mut t = [0u8; 32];
                t.copy_from_slice(&bytes);
                Some(t)
            }
            Some(_) => return Err(CoreError::Policy("hmac metadata has wrong length".into())),
            None => None,
        };
        let hmac = expected_hmac.map(|_| HmacAccumulator::new(&dek));

        let session = DecryptSession {
            dek: Some(Secret::new(dek)),
            iv,
            hmac,
            expected_hmac,
            next_expected: 1,
            total_plaintext_len: 0,
            created_at: Instant::now(),
            state: SessionState::Open,
        };
        self.sessions.insert(session_id.to_string(), Mutex::new(session));
        Ok(())
    }

    pub fn decrypt_part(&self, session_id: &str, part_number: u32, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let entry = self
            .sessions
            .get(session_id)
            .ok_or_else(|| CoreError::NotFound(session_id.to_string()))?;
        let mut session = entry.lock().expect("session mutex poisoned");
        if session.state != SessionState::Open {
            return Err(CoreError::Conflict(format!("{session_id} is not open")));
        }
        if part_number != session.next_expected {
            return Err(CoreError::OutOfOrder {
                upload_id: session_id.to_string(),
                expected: session.next_expected,
                got: part_number,
            });
        }
        let dek = *session
            .dek
            .as_ref()
            .expect("dek present while session is open")
            .expose_secret();
        let offset = session.total_plaintext_len;

        let mut plaintext = ciphertext.to_vec();
        let mut cipher = CtrCipher::new(&dek, &session.iv)?;
        cipher.seek_to(offset)?;
        cipher.apply(&mut plaintext);

        if let Some(acc) = session.hmac.as_mut() {
            acc.update(&plaintext);
        }
        session.total_plaintext_len += plaintext.len() as u64;
        session.next_expected += 1;
        Ok(plaintext)
    }

    /// Verifies the accumulated HMAC (if one was expected) and marks the
    /// session COMPLETED. This must happen before the caller is told the
    /// multipart GET is done; the plaintext parts already returned
    /// by `decrypt_part` for a tampered object are the caller's problem
    /// exactly as for the single-shot streaming engine's last segment.
    pub fn complete_decrypt(&self, session_id: &str) -> Result<()> {
        let (_, entry) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| CoreError::NotFound(session_id.to_string()))?;
        let mut session = entry.into_inner().expect("session mutex poisoned");
        if session.state != SessionState::Open {
            return Err(CoreError::Conflict(format!("{session_id} already finalized or aborted")));
        }
        if let Some(expected) = session.expected_hmac {
            let actual = session
                .hmac
                .as_mut()
                .expect("hmac accumulator present when expected_hmac is Some")
                .finalize();
            if !HmacAccumulator::verify(&expected, &actual) {
                return Err(CoreError::integrity_anonymous());
            }
        }
        session.state = SessionState::Completed;
        if let Some(dek) = session.dek.take() {
            let mut bytes = *dek.expose_secret();
            bytes.zeroize();
        }
        Ok(())
    }

    pub fn cleanup_decrypt(&self, session_id: &str) {
        if let Some((_, entry)) = self.sessions.remove(session_id) {
            let mut session = entry.into_inner().expect("session mutex poisoned");
            if let Some(dek) = session.dek.take() {
                let mut bytes = *dek.expose_secret();
                bytes.zeroize();
            }
        }
    }

    pub fn sweep_idle(&self) {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().lock().expect("session mutex poisoned").created_at.elapsed() > self.idle_timeout)
            .map(|e| e.key().clone())
            .collect();
        for session_id in stale {
            tracing::warn!(session_id, "multipart decrypt session idle timeout, cleaning up");
            self.cleanup_decrypt(&session_id);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
