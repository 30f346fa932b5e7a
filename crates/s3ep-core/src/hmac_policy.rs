//! HMAC policy decision and the streaming accumulator.
//!
//! The accumulator's key derivation follows `derivation.rs`'s
//! `hkdf_expand_keys` shape: HKDF-expand a sub-key from the content key with
//! a fixed domain-separation info string, retargeted from HKDF-SHA3-384 to
//! HKDF-SHA256, and from "second AEAD key" to "HMAC key".

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::HmacPolicyMode;
use crate::error::{CoreError, Result};

const HMAC_KEY_INFO: &[u8] = b"s3ep/hmac-key/v1";

type HmacSha256 = Hmac<Sha256>;

/// Whether the algorithm in use already authenticates the ciphertext on its
/// own (GCM does; CTR does not).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmAuthenticates {
    Yes,
    No,
}

/// Decide whether HMAC should be attached for this combination of policy and
/// algorithm.
pub fn should_attach_hmac(policy: HmacPolicyMode, algo_authenticates: AlgorithmAuthenticates) -> bool {
    match policy {
        HmacPolicyMode::Always => true,
        HmacPolicyMode::Never => false,
        HmacPolicyMode::Auto => matches!(algo_authenticates, AlgorithmAuthenticates::No),
    }
}

/// Derive the HMAC key from a DEK. The key is bound to the DEK (same input)
/// but distinct from it (different HKDF info string than any other
/// sub-key derived from the same DEK).
fn derive_hmac_key(dek: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, dek);
    let mut out = [0u8; 32];
    hk.expand(HMAC_KEY_INFO, &mut out)
        .expect("32 is a valid HKDF-SHA256 output length");
    out
}

/// Streaming HMAC-SHA256 accumulator over plaintext, with the sequential
/// part-ordering enforcement multipart sessions need.
pub struct HmacAccumulator {
    mac: Option<HmacSha256>,
    next_expected: u32,
}

impl HmacAccumulator {
    pub fn new(dek: &[u8; 32]) -> Self {
        let key = derive_hmac_key(dek);
        let mac = HmacSha256::new_from_slice(&key).expect("HMAC-SHA256 accepts any key length");
        HmacAccumulator {
            mac: Some(mac),
            next_expected: 1,
        }
    }

    /// Append `bytes` to the rolling MAC with no ordering check. Used by the
    /// single-part and streaming engines, which have no part numbers to
    /// enforce.
    pub fn update(&mut self, bytes: &[u8]) {
        if let Some(mac) = self.mac.as_mut() {
            mac.update(bytes);
        }
    }

    /// Append `bytes`, but only if `part_number == next_expected`. Used by
    /// the multipart session manager; advances the expected counter on
    /// success.
    pub fn update_sequential(&mut self, bytes: &[u8], part_number: u32) -> Result<()> {
        if part_number != self.next_expected {
            return Err(CoreError::OutOfOrder {
                upload_id: String::new(),
                expected: self.next_expected,
                got: part_number,
            });
        }
        self.update(bytes);
        self.next_expected += 1;
        Ok(())
    }

    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    /// Emit the tag and invalidate the accumulator. Further calls to
    /// `update`/`update_sequential` become no-ops rather than panicking,
    /// since a terminal-state session may still receive a stray call racing
    /// the transition.
    pub fn finalize(&mut self) -> [u8; 32] {
        match self.mac.take() {
            Some(mac) => mac.finalize().into_bytes().into(),
            None => [0u8; 32],
        }
    }

    /// Constant-time tag comparison.
    pub fn verify(expected: &[u8], actual: &[u8]) -> bool {
        expected.len() == actual.len() && expected.ct_eq(actual).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_auto_omits_hmac_for_gcm_includes_for_ctr() {
        assert!(!should_attach_hmac(HmacPolicyMode::Auto, AlgorithmAuthenticates::Yes));
        assert!(should_attach_hmac(HmacPolicyMode::Auto, AlgorithmAuthenticates::No));
    }

    #[test]
    fn policy_always_and_never_ignore_algorithm() {
        assert!(should_attach_hmac(HmacPolicyMode::Always, AlgorithmAuthenticates::Yes));
        assert!(should_attach_hmac(HmacPolicyMode::Always, AlgorithmAuthenticates::No));
        assert!(!should_attach_hmac(HmacPolicyMode::Never, AlgorithmAuthenticates::Yes));
        assert!(!should_attach_hmac(HmacPolicyMode::Never, AlgorithmAuthenticates::No));
    }

    #[test]
    fn sequential_enforcement_rejects_out_of_order() {
        let dek = [1u8; 32];
        let mut acc = HmacAccumulator::new(&dek);
        acc.update_sequential(b"part1", 1).unwrap();
        let err = acc.update_sequential(b"part3", 3).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::OutOfOrder);
        // state unchanged: next_expected is still 2
        assert_eq!(acc.next_expected(), 2);
        acc.update_sequential(b"part2", 2).unwrap();
        assert_eq!(acc.next_expected(), 3);
    }

    #[test]
    fn same_bytes_same_dek_same_tag() {
        let dek = [9u8; 32];
        let mut a = HmacAccumulator::new(&dek);
        let mut b = HmacAccumulator::new(&dek);
        a.update(b"hello world");
        b.update(b"hello world");
        assert_eq!(a.finalize(), b.finalize());
    }

    #[test]
    fn different_dek_different_tag() {
        let mut a = HmacAccumulator::new(&[1u8; 32]);
        let mut b = HmacAccumulator::new(&[2u8; 32]);
        a.update(b"same plaintext");
        b.update(b"same plaintext");
        assert_ne!(a.finalize(), b.finalize());
    }

    #[test]
    fn verify_is_bitwise_exact() {
        let dek = [4u8; 32];
        let mut a = HmacAccumulator::new(&dek);
        a.update(b"payload");
        let mut tag = a.finalize();
        assert!(HmacAccumulator::verify(&tag, &tag));
        tag[0] ^= 1;
        assert!(!HmacAccumulator::verify(&tag, &{
            let mut b = HmacAccumulator::new(&dek);
            b.update(b"payload");
            b.finalize()
        }));
    }
}
