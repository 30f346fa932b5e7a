//! Envelope-encryption core for a transparent S3-compatible encrypting
//! gateway.
//!
//! Owns the key hierarchy (Provider Registry), the streaming/single-part
//! data-plane algorithms (AES-256-GCM and AES-256-CTR with streaming
//! HMAC-SHA256), the per-upload multipart session state, and the metadata
//! contract binding ciphertext to the keys that decrypt it. The HTTP/S3
//! protocol layer, request routing, bucket/ACL policy, and the upstream
//! object-store client are deliberately outside this crate; see
//! [`Orchestrator`] for the interface those layers consume.

pub mod config;
pub mod crypto;
pub mod error;
pub mod hmac_policy;
pub mod metadata;
pub mod multipart;
pub mod orchestrator;
pub mod provider;
pub mod single_part;
pub mod streaming;

pub use config::{CoreConfig, HmacPolicyMode, IntegrityPolicy, ProviderConfig, ProviderKind};
pub use error::{CoreError, ErrorKind, Result};
pub use metadata::MetadataDict;
pub use multipart::PartResult;
pub use orchestrator::{ContentTypeHint, Orchestrator, StreamMetadataHandle};
pub use streaming::{CancellationToken, DecryptingReader, EncryptingReader};
