//! Strata Core - Digests, signatures, timestamps and the onion package codec
//!
//! This crate holds the primitives shared by the archiver, the
//! retimestamper and the validator: SHA-512 digests, RSA-PSS detached
//! signatures, RFC 3161 timestamp tokens, CRL checks, the nested tar
//! container format and the typed evidence records.

pub mod certificate;
pub mod crypto;
pub mod error;
pub mod package;
pub mod records;
pub mod timestamp;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use certificate::{
    certificate_public_key, certificate_to_pem, load_certificate, parse_certificate, parse_crl,
    validate_certificate, validate_certificate_file, CrlSource, HttpCrlSource,
};
pub use crypto::{
    digest_bytes, digest_file, digest_reader, verify_signature, DetachedSignature, SigningKey,
};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use package::{
    build_container, container_digest, extract, find_member, require_member, seal, ContainerLayer,
};
pub use records::{ArchivedFile, FileId, FilePackage, NewArchivedFile, NewFilePackage, PackageId};
pub use timestamp::{verify_timestamp, Rfc3161Authority, TimestampAuthority, TimestampToken};
pub use types::{Digest, DIGEST_LEN};
pub use x509_cert::Certificate;

/// Default validity period of a timestamp layer, in years
pub const DEFAULT_VALIDITY_YEARS: u32 = 5;
