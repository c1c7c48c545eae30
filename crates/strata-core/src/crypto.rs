//! Digest computation and detached RSA-PSS signatures
//!
//! The signed message is always the raw 64-byte SHA-512 digest of the
//! protected object; the PSS encoding hashes it once more with SHA-512
//! and uses MGF1-SHA-512 with the largest salt the key allows.

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::pss;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest as _, Sha512};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::debug;

use crate::types::{Digest, DIGEST_LEN};
use crate::{Error, Result};

/// Read buffer size for streaming digests
pub const READ_CHUNK: usize = 8192;

/// SHA-512 of an in-memory buffer
pub fn digest_bytes(data: &[u8]) -> Digest {
    let out = Sha512::digest(data);
    let mut bytes = [0u8; DIGEST_LEN];
    bytes.copy_from_slice(&out);
    Digest::new(bytes)
}

/// SHA-512 of a stream, read in fixed-size chunks
pub fn digest_reader<R: Read>(mut reader: R) -> Result<Digest> {
    let mut hasher = Sha512::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let mut bytes = [0u8; DIGEST_LEN];
    bytes.copy_from_slice(&hasher.finalize());
    Ok(Digest::new(bytes))
}

/// SHA-512 of a file on disk
pub fn digest_file(path: &Path) -> Result<Digest> {
    let file = File::open(path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))
    })?;
    let digest = digest_reader(BufReader::new(file))?;
    debug!("Digest of {:?}: {}", path, digest.short());
    Ok(digest)
}

/// Detached signature bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedSignature(pub Vec<u8>);

impl DetachedSignature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn digest(&self) -> Digest {
        digest_bytes(&self.0)
    }
}

/// RSA private key used for detached signatures
pub struct SigningKey {
    key: RsaPrivateKey,
}

impl SigningKey {
    pub fn from_rsa(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    /// Parse a PEM private key: encrypted PKCS#8 when a password is
    /// given, otherwise PKCS#8 or PKCS#1
    pub fn from_pem(pem: &str, password: Option<&str>) -> Result<Self> {
        let key = match password {
            Some(password) => RsaPrivateKey::from_pkcs8_encrypted_pem(pem, password.as_bytes())
                .map_err(|e| Error::Crypto(format!("cannot decrypt private key: {}", e)))?,
            None => RsaPrivateKey::from_pkcs8_pem(pem)
                .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
                .map_err(|e| Error::Crypto(format!("cannot parse private key: {}", e)))?,
        };
        Ok(Self { key })
    }

    pub fn load(path: &Path, password: Option<&str>) -> Result<Self> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pem(&pem, password)
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }

    /// Sign a digest with RSA-PSS
    pub fn sign(&self, digest: &Digest) -> Result<DetachedSignature> {
        let salt_len = max_pss_salt_len(&self.key.to_public_key());
        let signer = pss::SigningKey::<Sha512>::new_with_salt_len(self.key.clone(), salt_len);
        let signature = signer
            .try_sign_with_rng(&mut rand::thread_rng(), digest.as_bytes())
            .map_err(|e| Error::Crypto(format!("signing failed: {}", e)))?;
        Ok(DetachedSignature(signature.to_vec()))
    }
}

/// Largest PSS salt for a key when hashing with SHA-512
pub fn max_pss_salt_len(key: &RsaPublicKey) -> usize {
    let em_bits = key.n().bits().saturating_sub(1);
    let em_len = em_bits.div_ceil(8);
    em_len.saturating_sub(DIGEST_LEN + 2)
}

/// Verify a detached RSA-PSS signature over a digest
pub fn verify_signature(digest: &Digest, signature: &[u8], public_key: &RsaPublicKey) -> Result<()> {
    let salt_len = max_pss_salt_len(public_key);
    let verifier = pss::VerifyingKey::<Sha512>::new_with_salt_len(public_key.clone(), salt_len);
    let signature = pss::Signature::try_from(signature)
        .map_err(|e| Error::InvalidSignature(format!("malformed signature: {}", e)))?;
    verifier
        .verify(digest.as_bytes(), &signature)
        .map_err(|_| Error::InvalidSignature("signature does not match digest".into()))
}

/// Extract an RSA public key from DER-encoded SubjectPublicKeyInfo
pub fn rsa_public_key_from_spki_der(der: &[u8]) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_der(der)
        .map_err(|e| Error::Crypto(format!("certificate key is not RSA: {}", e)))
}
