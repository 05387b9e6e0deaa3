//! Plugin trust verification.
//!
//! Two gates run before any plugin code is loaded: the configured public
//! key file must hash to the pinned SHA-256, and each plugin binary must
//! carry a valid Ed25519 signature over its SHA-256 digest.

use std::fs;
use std::path::Path;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("public key integrity check failed")]
    PublicKeyHashMismatch,

    #[error("public key is not a valid Ed25519 key")]
    InvalidPublicKey,

    #[error("signature file is not valid hex: {0}")]
    MalformedSignature(String),

    #[error("plugin signature verification failed")]
    SignatureMismatch,
}

/// Check that the public key file still hashes to the pinned digest and
/// parse it. A mismatch means the key file was altered: fatal.
pub fn load_trusted_public_key(path: &Path, expected_hash: &str) -> Result<VerifyingKey, TrustError> {
    let data = fs::read(path).map_err(|source| TrustError::Read {
        path: path.display().to_string(),
        source,
    })?;

    let digest = hex::encode(Sha256::digest(&data));
    if !digest.eq_ignore_ascii_case(expected_hash.trim()) {
        return Err(TrustError::PublicKeyHashMismatch);
    }

    let bytes: [u8; 32] = data
        .as_slice()
        .try_into()
        .map_err(|_| TrustError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| TrustError::InvalidPublicKey)
}

/// Verify `<plugin>.sig` (hex Ed25519 signature over SHA-256 of the
/// binary) against the trusted key.
pub fn verify_plugin_signature(plugin_path: &Path, key: &VerifyingKey) -> Result<(), TrustError> {
    let binary = fs::read(plugin_path).map_err(|source| TrustError::Read {
        path: plugin_path.display().to_string(),
        source,
    })?;
    let digest = Sha256::digest(&binary);

    let sig_path = plugin_path.with_extension(
        plugin_path
            .extension()
            .map(|e| format!("{}.sig", e.to_string_lossy()))
            .unwrap_or_else(|| "sig".to_string()),
    );
    let sig_hex = fs::read_to_string(&sig_path).map_err(|source| TrustError::Read {
        path: sig_path.display().to_string(),
        source,
    })?;

    let sig_bytes = hex::decode(sig_hex.trim())
        .map_err(|e| TrustError::MalformedSignature(e.to_string()))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| TrustError::MalformedSignature(e.to_string()))?;

    key.verify(&digest, &signature)
        .map_err(|_| TrustError::SignatureMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn write_key_pair(dir: &Path) -> (SigningKey, std::path::PathBuf, String) {
        let signing = SigningKey::generate(&mut OsRng);
        let public_path = dir.join("key.pub");
        let public_bytes = signing.verifying_key().to_bytes();
        fs::write(&public_path, public_bytes).unwrap();
        let hash = hex::encode(Sha256::digest(public_bytes));
        (signing, public_path, hash)
    }

    fn write_signed_plugin(dir: &Path, signing: &SigningKey, contents: &[u8]) -> std::path::PathBuf {
        let bin_path = dir.join("demo.bin");
        fs::write(&bin_path, contents).unwrap();
        let signature = signing.sign(&Sha256::digest(contents));
        fs::write(
            dir.join("demo.bin.sig"),
            hex::encode(signature.to_bytes()),
        )
        .unwrap();
        bin_path
    }

    #[test]
    fn trusted_key_loads_when_hash_matches() {
        let dir = tempfile::tempdir().unwrap();
        let (_, public_path, hash) = write_key_pair(dir.path());
        assert!(load_trusted_public_key(&public_path, &hash).is_ok());
        // Hex comparison is case-insensitive.
        assert!(load_trusted_public_key(&public_path, &hash.to_uppercase()).is_ok());
    }

    #[test]
    fn altered_key_fails_integrity_check() {
        let dir = tempfile::tempdir().unwrap();
        let (_, public_path, hash) = write_key_pair(dir.path());
        let mut data = fs::read(&public_path).unwrap();
        data[0] ^= 0xff;
        fs::write(&public_path, data).unwrap();

        assert!(matches!(
            load_trusted_public_key(&public_path, &hash),
            Err(TrustError::PublicKeyHashMismatch)
        ));
    }

    #[test]
    fn valid_signature_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let (signing, public_path, hash) = write_key_pair(dir.path());
        let bin = write_signed_plugin(dir.path(), &signing, b"plugin machine code");

        let key = load_trusted_public_key(&public_path, &hash).unwrap();
        assert!(verify_plugin_signature(&bin, &key).is_ok());
    }

    #[test]
    fn tampered_binary_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let (signing, public_path, hash) = write_key_pair(dir.path());
        let bin = write_signed_plugin(dir.path(), &signing, b"plugin machine code");
        fs::write(&bin, b"plugin machine code, patched").unwrap();

        let key = load_trusted_public_key(&public_path, &hash).unwrap();
        assert!(matches!(
            verify_plugin_signature(&bin, &key),
            Err(TrustError::SignatureMismatch)
        ));
    }

    #[test]
    fn foreign_signature_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let (_, public_path, hash) = write_key_pair(dir.path());
        let other = SigningKey::generate(&mut OsRng);
        let bin = write_signed_plugin(dir.path(), &other, b"plugin machine code");

        let key = load_trusted_public_key(&public_path, &hash).unwrap();
        assert!(verify_plugin_signature(&bin, &key).is_err());
    }

    #[test]
    fn missing_signature_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (signing, public_path, hash) = write_key_pair(dir.path());
        let bin = write_signed_plugin(dir.path(), &signing, b"bytes");
        fs::remove_file(dir.path().join("demo.bin.sig")).unwrap();

        let key = load_trusted_public_key(&public_path, &hash).unwrap();
        assert!(matches!(
            verify_plugin_signature(&bin, &key),
            Err(TrustError::Read { .. })
        ));
    }
}
