//! Device identity for the gateway auth handshake.
//!
//! Each deployment holds one secp256k1 keypair, generated on first run
//! and persisted under the state dir. The private key signs the
//! server-issued challenge; the public key identifies the device.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use k256::ecdsa::signature::Signer;
use k256::ecdsa::{Signature, SigningKey};
use log::info;
use rand::Rng;

/// The device keypair used to authenticate the upstream connection.
#[derive(Clone)]
pub struct DeviceIdentity {
    key: SigningKey,
}

impl DeviceIdentity {
    /// Load the keypair from `path`, generating and persisting a fresh
    /// one if the file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("reading device key {}", path.display()))?;
            let bytes = hex::decode(contents.trim())
                .with_context(|| format!("decoding device key {}", path.display()))?;
            let key = SigningKey::from_slice(&bytes)
                .with_context(|| format!("parsing device key {}", path.display()))?;
            return Ok(Self { key });
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating key directory {}", parent.display()))?;
        }
        fs::write(path, hex::encode(key.key.to_bytes()))
            .with_context(|| format!("writing device key {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("restricting device key {}", path.display()))?;
        }
        info!("generated new device identity at {}", path.display());
        Ok(key)
    }

    /// Generate a fresh keypair without persisting it.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        loop {
            let mut bytes = [0u8; 32];
            rng.fill(&mut bytes[..]);
            // Rejection-sampled: from_slice fails for the few scalars
            // outside the curve order.
            if let Ok(key) = SigningKey::from_slice(&bytes) {
                return Self { key };
            }
        }
    }

    /// Compressed SEC1 public key, base64-encoded.
    pub fn public_key_b64(&self) -> String {
        let point = self.key.verifying_key().to_encoded_point(true);
        BASE64.encode(point.as_bytes())
    }

    /// Sign a challenge nonce; the gateway verifies it against our
    /// registered public key.
    pub fn sign_challenge(&self, nonce: &str) -> String {
        let signature: Signature = self.key.sign(nonce.as_bytes());
        BASE64.encode(signature.to_bytes())
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("public_key", &self.public_key_b64())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::VerifyingKey;
    use k256::ecdsa::signature::Verifier;

    #[test]
    fn test_signature_verifies_against_public_key() {
        let identity = DeviceIdentity::generate();

        let signature_bytes = BASE64.decode(identity.sign_challenge("nonce-123")).unwrap();
        let signature = Signature::from_slice(&signature_bytes).unwrap();

        let point_bytes = BASE64.decode(identity.public_key_b64()).unwrap();
        let verifying_key = VerifyingKey::from_sec1_bytes(&point_bytes).unwrap();

        verifying_key.verify(b"nonce-123", &signature).unwrap();
        assert!(verifying_key.verify(b"other-nonce", &signature).is_err());
    }

    #[test]
    fn test_identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.key");

        let first = DeviceIdentity::load_or_generate(&path).unwrap();
        let second = DeviceIdentity::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key_b64(), second.public_key_b64());
    }
}
