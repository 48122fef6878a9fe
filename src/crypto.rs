use std::fs;
use std::path::Path;

use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::errors::{OperatorError, OperatorResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> OperatorResult<Keypair> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &Keypair) -> OperatorResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.public.to_bytes()),
        secret_key: hex::encode(keypair.secret.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| OperatorError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> OperatorResult<Keypair> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| OperatorError::Config(format!("failed to decode keypair: {err}")))?;
    keypair_from_hex(&stored.secret_key, &stored.public_key)
}

pub fn keypair_from_hex(secret_hex: &str, public_hex: &str) -> OperatorResult<Keypair> {
    let secret_bytes = hex::decode(secret_hex)
        .map_err(|err| OperatorError::Crypto(format!("invalid secret key encoding: {err}")))?;
    let public_bytes = hex::decode(public_hex)
        .map_err(|err| OperatorError::Crypto(format!("invalid public key encoding: {err}")))?;
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|err| OperatorError::Crypto(format!("invalid secret key bytes: {err}")))?;
    let public = PublicKey::from_bytes(&public_bytes)
        .map_err(|err| OperatorError::Crypto(format!("invalid public key bytes: {err}")))?;
    Ok(Keypair { secret, public })
}

pub fn sign_message(keypair: &Keypair, message: &[u8]) -> Signature {
    keypair.sign(message)
}

pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> OperatorResult<()> {
    public_key
        .verify(message, signature)
        .map_err(|err| OperatorError::Crypto(format!("signature verification failed: {err}")))
}

pub fn public_key_from_hex(data: &str) -> OperatorResult<PublicKey> {
    let bytes = hex::decode(data)
        .map_err(|err| OperatorError::Crypto(format!("invalid public key encoding: {err}")))?;
    PublicKey::from_bytes(&bytes)
        .map_err(|err| OperatorError::Crypto(format!("invalid public key bytes: {err}")))
}

pub fn public_key_to_hex(public_key: &PublicKey) -> String {
    hex::encode(public_key.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_roundtrips_through_hex() {
        let keypair = generate_keypair();
        let secret_hex = hex::encode(keypair.secret.to_bytes());
        let public_hex = public_key_to_hex(&keypair.public);
        let restored = keypair_from_hex(&secret_hex, &public_hex).expect("roundtrip");
        assert_eq!(restored.public, keypair.public);
    }

    #[test]
    fn signatures_verify_against_the_signing_key() {
        let keypair = generate_keypair();
        let signature = sign_message(&keypair, b"ballot");
        verify_signature(&keypair.public, b"ballot", &signature).expect("valid signature");
        assert!(verify_signature(&keypair.public, b"tampered", &signature).is_err());
    }

    #[test]
    fn load_or_generate_persists_new_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("keys/coordinator.toml");
        let first = load_or_generate_keypair(&path).expect("generate");
        let second = load_or_generate_keypair(&path).expect("load");
        assert_eq!(first.public, second.public);
    }
}
