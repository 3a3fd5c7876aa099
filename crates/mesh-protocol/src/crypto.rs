use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::messages::Handshake;
use crate::ProtocolError;

/// Generate a new Ed25519 keypair.
pub fn generate_keypair() -> SigningKey {
    let mut rng = rand::thread_rng();
    SigningKey::generate(&mut rng)
}

/// Short stable fingerprint of a public key: hex of the first 8 bytes of its SHA-256.
pub fn key_fingerprint(verifying_key: &VerifyingKey) -> String {
    hex::encode(&sha256(verifying_key.as_bytes())[..8])
}

/// Sign a payload with the signing key.
pub fn sign_message(signing_key: &SigningKey, payload: &[u8]) -> Signature {
    signing_key.sign(payload)
}

/// Verify a signature against the verifying key.
pub fn verify_signature(
    verifying_key: &VerifyingKey,
    payload: &[u8],
    signature: &Signature,
) -> Result<(), ProtocolError> {
    verifying_key
        .verify(payload, signature)
        .map_err(|e| ProtocolError::InvalidSignature(e.to_string()))
}

/// Compute SHA-256 hash of data.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Seconds since the Unix epoch.
pub fn current_timestamp_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Attach the public key and a signature over the handshake signing payload.
pub fn sign_handshake(signing_key: &SigningKey, handshake: &mut Handshake) {
    handshake.public_key = Some(hex::encode(signing_key.verifying_key().as_bytes()));
    let sig = sign_message(signing_key, &handshake.signing_payload());
    handshake.signature = Some(hex::encode(sig.to_bytes()));
}

/// Verify a signed handshake. Returns the sender's verifying key.
///
/// Replay protection is the caller's job; see [`crate::ReplayWindow`].
pub fn verify_handshake(handshake: &Handshake) -> Result<VerifyingKey, ProtocolError> {
    let pk_hex = handshake
        .public_key
        .as_deref()
        .ok_or_else(|| ProtocolError::InvalidSignature("handshake carries no public key".into()))?;
    let sig_hex = handshake
        .signature
        .as_deref()
        .ok_or_else(|| ProtocolError::InvalidSignature("handshake carries no signature".into()))?;

    let pk_bytes: [u8; 32] = decode_fixed(pk_hex, "public key")?;
    let sig_bytes: [u8; 64] = decode_fixed(sig_hex, "signature")?;

    let verifying_key = VerifyingKey::from_bytes(&pk_bytes)
        .map_err(|e| ProtocolError::Crypto(format!("invalid public key: {e}")))?;
    let signature = Signature::from_bytes(&sig_bytes);
    verify_signature(&verifying_key, &handshake.signing_payload(), &signature)?;
    Ok(verifying_key)
}

fn decode_fixed<const N: usize>(s: &str, what: &str) -> Result<[u8; N], ProtocolError> {
    let bytes = hex::decode(s).map_err(|e| ProtocolError::Crypto(format!("invalid {what} hex: {e}")))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| ProtocolError::Crypto(format!("{what} is {len} bytes, expected {N}")))
}

/// Load an Ed25519 keypair from a file, or create a new one if the file doesn't exist.
/// The file stores the raw 32-byte Ed25519 seed with mode 0600.
pub fn load_or_create_keypair(path: &Path) -> Result<SigningKey, ProtocolError> {
    if path.exists() {
        let seed_bytes = std::fs::read(path)
            .map_err(|e| ProtocolError::Crypto(format!("read key file: {e}")))?;
        let len = seed_bytes.len();
        let seed: [u8; 32] = seed_bytes
            .try_into()
            .map_err(|_| ProtocolError::Crypto(format!("key file is {len} bytes, expected 32")))?;
        Ok(SigningKey::from_bytes(&seed))
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ProtocolError::Crypto(format!("create dir: {e}")))?;
        }
        let key = generate_keypair();
        std::fs::write(path, key.to_bytes())
            .map_err(|e| ProtocolError::Crypto(format!("write key file: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| ProtocolError::Crypto(format!("set permissions: {e}")))?;
        }
        Ok(key)
    }
}
