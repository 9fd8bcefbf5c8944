use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

pub fn verify_ed25519_signature_hex(
    payload: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool> {
    let verifying_key = decode_public_key(public_key_hex)?;
    let signature = decode_signature(signature_hex)?;
    Ok(verifying_key.verify(payload, &signature).is_ok())
}

pub fn check_signature(
    payload: &[u8],
    signature: Option<(&str, &str)>,
    trusted_keys: &[String],
) -> Result<()> {
    let Some((public_key_hex, signature_hex)) = signature else {
        if trusted_keys.is_empty() {
            return Ok(());
        }
        return Err(anyhow!("payload is unsigned but trusted keys are configured"));
    };

    if !trusted_keys.is_empty()
        && !trusted_keys
            .iter()
            .any(|key| key.trim().eq_ignore_ascii_case(public_key_hex.trim()))
    {
        return Err(anyhow!("payload is signed by an untrusted key {public_key_hex}"));
    }

    if !verify_ed25519_signature_hex(payload, public_key_hex.trim(), signature_hex.trim())? {
        return Err(anyhow!("Ed25519 signature does not verify"));
    }
    Ok(())
}

fn decode_public_key(public_key_hex: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(public_key_hex).context("failed to decode Ed25519 public key hex")?;
    let len = bytes.len();
    let array: [u8; 32] = bytes.try_into().map_err(|_| {
        anyhow!("invalid Ed25519 public key length: expected 32 bytes, got {len}")
    })?;
    VerifyingKey::from_bytes(&array).context("invalid Ed25519 public key bytes")
}

fn decode_signature(signature_hex: &str) -> Result<Signature> {
    let bytes = hex::decode(signature_hex).context("failed to decode Ed25519 signature hex")?;
    let len = bytes.len();
    let array: [u8; 64] = bytes.try_into().map_err(|_| {
        anyhow!("invalid Ed25519 signature length: expected 64 bytes, got {len}")
    })?;
    Ok(Signature::from_bytes(&array))
}
