use aws_lc_rs::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305, NONCE_LEN};
use aws_lc_rs::rand;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};
use crate::model::Certificate;

const ENCRYPTION_SECRETBOX: &str = "secretbox.v1";

/// Nonce + ciphertext pair produced by sealing, base64 on the wire.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SealedBytes {
    #[serde(rename = "Nonce")]
    pub nonce: String,
    #[serde(rename = "Val")]
    pub val: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct SealedValue {
    #[serde(rename = "Encryption")]
    encryption: String,
    #[serde(rename = "Value")]
    value: SealedBytes,
}

pub fn sealed_value_to_json(b: &SealedBytes) -> Result<String> {
    let v = SealedValue {
        encryption: ENCRYPTION_SECRETBOX.to_string(),
        value: b.clone(),
    };
    Ok(serde_json::to_string(&v)?)
}

/// Only `secretbox.v1` is recognized; any other tag is a hard error.
pub fn sealed_value_from_json(raw: &[u8]) -> Result<SealedBytes> {
    let v: SealedValue = serde_json::from_slice(raw)?;
    if v.encryption != ENCRYPTION_SECRETBOX {
        return Err(ProxyError::Config(format!(
            "unsupported encryption type: '{}'",
            v.encryption
        )));
    }
    Ok(v.value)
}

/// Symmetric key for sealing TLS material at rest.
pub struct SealKey {
    key: [u8; 32],
}

impl SealKey {
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| ProxyError::Config(format!("bad seal key: {e}")))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProxyError::Config("seal key must be 32 bytes".into()))?;
        Ok(Self { key })
    }

    pub fn generate() -> Result<Self> {
        let mut key = [0u8; 32];
        rand::fill(&mut key).map_err(|_| ProxyError::Internal("rng failure".into()))?;
        Ok(Self { key })
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }

    fn aead(&self) -> Result<LessSafeKey> {
        let unbound = UnboundKey::new(&CHACHA20_POLY1305, &self.key)
            .map_err(|_| ProxyError::Internal("failed to build sealing key".into()))?;
        Ok(LessSafeKey::new(unbound))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedBytes> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::fill(&mut nonce_bytes).map_err(|_| ProxyError::Internal("rng failure".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut buf = plaintext.to_vec();
        self.aead()?
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut buf)
            .map_err(|_| ProxyError::Internal("seal failure".into()))?;

        Ok(SealedBytes {
            nonce: BASE64.encode(nonce_bytes),
            val: BASE64.encode(&buf),
        })
    }

    pub fn open(&self, sealed: &SealedBytes) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; NONCE_LEN] = BASE64
            .decode(&sealed.nonce)
            .map_err(|e| ProxyError::Config(format!("bad sealed nonce: {e}")))?
            .try_into()
            .map_err(|_| ProxyError::Config("bad sealed nonce length".into()))?;
        let mut buf = BASE64
            .decode(&sealed.val)
            .map_err(|e| ProxyError::Config(format!("bad sealed value: {e}")))?;

        let plain = self
            .aead()?
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut buf,
            )
            .map_err(|_| ProxyError::Config("failed to open sealed value".into()))?;
        Ok(plain.to_vec())
    }
}

pub fn seal_cert_to_json(key: &SealKey, cert: &Certificate) -> Result<String> {
    let plain = serde_json::to_vec(cert)?;
    let sealed = key.seal(&plain)?;
    sealed_value_to_json(&sealed)
}

pub fn open_cert_from_json(key: &SealKey, raw: &[u8]) -> Result<Certificate> {
    let sealed = sealed_value_from_json(raw)?;
    let plain = key.open(&sealed)?;
    Ok(serde_json::from_slice(&plain)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = SealKey::generate().unwrap();
        let cert = Certificate::new("cert-pem", "key-pem");
        let json = seal_cert_to_json(&key, &cert).unwrap();
        let opened = open_cert_from_json(&key, json.as_bytes()).unwrap();
        assert_eq!(opened, cert);
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let key = SealKey::generate().unwrap();
        let other = SealKey::generate().unwrap();
        let json = seal_cert_to_json(&key, &Certificate::new("c", "k")).unwrap();
        assert!(open_cert_from_json(&other, json.as_bytes()).is_err());
    }

    #[test]
    fn unknown_encryption_tag_is_rejected() {
        let raw = r#"{"Encryption":"rot13.v2","Value":{"Nonce":"","Val":""}}"#;
        let err = sealed_value_from_json(raw.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unsupported encryption type"));
    }

    #[test]
    fn key_base64_roundtrip() {
        let key = SealKey::generate().unwrap();
        let restored = SealKey::from_base64(&key.to_base64()).unwrap();
        let sealed = key.seal(b"hello").unwrap();
        assert_eq!(restored.open(&sealed).unwrap(), b"hello");
    }
}
