//! Conversion between JSON-serializable values and the on-disk [`EncryptedEnvelope`].

use base64::{engine::general_purpose::STANDARD, Engine as _};
use lockbox_core::StoreError;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::crypto::{CryptoProvider, DerivedKey, ALGORITHM, IV_LEN, SALT_LEN, TAG_LEN};

/// Fields every envelope carries; an object missing one is plain data.
const ENVELOPE_MARKERS: [&str; 3] = ["ciphertext", "iv", "algorithm"];
/// Every field an envelope may carry; an object with any other field is plain data.
const ENVELOPE_FIELDS: [&str; 6] = ["ciphertext", "iv", "salt", "algorithm", "kdfIterations", "epoch"];

/// One encrypted value as persisted. Immutable once written; re-encryption
/// produces a new envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    /// Ciphertext with the authentication tag appended.
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub salt: Vec<u8>,
    pub algorithm: String,
    pub kdf_iterations: u32,
    /// Password rotation epoch the envelope was written under.
    pub epoch: u32,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeWire {
    ciphertext: String,
    iv: String,
    salt: String,
    algorithm: String,
    kdf_iterations: u32,
    #[serde(default)]
    epoch: u32,
}

impl EncryptedEnvelope {
    /// Serialize to the JSON form stored in the backend.
    pub fn to_json(&self) -> Result<String, StoreError> {
        let wire = EnvelopeWire {
            ciphertext: STANDARD.encode(&self.ciphertext),
            iv: STANDARD.encode(&self.iv),
            salt: STANDARD.encode(&self.salt),
            algorithm: self.algorithm.clone(),
            kdf_iterations: self.kdf_iterations,
            epoch: self.epoch,
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Classify a raw stored string.
    ///
    /// Returns `Ok(None)` for anything that is not shaped like an envelope (legacy
    /// plaintext or a user object that merely shares some field names), and `MalformedEnvelope` for envelope-shaped data that fails
    /// structural checks.
    pub fn parse(raw: &str) -> Result<Option<Self>, StoreError> {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => return Ok(None),
        };
        let looks_encrypted = value.as_object().is_some_and(|obj| {
            ENVELOPE_MARKERS.iter().all(|field| obj.contains_key(*field))
                && obj.keys().all(|field| ENVELOPE_FIELDS.contains(&field.as_str()))
        });
        if !looks_encrypted {
            return Ok(None);
        }

        let wire: EnvelopeWire = serde_json::from_value(value).map_err(malformed)?;
        let envelope = Self {
            ciphertext: decode_field("ciphertext", &wire.ciphertext)?,
            iv: decode_field("iv", &wire.iv)?,
            salt: decode_field("salt", &wire.salt)?,
            algorithm: wire.algorithm,
            kdf_iterations: wire.kdf_iterations,
            epoch: wire.epoch,
        };
        envelope.validate()?;
        Ok(Some(envelope))
    }

    fn validate(&self) -> Result<(), StoreError> {
        if self.algorithm != ALGORITHM {
            return Err(malformed(format!(
                "unsupported algorithm {:?}",
                self.algorithm
            )));
        }
        if self.iv.len() != IV_LEN {
            return Err(malformed(format!(
                "iv is {} bytes, expected {IV_LEN}",
                self.iv.len()
            )));
        }
        if self.salt.len() != SALT_LEN {
            return Err(malformed(format!(
                "salt is {} bytes, expected {SALT_LEN}",
                self.salt.len()
            )));
        }
        if self.ciphertext.len() < TAG_LEN {
            return Err(malformed("ciphertext shorter than authentication tag"));
        }
        if self.kdf_iterations == 0 {
            return Err(malformed("kdf iterations must be positive"));
        }
        Ok(())
    }
}

/// Serialize `value` to JSON and seal it under `key`.
pub async fn encode<C, T>(
    provider: &C,
    value: &T,
    key: &DerivedKey,
) -> Result<EncryptedEnvelope, StoreError>
where
    C: CryptoProvider + ?Sized,
    T: Serialize + ?Sized,
{
    let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(value)?);
    let (ciphertext, iv) = provider.encrypt(&plaintext, key).await?;
    Ok(EncryptedEnvelope {
        ciphertext,
        iv,
        salt: key.salt().to_vec(),
        algorithm: ALGORITHM.to_string(),
        kdf_iterations: key.iterations(),
        epoch: key.epoch(),
    })
}

/// Open `envelope` with `key` and deserialize the JSON payload.
/// `AuthenticationFailed` from the provider is returned unchanged.
pub async fn decode<C, T>(
    provider: &C,
    envelope: &EncryptedEnvelope,
    key: &DerivedKey,
) -> Result<T, StoreError>
where
    C: CryptoProvider + ?Sized,
    T: DeserializeOwned,
{
    envelope.validate()?;
    let plaintext = zeroize::Zeroizing::new(
        provider
            .decrypt(&envelope.ciphertext, &envelope.iv, key)
            .await?,
    );
    serde_json::from_slice(&plaintext).map_err(|e| StoreError::Serialization {
        reason: format!("decrypted payload is not valid JSON: {e}"),
    })
}

fn decode_field(name: &str, encoded: &str) -> Result<Vec<u8>, StoreError> {
    STANDARD
        .decode(encoded)
        .map_err(|e| malformed(format!("{name} is not base64: {e}")))
}

fn malformed<E: ToString>(reason: E) -> StoreError {
    StoreError::MalformedEnvelope {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::crypto::{AesGcmProvider, Password};

    async fn key(password: &str) -> DerivedKey {
        AesGcmProvider
            .derive_key(&Password::from(password), &[9u8; SALT_LEN], 1_000)
            .await
            .expect("derive")
            .with_epoch(3)
    }

    #[tokio::test]
    async fn encode_then_decode_restores_value() {
        let k = key("Str0ng!Pass").await;
        let value = json!({"name": "prod", "token": "sk-123", "ports": [80, 443]});

        let envelope = encode(&AesGcmProvider, &value, &k).await.expect("encode");
        assert_eq!(envelope.epoch, 3);
        assert_eq!(envelope.kdf_iterations, 1_000);
        assert_eq!(envelope.salt, vec![9u8; SALT_LEN]);

        let stored = envelope.to_json().expect("json");
        assert!(!stored.contains("sk-123"));
        let parsed = EncryptedEnvelope::parse(&stored)
            .expect("parse")
            .expect("is envelope");
        assert_eq!(parsed, envelope);

        let restored: serde_json::Value =
            decode(&AesGcmProvider, &parsed, &k).await.expect("decode");
        assert_eq!(restored, value);
    }

    #[tokio::test]
    async fn decode_with_other_key_is_authentication_failure() {
        let k1 = key("first").await;
        let k2 = key("second").await;
        let envelope = encode(&AesGcmProvider, "hello", &k1).await.expect("encode");

        let err = decode::<_, String>(&AesGcmProvider, &envelope, &k2)
            .await
            .expect_err("wrong key");
        assert_eq!(err, StoreError::AuthenticationFailed);
    }

    #[test]
    fn plaintext_values_are_not_envelopes() {
        assert_eq!(EncryptedEnvelope::parse(r#"{"theme":"dark"}"#).expect("ok"), None);
        assert_eq!(EncryptedEnvelope::parse("42").expect("ok"), None);
        assert_eq!(EncryptedEnvelope::parse("not json at all").expect("ok"), None);
    }

    #[test]
    fn objects_sharing_some_field_names_are_plaintext() {
        let partial = r#"{"ciphertext":"n/a","iv":"n/a"}"#;
        assert_eq!(EncryptedEnvelope::parse(partial).expect("ok"), None);

        let extra = json!({
            "ciphertext": "n/a",
            "iv": "n/a",
            "algorithm": ALGORITHM,
            "note": "user data",
        })
        .to_string();
        assert_eq!(EncryptedEnvelope::parse(&extra).expect("ok"), None);
    }

    #[test]
    fn envelope_shaped_garbage_is_malformed() {
        let missing_salt = r#"{"ciphertext":"AAAA","iv":"AAAA","algorithm":"AES-256-GCM+PBKDF2-SHA256"}"#;
        assert!(matches!(
            EncryptedEnvelope::parse(missing_salt),
            Err(StoreError::MalformedEnvelope { .. })
        ));

        let short_iv = json!({
            "ciphertext": STANDARD.encode([0u8; 32]),
            "iv": STANDARD.encode([0u8; 4]),
            "salt": STANDARD.encode([0u8; SALT_LEN]),
            "algorithm": ALGORITHM,
            "kdfIterations": 10,
        })
        .to_string();
        let err = EncryptedEnvelope::parse(&short_iv).expect_err("short iv");
        assert!(err.to_string().contains("iv is 4 bytes"));

        let foreign = json!({
            "ciphertext": STANDARD.encode([0u8; 32]),
            "iv": STANDARD.encode([0u8; IV_LEN]),
            "salt": STANDARD.encode([0u8; SALT_LEN]),
            "algorithm": "ROT13",
            "kdfIterations": 10,
        })
        .to_string();
        let err = EncryptedEnvelope::parse(&foreign).expect_err("unknown algorithm");
        assert!(err.to_string().contains("unsupported algorithm"));
    }
}
