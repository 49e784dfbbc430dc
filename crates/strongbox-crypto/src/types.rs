//! Persisted crypto types.
//!
//! Byte fields are serialized as standard base64 so stored versions stay
//! readable JSON.

use serde::{Deserialize, Serialize};
use strongbox_core::{DataKeyId, KekId};

/// AEAD algorithm used for a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    Aes256Gcm,
}

impl Default for Algorithm {
    fn default() -> Self {
        Self::Aes256Gcm
    }
}

/// A data key wrapped by a key-encryption key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Which KEK wrapped it. Prefixed with the issuing key service's ID.
    pub kek_id: KekId,

    #[serde(with = "b64")]
    pub bytes: Vec<u8>,
}

/// An encrypted value as persisted in a version chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,

    #[serde(with = "b64")]
    pub nonce: Vec<u8>,

    #[serde(with = "b64")]
    pub wrapped_data_key: Vec<u8>,

    pub kek_id: KekId,

    pub data_key_id: DataKeyId,

    #[serde(default)]
    pub algorithm: Algorithm,
}

impl EncryptedValue {
    /// The wrapped data key as a [`WrappedKey`].
    pub fn wrapped_key(&self) -> WrappedKey {
        WrappedKey {
            kek_id: self.kek_id.clone(),
            bytes: self.wrapped_data_key.clone(),
        }
    }

    /// Size of the stored ciphertext, used for quota checks.
    pub fn stored_len(&self) -> usize {
        self.ciphertext.len()
    }
}

pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypted_value_serializes_bytes_as_base64() {
        let value = EncryptedValue {
            ciphertext: vec![1, 2, 3],
            nonce: vec![0; 12],
            wrapped_data_key: vec![9; 4],
            kek_id: KekId::new("local:acme"),
            data_key_id: DataKeyId::from_string("dk_1"),
            algorithm: Algorithm::Aes256Gcm,
        };
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["ciphertext"], "AQID");
        assert_eq!(json["algorithm"], "aes256-gcm");

        let parsed: EncryptedValue = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, value);
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let json = serde_json::json!({
            "ciphertext": "!!!",
            "nonce": "",
            "wrapped_data_key": "",
            "kek_id": "local:acme",
            "data_key_id": "dk_1",
        });
        assert!(serde_json::from_value::<EncryptedValue>(json).is_err());
    }
}
