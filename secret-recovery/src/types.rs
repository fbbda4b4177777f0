// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Request and response types for the forward-secrecy store/restore calls.
//!
//! Byte fields travel as standard base64 strings in json bodies.

use std::fmt;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Short-lived credential for the secret recovery service.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SvrCredential {
    pub username: String,
    pub password: String,
}

impl SvrCredential {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// don't leak the password into logs
impl fmt::Debug for SvrCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SvrCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Long-lived account credentials used to obtain [`SvrCredential`]s.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AccountCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for AccountCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Store a new link in the secret chain.
///
/// `previous_secret_data` is the rotation seed returned by the last successful
/// store or restore, or `None` to start a new chain.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRequest {
    #[serde(with = "b64")]
    pub backup_id: Vec<u8>,
    #[serde(with = "b64")]
    pub password: Vec<u8>,
    #[serde(with = "b64_opt", default, skip_serializing_if = "Option::is_none")]
    pub previous_secret_data: Option<Vec<u8>>,
}

impl fmt::Debug for StoreRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRequest")
            .field("backup_id", &self.backup_id.len())
            .field(
                "previous_secret_data",
                &self.previous_secret_data.as_ref().map(Vec::len),
            )
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreResponse {
    #[serde(with = "b64")]
    pub forward_secrecy_token: Vec<u8>,
    #[serde(with = "b64")]
    pub next_secret_data: Vec<u8>,
    /// Opaque header body to prepend to the archive; needed to restore the token later.
    #[serde(with = "b64")]
    pub metadata: Vec<u8>,
}

impl fmt::Debug for StoreResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreResponse")
            .field("next_secret_data", &self.next_secret_data.len())
            .field("metadata", &self.metadata.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    #[serde(with = "b64")]
    pub backup_id: Vec<u8>,
    #[serde(with = "b64")]
    pub password: Vec<u8>,
    #[serde(with = "b64")]
    pub metadata: Vec<u8>,
}

impl fmt::Debug for RestoreRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreRequest")
            .field("backup_id", &self.backup_id.len())
            .field("metadata", &self.metadata.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResponse {
    #[serde(with = "b64")]
    pub forward_secrecy_token: Vec<u8>,
    #[serde(with = "b64")]
    pub next_secret_data: Vec<u8>,
}

impl fmt::Debug for RestoreResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestoreResponse")
            .field("next_secret_data", &self.next_secret_data.len())
            .finish_non_exhaustive()
    }
}

mod b64 {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(D::Error::custom)
    }
}

mod b64_opt {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| STANDARD.decode(text.as_bytes()).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_request_omits_missing_seed() {
        let req = StoreRequest {
            backup_id: vec![1, 2, 3],
            password: b"pw".to_vec(),
            previous_secret_data: None,
        };
        let json = serde_json::to_value(&req).expect("serialize");
        assert_eq!(json["backupId"], "AQID");
        assert!(json.get("previousSecretData").is_none());
    }

    #[test]
    fn restore_response_decodes_base64() {
        let json = r#"{"forwardSecrecyToken":"AAEC","nextSecretData":"/w=="}"#;
        let resp: RestoreResponse = serde_json::from_str(json).expect("deserialize");
        assert_eq!(resp.forward_secrecy_token, vec![0, 1, 2]);
        assert_eq!(resp.next_secret_data, vec![0xff]);
    }

    #[test]
    fn credential_debug_redacts_password() {
        let cred = SvrCredential::new("user", "hunter2");
        let text = format!("{cred:?}");
        assert!(text.contains("user"));
        assert!(!text.contains("hunter2"));
    }
}
