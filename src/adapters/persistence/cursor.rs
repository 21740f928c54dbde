//! Opaque pagination cursors.
//!
//! A cursor is URL-safe base64 of a small JSON document naming the backend that issued it,
//! the owner filter it was issued for, and the backend-specific resume position. When a
//! secret is configured the payload is followed by `.` and an HMAC-SHA256 tag, and cursors
//! whose tag does not verify are rejected.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use super::BackendKind;
use crate::errors::StoreError;

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    #[serde(rename = "b")]
    backend: BackendKind,
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
    #[serde(rename = "p")]
    position: Value,
}

#[derive(Clone)]
pub struct CursorCodec {
    backend: BackendKind,
    secret: Option<Vec<u8>>,
}

impl std::fmt::Debug for CursorCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorCodec")
            .field("backend", &self.backend)
            .field("signed", &self.secret.is_some())
            .finish()
    }
}

impl CursorCodec {
    #[must_use]
    pub fn new(backend: BackendKind, secret: Option<&str>) -> Self {
        Self {
            backend,
            secret: secret
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec()),
        }
    }

    #[must_use]
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// # Errors
    ///
    /// Returns an error if the position cannot be serialized.
    pub fn encode<P: Serialize>(
        &self,
        owner: Option<&str>,
        position: &P,
    ) -> Result<String, StoreError> {
        let payload = CursorPayload {
            backend: self.backend,
            owner: owner.map(str::to_string),
            position: serde_json::to_value(position)?,
        };
        let json = serde_json::to_vec(&payload)?;
        let mut token = URL_SAFE_NO_PAD.encode(&json);
        if let Some(tag) = self.sign(&json) {
            token.push('.');
            token.push_str(&tag);
        }
        Ok(token)
    }

    /// Decodes a cursor issued by this backend for the same owner filter.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidCursor` if the token is malformed, tampered with, or was
    /// issued by another backend or for another filter.
    pub fn decode<P: DeserializeOwned>(
        &self,
        owner: Option<&str>,
        token: &str,
    ) -> Result<P, StoreError> {
        let (body, tag) = match token.split_once('.') {
            Some((body, tag)) => (body, Some(tag)),
            None => (token, None),
        };
        let json = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| StoreError::InvalidCursor("not a cursor token".to_string()))?;

        if let Some(secret) = &self.secret {
            let tag = tag.ok_or_else(|| StoreError::InvalidCursor("missing signature".to_string()))?;
            let tag = hex::decode(tag)
                .map_err(|_| StoreError::InvalidCursor("malformed signature".to_string()))?;
            let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                .map_err(|e| StoreError::Backend(format!("cursor key: {e}")))?;
            mac.update(&json);
            mac.verify_slice(&tag)
                .map_err(|_| StoreError::InvalidCursor("signature mismatch".to_string()))?;
        }

        let payload: CursorPayload = serde_json::from_slice(&json)
            .map_err(|_| StoreError::InvalidCursor("unreadable payload".to_string()))?;
        if payload.backend != self.backend {
            return Err(StoreError::InvalidCursor(format!(
                "issued by the {} backend, not {}",
                payload.backend, self.backend
            )));
        }
        if payload.owner.as_deref() != owner {
            return Err(StoreError::InvalidCursor(
                "issued for a different listing filter".to_string(),
            ));
        }
        serde_json::from_value(payload.position)
            .map_err(|_| StoreError::InvalidCursor("unreadable position".to_string()))
    }

    fn sign(&self, json: &[u8]) -> Option<String> {
        let secret = self.secret.as_ref()?;
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).ok()?;
        mac.update(json);
        Some(hex::encode(mac.finalize().into_bytes()))
    }
}
