//! ID token decoding and nonce validation
//!
//! Limitation: this module does NOT verify the token signature against the
//! issuer's keys, and does not check `exp`, `iss` or `aud`. A token that
//! passes [`validate`] is known to echo the nonce of this authorization
//! request, nothing more. Do not treat it as cryptographically authentic.

use crate::error::TokenValidationError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::{Map, Value};

/// Claims decoded from an ID token payload.
///
/// The fields this crate inspects are typed; every other issuer-defined
/// claim is kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IdentityClaims {
    pub subject: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub nonce: Option<String>,
    pub extra: Map<String, Value>,
}

impl IdentityClaims {
    fn from_map(mut map: Map<String, Value>) -> Self {
        // Non-string values for known claims stay in `extra` untouched
        let mut take = |key: &str| {
            if !matches!(map.get(key), Some(Value::String(_))) {
                return None;
            }
            match map.remove(key) {
                Some(Value::String(s)) => Some(s),
                _ => None,
            }
        };

        let subject = take("sub");
        let name = take("name");
        let email = take("email");
        let nonce = take("nonce");

        Self {
            subject,
            name,
            email,
            nonce,
            extra: map,
        }
    }

    /// Look up any claim, typed or not
    pub fn claim(&self, key: &str) -> Option<Value> {
        let typed = match key {
            "sub" => self.subject.as_ref(),
            "name" => self.name.as_ref(),
            "email" => self.email.as_ref(),
            "nonce" => self.nonce.as_ref(),
            _ => return self.extra.get(key).cloned(),
        };
        typed.map(|s| Value::String(s.clone()))
    }

    /// Short human label for logs and CLI output
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.email.as_deref())
            .or(self.subject.as_deref())
            .unwrap_or("unknown user")
    }
}

/// Decode the payload segment without checking the nonce.
///
/// Used to recompute claims from an already stored token.
pub fn decode_claims(id_token: &str) -> Result<IdentityClaims, TokenValidationError> {
    let segments: Vec<&str> = id_token.split('.').collect();
    if segments.len() != 3 {
        return Err(TokenValidationError::MalformedToken(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|e| TokenValidationError::MalformedToken(format!("payload is not base64url: {}", e)))?;

    match serde_json::from_slice::<Value>(&payload) {
        Ok(Value::Object(map)) => Ok(IdentityClaims::from_map(map)),
        Ok(_) => Err(TokenValidationError::MalformedToken(
            "payload is not a JSON object".to_string(),
        )),
        Err(e) => Err(TokenValidationError::MalformedToken(format!(
            "payload is not JSON: {}",
            e
        ))),
    }
}

/// Decode `id_token` and require its `nonce` claim to equal `expected_nonce`.
pub fn validate(
    id_token: &str,
    expected_nonce: &str,
) -> Result<IdentityClaims, TokenValidationError> {
    let claims = decode_claims(id_token)?;

    if claims.nonce.as_deref() != Some(expected_nonce) {
        tracing::warn!(
            nonce_present = claims.nonce.is_some(),
            "ID token nonce does not match the authorization request"
        );
        return Err(TokenValidationError::NonceMismatch);
    }

    Ok(claims)
}
