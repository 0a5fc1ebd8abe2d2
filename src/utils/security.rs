use base64::Engine;
use base64::engine::general_purpose;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "CH ";

pub fn b64_encode(data: &[u8]) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(data)
}

pub fn b64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    general_purpose::URL_SAFE_NO_PAD.decode(s)
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("INVALID_TOKEN")]
    InvalidToken,
    #[error("INVALID_TOKEN_FORMAT")]
    InvalidFormat,
    #[error("INVALID_SIGNATURE")]
    InvalidSignature,
    #[error("DECODE_ERROR")]
    Decode,
}

#[derive(Debug, Serialize)]
pub struct DecodedToken {
    pub user_id: String,
    pub is_expired: bool,
    pub expiration_timestamp: u64,
    pub key_type: String,
    pub session_id: String,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn mac_for(signature_key: &str) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(signature_key.as_bytes())
        .expect("hmac accepts keys of any length")
}

#[cfg(test)]
fn sign(message: &str, signature_key: &str) -> String {
    let mut mac = mac_for(signature_key);
    mac.update(message.as_bytes());
    b64_encode(&mac.finalize().into_bytes())
}

fn verify(message: &str, signature: &str, signature_key: &str) -> bool {
    let Ok(raw) = b64_decode(signature) else {
        return false;
    };
    let mut mac = mac_for(signature_key);
    mac.update(message.as_bytes());
    mac.verify_slice(&raw).is_ok()
}

/// Tokens are issued by the account service; tests mint their own.
#[cfg(test)]
pub fn generate_token(
    user_id: &str,
    key_type: &str,
    ttl_secs: u64,
    session_id: &str,
    signature_key: &str,
) -> String {
    let expiration = unix_now() + ttl_secs;
    let combined = format!("{}\0{}\0{}\0{}", user_id, expiration, session_id, key_type);
    let payload = b64_encode(combined.as_bytes());
    let signature = sign(&payload, signature_key);
    format!("{}{}.{}", TOKEN_PREFIX, payload, signature)
}

pub fn decode_token(
    token: &str,
    verify_type: Option<&str>,
    signature_key: &str,
) -> Result<DecodedToken, TokenError> {
    let t = token
        .strip_prefix(TOKEN_PREFIX)
        .ok_or(TokenError::InvalidToken)?;

    let (payload, signature) = t.rsplit_once('.').ok_or(TokenError::InvalidFormat)?;
    if !verify(payload, signature, signature_key) {
        return Err(TokenError::InvalidSignature);
    }

    let decoded = b64_decode(payload).map_err(|_| TokenError::Decode)?;
    let decoded = String::from_utf8(decoded).map_err(|_| TokenError::Decode)?;

    let parts: Vec<&str> = decoded.split('\0').collect();
    let &[user_id, expiration, session_id, key_type] = parts.as_slice() else {
        return Err(TokenError::Decode);
    };
    let expiration_timestamp = expiration.parse::<u64>().map_err(|_| TokenError::Decode)?;

    if verify_type.is_some_and(|expected| expected != key_type) {
        return Err(TokenError::InvalidToken);
    }

    Ok(DecodedToken {
        user_id: user_id.to_string(),
        is_expired: unix_now() > expiration_timestamp,
        expiration_timestamp,
        key_type: key_type.to_string(),
        session_id: session_id.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "test-signature-key";

    #[test]
    fn issued_token_decodes() {
        let token = generate_token("42", "access", 3600, "s1", KEY);
        let decoded = decode_token(&token, Some("access"), KEY).unwrap();
        assert_eq!(decoded.user_id, "42");
        assert_eq!(decoded.session_id, "s1");
        assert!(!decoded.is_expired);
    }

    #[test]
    fn wrong_key_type_is_rejected() {
        let token = generate_token("42", "refresh", 3600, "s1", KEY);
        assert_eq!(
            decode_token(&token, Some("access"), KEY).unwrap_err(),
            TokenError::InvalidToken
        );
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let token = generate_token("42", "access", 3600, "s1", KEY);
        let err = decode_token(&token, None, "another-key").unwrap_err();
        assert_eq!(err, TokenError::InvalidSignature);
    }

    #[test]
    fn missing_prefix_is_rejected() {
        assert_eq!(
            decode_token("Bearer abc.def", None, KEY).unwrap_err(),
            TokenError::InvalidToken
        );
    }
}
