use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value as JsonValue;

use crate::types::SessionToken;

/// Local, unverified check of a persisted token before it is sent anywhere.
///
/// Opaque tokens and JWTs without `exp` pass. A JWT whose `exp` is at or
/// before `now` (unix seconds) fails, as does anything shaped like a JWT
/// whose payload does not decode.
#[must_use]
pub fn is_locally_expired(token: &SessionToken, now: i64) -> bool {
    let parts: Vec<&str> = token.as_str().split('.').collect();
    if parts.len() != 3 {
        return false;
    }

    let Some(claims) = decode_payload(parts[1]) else {
        return true;
    };

    match claims.get("exp") {
        Some(exp) => match exp.as_f64() {
            Some(exp) => exp <= now as f64,
            None => true,
        },
        None => false,
    }
}

/// Unix timestamp of the `exp` claim of a JWT-shaped token, unverified.
#[must_use]
pub fn expires_at(token: &SessionToken) -> Option<i64> {
    let payload = token.as_str().split('.').nth(1)?;
    decode_payload(payload)?.get("exp")?.as_i64()
}

fn decode_payload(segment: &str) -> Option<JsonValue> {
    // Some issuers pad the segment even though JWS says not to.
    let bytes = URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')).ok()?;
    let claims: JsonValue = serde_json::from_slice(&bytes).ok()?;
    claims.is_object().then_some(claims)
}

pub(crate) fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}
