use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::application::access::Peer;
use crate::domain::BucketId;

/// Token claims shared by all three peer kinds. `kind` selects the peer;
/// container tokens additionally carry the single bucket they are bound to.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<Uuid>,
    pub exp: usize,
}

pub const KIND_USER: &str = "user";
pub const KIND_CONTAINER: &str = "container";
pub const KIND_SERVICE: &str = "service";

pub fn issue_token(secret: &str, claims: &Claims) -> Option<String> {
    jsonwebtoken::encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .ok()
}

/// Resolves the peer behind a bearer token. None means the handshake must
/// be rejected with `Unauthorized`.
pub fn resolve_peer(secret: &str, token: &str) -> Option<Peer> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return None;
    }
    let data = jsonwebtoken::decode::<Claims>(
        trimmed,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    let claims = data.claims;
    match claims.kind.as_str() {
        KIND_USER => Some(Peer::Browser {
            user_id: claims.sub,
        }),
        KIND_CONTAINER => claims.bucket.map(|bucket| Peer::ContainerAgent {
            container_id: claims.sub,
            bucket: BucketId::from(bucket),
        }),
        KIND_SERVICE => Some(Peer::Service),
        _ => None,
    }
}

pub fn future_exp(secs: i64) -> usize {
    (chrono::Utc::now().timestamp() + secs) as usize
}
