use std::sync::Arc;

use axum::http::{HeaderMap, header};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{error, warn};
use uuid::Uuid;

use tandem_db::Database;
use tandem_types::api::Claims;

use crate::error::ChatError;

/// Identity of an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub name: String,
}

/// Resolves handshake credentials into identities. A connection only reaches
/// a room after `authenticate` succeeds.
#[derive(Clone)]
pub struct Authenticator {
    jwt_secret: String,
}

impl Authenticator {
    pub fn new(jwt_secret: impl Into<String>) -> Self {
        Self {
            jwt_secret: jwt_secret.into(),
        }
    }

    pub fn decode(&self, token: &str) -> Result<Claims, ChatError> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| {
            warn!("Rejected gateway token: {}", e);
            ChatError::Unauthorized
        })
    }

    /// Decode the token and confirm its subject is still a known user.
    pub async fn authenticate(&self, db: &Arc<Database>, token: Option<&str>) -> Result<Identity, ChatError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(ChatError::Unauthorized)?;
        let claims = self.decode(token)?;

        let db = db.clone();
        let profile = tokio::task::spawn_blocking(move || db.get_profile(claims.sub))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                ChatError::Store(e.into())
            })??;

        match profile {
            Some(profile) => Ok(Identity {
                user_id: profile.id,
                name: profile.name,
            }),
            None => {
                warn!("Token subject {} is not a known user", claims.sub);
                Err(ChatError::Unauthorized)
            }
        }
    }
}

/// Credential from `Authorization: Bearer <jwt>`, falling back to the
/// `token` query parameter for browser clients that cannot set headers.
pub fn token_from_request(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    bearer.or_else(|| {
        query?
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
    })
}
