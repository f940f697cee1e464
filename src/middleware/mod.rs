use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiError;

/// Верифицированная личность запроса. Ядро токены не выпускает -
/// только проверяет подпись и отзыв.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: i64,
    pub email: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: Option<String>,
    pub exp: usize,
}

/// Проверяет bearer-токен: подпись, срок и отсутствие в чёрном списке.
pub async fn verify_token(state: &crate::AppState, token: &str) -> Result<AuthUser, ApiError> {
    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.config.jwt.secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::AuthRequired)?;

    let user_id: i64 = decoded
        .claims
        .sub
        .parse()
        .map_err(|_| ApiError::AuthRequired)?;

    // Шлюз токенов: KV за O(1), на промахе - БД.
    if state.cache.is_blacklisted(token).await {
        return Err(ApiError::AuthRevoked);
    }

    Ok(AuthUser {
        user_id,
        email: decoded.claims.email,
    })
}

// Bearer JWT extractor
impl FromRequestParts<Arc<crate::AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<crate::AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or(ApiError::AuthRequired)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::AuthRequired)?;

        verify_token(state, token).await
    }
}
