//! JWT 认证
//!
//! 令牌由外部身份服务签发（HS256），这里只做校验并还原请求者身份。
//! 每次认证都会把令牌里的显示名同步到用户目录，供参与者解析使用。

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use application::Actor;
use config::JwtConfig;
use domain::{UserId, UserProfile, UserRole};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

/// JWT Claims 结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    #[serde(default)]
    pub role: UserRole,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

impl Claims {
    pub fn actor(&self) -> Actor {
        Actor {
            user_id: UserId::from(self.sub),
            role: self.role,
            display_name: self.name.clone(),
        }
    }
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
        }
    }

    /// 签发令牌，本地开发和测试使用
    pub fn generate_token(&self, actor: &Actor, ttl: chrono::Duration) -> Result<String, ApiError> {
        let claims = Claims {
            sub: actor.user_id.as_uuid(),
            role: actor.role,
            name: actor.display_name.clone(),
            exp: (chrono::Utc::now() + ttl).timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key).map_err(|err| {
            tracing::error!(error = %err, "令牌签发失败");
            ApiError::internal_server_error()
        })
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| {
                tracing::debug!(error = %err, "令牌校验失败");
                ApiError::unauthorized("invalid token")
            })
    }

    /// 从 headers 中提取和验证 token
    pub fn claims_from_headers(&self, headers: &HeaderMap) -> Result<Claims, ApiError> {
        let auth_header = headers
            .get(AUTHORIZATION)
            .and_then(|header| header.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("missing authorization header"))?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("invalid authorization header format"))?;

        self.verify_token(token)
    }
}

/// 校验令牌并同步用户资料
pub async fn authenticate(state: &AppState, claims: Claims) -> Result<Actor, ApiError> {
    let actor = claims.actor();
    state
        .users
        .upsert(&UserProfile {
            id: actor.user_id,
            display_name: actor.display_name.clone(),
        })
        .await
        .map_err(|err| ApiError::from(application::ApplicationError::from(err)))?;
    Ok(actor)
}

/// 已认证的请求者
#[derive(Debug, Clone)]
pub struct AuthUser(pub Actor);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let claims = state.jwt.claims_from_headers(&parts.headers)?;
        authenticate(state, claims).await.map(AuthUser)
    }
}
