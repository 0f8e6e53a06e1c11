use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use actix_web::{dev::Payload, web, FromRequest, HttpMessage, HttpRequest, HttpResponse};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{Duration, Utc};
use futures::future::{ready, Ready};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, info};
use mongodb::bson::doc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::is_duplicate_key;
use crate::errors::ApiError;
use crate::models::user::{check_email, check_password, check_username, normalize_email};
use crate::models::{PublicUser, User};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// The caller, as established by the authentication middleware. Handlers
/// that take this extractor reject anonymous requests with 401.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: String,
    pub token: String,
    pub exp: usize,
}

impl FromRequest for AuthenticatedUser {
    type Error = ApiError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<AuthenticatedUser>()
                .cloned()
                .ok_or_else(|| ApiError::Unauthorized("Unauthorized".to_string())),
        )
    }
}

// JWT Creation
pub fn create_jwt(
    user_id: &str,
    secret: &str,
    ttl_hours: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let expiration = Utc::now() + Duration::hours(ttl_hours);
    let claims = Claims {
        sub: user_id.to_string(),
        exp: expiration.timestamp() as usize,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_ref()))
}

// JWT Validation
pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::default(),
    )?;
    Ok(token_data.claims)
}

/// Validates a token and checks it has not been revoked by a logout.
pub fn authenticate_token(token: &str, state: &AppState) -> Result<AuthenticatedUser, ApiError> {
    let claims = validate_jwt(token, &state.config.jwt_secret)
        .map_err(|e| ApiError::Unauthorized(format!("Invalid token: {}", e)))?;
    if state.revoked_tokens.is_revoked(token) {
        return Err(ApiError::Unauthorized("Token has been revoked".to_string()));
    }
    Ok(AuthenticatedUser {
        id: claims.sub,
        token: token.to_string(),
        exp: claims.exp,
    })
}

/// Tokens revoked by logout, kept until they would have expired anyway.
#[derive(Clone, Default)]
pub struct TokenBlacklist {
    entries: Arc<Mutex<HashMap<String, usize>>>,
}

impl TokenBlacklist {
    pub fn revoke(&self, token: &str, exp: usize) {
        let now = Utc::now().timestamp() as usize;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, expires| *expires > now);
        if exp > now {
            entries.insert(token.to_string(), exp);
        }
    }

    pub fn is_revoked(&self, token: &str) -> bool {
        let now = Utc::now().timestamp() as usize;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(token)
            .is_some_and(|expires| *expires > now)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ─── PASSWORDS ─────────────────────────────────────────────────────────────────

/// bcrypt is deliberately slow, so it runs on the blocking pool.
async fn hash_password(password: String, cost: u32) -> Result<String, ApiError> {
    web::block(move || hash(password, cost))
        .await
        .map_err(|e| ApiError::Internal(format!("Error hashing password: {}", e)))?
        .map_err(ApiError::from)
}

async fn verify_password(password: String, password_hash: String) -> Result<bool, ApiError> {
    web::block(move || verify(password, &password_hash).unwrap_or(false))
        .await
        .map_err(|e| ApiError::Internal(format!("Error verifying password: {}", e)))
}

// ─── ENDPOINTS ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterInfo {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginInfo {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: PublicUser,
}

fn issue_token(data: &AppState, user: &User) -> Result<AuthResponse, ApiError> {
    let token = create_jwt(&user.id, &data.config.jwt_secret, data.config.jwt_ttl_hours)
        .map_err(|e| ApiError::Internal(format!("Error creating token: {}", e)))?;
    Ok(AuthResponse {
        token,
        user: PublicUser::from(user),
    })
}

/// POST /auth/register
pub async fn register(
    data: web::Data<AppState>,
    info: web::Json<RegisterInfo>,
) -> Result<HttpResponse, ApiError> {
    let info = info.into_inner();
    let email = normalize_email(&info.email);
    let username = info.username.trim().to_string();

    let mut errors = Vec::new();
    check_email(&email, &mut errors);
    check_username(&username, &mut errors);
    check_password(&info.password, &mut errors);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let users = data.mongodb.users();
    if users.find_one(doc! { "email": &email }).await?.is_some() {
        return Err(ApiError::Conflict("Email is already registered".to_string()));
    }
    if users.find_one(doc! { "username": &username }).await?.is_some() {
        return Err(ApiError::Conflict("Username is already taken".to_string()));
    }

    let now = Utc::now();
    let new_user = User {
        id: Uuid::new_v4().to_string(),
        email,
        username,
        password_hash: hash_password(info.password, DEFAULT_COST).await?,
        display_name: None,
        bio: None,
        avatar_url: None,
        created_at: now,
        updated_at: now,
    };

    // The unique indexes catch a concurrent registration that slipped past
    // the checks above.
    match users.insert_one(&new_user).await {
        Ok(_) => {}
        Err(e) if is_duplicate_key(&e) => {
            return Err(ApiError::Conflict(
                "Email or username is already registered".to_string(),
            ))
        }
        Err(e) => return Err(e.into()),
    }

    info!("User registered: {}", new_user.id);
    Ok(HttpResponse::Created().json(issue_token(&data, &new_user)?))
}

/// POST /auth/login
pub async fn login(
    data: web::Data<AppState>,
    info: web::Json<LoginInfo>,
) -> Result<HttpResponse, ApiError> {
    let info = info.into_inner();
    let email = normalize_email(&info.email);
    if email.is_empty() || info.password.is_empty() {
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    }

    let user = data
        .mongodb
        .users()
        .find_one(doc! { "email": &email })
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Invalid credentials".to_string()))?;

    if !verify_password(info.password, user.password_hash.clone()).await? {
        debug!("Failed login for {}", user.id);
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    }

    info!("User logged in: {}", user.id);
    Ok(HttpResponse::Ok().json(issue_token(&data, &user)?))
}

/// POST /auth/logout
pub async fn logout(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    data.revoked_tokens.revoke(&user.token, user.exp);
    info!("User logged out: {}", user.id);
    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "Logged out" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_round_trip() {
        let token = create_jwt("user-1", "secret", 1).unwrap();
        let claims = validate_jwt(&token, "secret").unwrap();
        assert_eq!(claims.sub, "user-1");
        assert!(validate_jwt(&token, "other-secret").is_err());
    }

    #[test]
    fn expired_jwt_is_rejected() {
        let token = create_jwt("user-1", "secret", -2).unwrap();
        assert!(validate_jwt(&token, "secret").is_err());
    }

    #[test]
    fn blacklist_forgets_expired_tokens() {
        let blacklist = TokenBlacklist::default();
        let future = (Utc::now().timestamp() + 3600) as usize;
        blacklist.revoke("live", future);
        blacklist.revoke("stale", 1);
        assert!(blacklist.is_revoked("live"));
        assert!(!blacklist.is_revoked("stale"));
        assert_eq!(blacklist.len(), 1);
    }

    #[actix_web::test]
    async fn wrong_password_does_not_verify() {
        let hashed = hash_password("correct horse".into(), 4).await.unwrap();
        assert!(verify_password("correct horse".into(), hashed.clone()).await.unwrap());
        assert!(!verify_password("battery staple".into(), hashed).await.unwrap());
    }
}
