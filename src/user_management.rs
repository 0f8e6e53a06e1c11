use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures_util::TryStreamExt;
use log::{debug, info};
use mongodb::bson::{doc, to_bson, Bson, Document};
use mongodb::options::ReturnDocument;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::auth::AuthenticatedUser;
use crate::db::is_duplicate_key;
use crate::errors::{ApiError, FieldError};
use crate::models::user::check_username;
use crate::models::{PublicUser, User};

const MAX_DISPLAY_NAME_LEN: usize = 60;
const MAX_BIO_LEN: usize = 500;
const MAX_AVATAR_URL_LEN: usize = 2048;
const SEARCH_LIMIT: i64 = 20;

#[derive(Debug, Default, Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(default, alias = "displayName")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default, alias = "avatarUrl")]
    pub avatar_url: Option<String>,
}

impl UpdateProfileRequest {
    /// Builds the `$set` document. A blank value clears the field.
    pub fn to_update(&self) -> Result<Document, ApiError> {
        if self.display_name.is_none() && self.bio.is_none() && self.avatar_url.is_none() {
            return Err(ApiError::BadRequest("No profile fields to update".to_string()));
        }

        let mut errors = Vec::new();
        let mut set = Document::new();

        if let Some(name) = &self.display_name {
            let name = name.trim();
            if name.chars().count() > MAX_DISPLAY_NAME_LEN {
                errors.push(FieldError::new(
                    "display_name",
                    format!("Display name must be at most {} characters", MAX_DISPLAY_NAME_LEN),
                ));
            }
            set.insert("display_name", optional_text(name));
        }
        if let Some(bio) = &self.bio {
            let bio = bio.trim();
            if bio.chars().count() > MAX_BIO_LEN {
                errors.push(FieldError::new(
                    "bio",
                    format!("Bio must be at most {} characters", MAX_BIO_LEN),
                ));
            }
            set.insert("bio", optional_text(bio));
        }
        if let Some(url) = &self.avatar_url {
            let url = url.trim();
            let scheme_ok = url.starts_with("http://") || url.starts_with("https://");
            if !url.is_empty() && (!scheme_ok || url.len() > MAX_AVATAR_URL_LEN) {
                errors.push(FieldError::new(
                    "avatar_url",
                    "Avatar URL must be an http(s) URL",
                ));
            }
            set.insert("avatar_url", optional_text(url));
        }

        if !errors.is_empty() {
            return Err(ApiError::Validation(errors));
        }
        Ok(set)
    }
}

fn optional_text(value: &str) -> Bson {
    if value.is_empty() {
        Bson::Null
    } else {
        Bson::String(value.to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateUsernameRequest {
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

/// Case-insensitive substring match on email or username. The input is
/// escaped so it is never interpreted as a pattern.
pub fn search_filter(term: &str, exclude_id: &str) -> Document {
    let pattern = regex::escape(term.trim());
    doc! {
        "_id": { "$ne": exclude_id },
        "$or": [
            { "email": { "$regex": &pattern, "$options": "i" } },
            { "username": { "$regex": &pattern, "$options": "i" } },
        ],
    }
}

async fn find_user(data: &AppState, user_id: &str) -> Result<User, ApiError> {
    data.mongodb
        .users()
        .find_one(doc! { "_id": user_id })
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))
}

/// GET /users/me
pub async fn get_me(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let me = find_user(&data, &user.id).await?;
    Ok(HttpResponse::Ok().json(PublicUser::from(&me)))
}

/// PUT /users/me
pub async fn update_me(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    payload: web::Json<UpdateProfileRequest>,
) -> Result<HttpResponse, ApiError> {
    let mut set = payload.to_update()?;
    set.insert("updated_at", to_bson(&Utc::now())?);

    let updated = data
        .mongodb
        .users()
        .find_one_and_update(doc! { "_id": &user.id }, doc! { "$set": set })
        .return_document(ReturnDocument::After)
        .await?
        .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

    info!("Profile updated for {}", user.id);
    Ok(HttpResponse::Ok().json(PublicUser::from(&updated)))
}

/// PUT /users/me/username
pub async fn update_username(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    payload: web::Json<UpdateUsernameRequest>,
) -> Result<HttpResponse, ApiError> {
    let username = payload.username.trim().to_string();
    let mut errors = Vec::new();
    check_username(&username, &mut errors);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let users = data.mongodb.users();
    let taken = users
        .find_one(doc! { "username": &username, "_id": { "$ne": &user.id } })
        .await?;
    if taken.is_some() {
        return Err(ApiError::Conflict("Username is already taken".to_string()));
    }

    let updated = users
        .find_one_and_update(
            doc! { "_id": &user.id },
            doc! { "$set": {
                "username": &username,
                "updated_at": to_bson(&Utc::now())?,
            } },
        )
        .return_document(ReturnDocument::After)
        .await;
    let updated = match updated {
        Ok(Some(u)) => u,
        Ok(None) => return Err(ApiError::NotFound("User not found".to_string())),
        Err(e) if is_duplicate_key(&e) => {
            return Err(ApiError::Conflict("Username is already taken".to_string()))
        }
        Err(e) => return Err(e.into()),
    };

    info!("User {} is now @{}", user.id, username);
    Ok(HttpResponse::Ok().json(PublicUser::from(&updated)))
}

/// GET /users/search?q=
pub async fn search_users(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse, ApiError> {
    if query.q.trim().is_empty() {
        return Err(ApiError::field("q", "Search term is required"));
    }
    debug!("User search by {} for {:?}", user.id, query.q);

    let users: Vec<User> = data
        .mongodb
        .users()
        .find(search_filter(&query.q, &user.id))
        .sort(doc! { "username": 1 })
        .limit(SEARCH_LIMIT)
        .await?
        .try_collect()
        .await?;
    let found: Vec<PublicUser> = users.iter().map(PublicUser::from).collect();
    Ok(HttpResponse::Ok().json(found))
}

/// GET /users
pub async fn list_users(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let users: Vec<User> = data
        .mongodb
        .users()
        .find(doc! { "_id": { "$ne": &user.id } })
        .sort(doc! { "username": 1 })
        .await?
        .try_collect()
        .await?;
    let listed: Vec<PublicUser> = users.iter().map(PublicUser::from).collect();
    Ok(HttpResponse::Ok().json(listed))
}

/// GET /users/{id}
pub async fn get_user_by_id(
    _user: AuthenticatedUser,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let found = find_user(&data, &path).await?;
    Ok(HttpResponse::Ok().json(PublicUser::from(&found)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_profile_update_is_rejected() {
        let err = UpdateProfileRequest::default().to_update().unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn blank_fields_clear_and_others_are_trimmed() {
        let req = UpdateProfileRequest {
            display_name: Some("  Ada  ".into()),
            bio: Some("   ".into()),
            avatar_url: None,
        };
        let set = req.to_update().unwrap();
        assert_eq!(set.get_str("display_name").unwrap(), "Ada");
        assert_eq!(set.get("bio"), Some(&Bson::Null));
        assert!(!set.contains_key("avatar_url"));
    }

    #[test]
    fn profile_limits_are_enforced() {
        let req = UpdateProfileRequest {
            display_name: Some("x".repeat(61)),
            bio: Some("y".repeat(501)),
            avatar_url: Some("ftp://example.com/a.png".into()),
        };
        match req.to_update().unwrap_err() {
            ApiError::Validation(errors) => {
                let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
                assert_eq!(fields, vec!["display_name", "bio", "avatar_url"]);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn search_term_is_escaped() {
        let filter = search_filter(" a.b* ", "me");
        let clauses = filter.get_array("$or").unwrap();
        let email = clauses[0].as_document().unwrap().get_document("email").unwrap();
        assert_eq!(email.get_str("$regex").unwrap(), r"a\.b\*");
        assert_eq!(
            filter.get_document("_id").unwrap().get_str("$ne").unwrap(),
            "me"
        );
    }
}
