// src/project.rs

use std::collections::BTreeSet;

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use log::{debug, error, info};
use mongodb::bson::{doc, to_bson};
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::auth::AuthenticatedUser;
use crate::db::MongoDB;
use crate::errors::ApiError;
use crate::models::project::validate_project_name;
use crate::models::{FileTree, Message, NewMessage, Project};
use crate::project_hub::{Broadcast, Presence, ServerEvent};
use crate::web_socket_server::spawn_ai_reply;

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddMembersRequest {
    #[serde(default)]
    pub users: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFileTreeRequest {
    #[serde(alias = "fileTree")]
    pub file_tree: FileTree,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub since: Option<DateTime<Utc>>,
    #[serde(alias = "sessionId")]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub project_id: String,
    pub users: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Appended {
    New,
    Duplicate,
}

// ─── SHARED QUERIES ────────────────────────────────────────────────────────────

/// Loads a project the user belongs to. With `with_messages == false` the
/// message log is left out of the read.
pub async fn load_member_project(
    db: &MongoDB,
    project_id: &str,
    user_id: &str,
    with_messages: bool,
) -> Result<Project, ApiError> {
    let projects = db.projects();
    let find = projects.find_one(doc! { "_id": project_id });
    let project = if with_messages {
        find.await?
    } else {
        find.projection(doc! { "messages": 0 }).await?
    };
    let project = project.ok_or_else(|| ApiError::NotFound("Project not found".to_string()))?;
    if !project.is_member(user_id) {
        return Err(ApiError::Forbidden("Not a member of this project".to_string()));
    }
    Ok(project)
}

/// Appends unless a message with the same id is already in the log. The id
/// check and the push are one single-document update.
pub async fn append_message(
    db: &MongoDB,
    project_id: &str,
    message: &Message,
) -> Result<Appended, ApiError> {
    let result = db
        .projects()
        .update_one(
            doc! { "_id": project_id, "messages.id": { "$ne": &message.id } },
            doc! {
                "$push": { "messages": to_bson(message)? },
                "$set": { "updated_at": to_bson(&Utc::now())? },
            },
        )
        .await?;
    if result.matched_count == 1 {
        return Ok(Appended::New);
    }
    let exists = db.projects().count_documents(doc! { "_id": project_id }).await?;
    if exists == 0 {
        Err(ApiError::NotFound("Project not found".to_string()))
    } else {
        Ok(Appended::Duplicate)
    }
}

// ─── ENDPOINTS ─────────────────────────────────────────────────────────────────

/// POST /projects
pub async fn create_project(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    project_info: web::Json<CreateProjectRequest>,
) -> Result<HttpResponse, ApiError> {
    debug!("create_project called with payload: {:?}", project_info);
    let name = validate_project_name(project_info.name.as_deref())
        .map_err(|e| ApiError::Validation(vec![e]))?;

    let new_project = Project::new(name, &user.id);
    data.mongodb.projects().insert_one(&new_project).await?;
    info!("Project created {} by {}", new_project.id, user.id);

    Ok(HttpResponse::Created().json(new_project))
}

/// GET /projects
pub async fn list_projects(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let mut projects: Vec<Project> = data
        .mongodb
        .projects()
        .find(doc! { "members": &user.id })
        .projection(doc! { "messages": 0 })
        .await?
        .try_collect()
        .await?;
    projects.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(HttpResponse::Ok().json(projects))
}

/// GET /projects/{project_id}
pub async fn get_project(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    project_id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let project = load_member_project(&data.mongodb, &project_id, &user.id, true).await?;
    Ok(HttpResponse::Ok().json(project))
}

/// DELETE /projects/{project_id}
pub async fn delete_project(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    project_id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let project_id = project_id.into_inner();
    load_member_project(&data.mongodb, &project_id, &user.id, false).await?;

    let res = data.mongodb.projects().delete_one(doc! { "_id": &project_id }).await?;
    if res.deleted_count == 0 {
        return Err(ApiError::NotFound("Project not found".to_string()));
    }
    // Pending invitations to a deleted project are useless.
    if let Err(e) = data
        .mongodb
        .invitations()
        .delete_many(doc! { "project_id": &project_id })
        .await
    {
        error!("Error removing invitations of project {}: {}", project_id, e);
    }

    info!("Project {} deleted by {}", project_id, user.id);
    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "Project deleted" })))
}

/// PUT /projects/{project_id}/members
pub async fn add_members(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    project_id: web::Path<String>,
    payload: web::Json<AddMembersRequest>,
) -> Result<HttpResponse, ApiError> {
    let project_id = project_id.into_inner();
    let wanted: BTreeSet<String> = payload
        .users
        .iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect();
    if wanted.is_empty() {
        return Err(ApiError::field("users", "At least one user id is required"));
    }

    load_member_project(&data.mongodb, &project_id, &user.id, false).await?;

    let ids: Vec<String> = wanted.iter().cloned().collect();
    let known = data
        .mongodb
        .users()
        .count_documents(doc! { "_id": { "$in": ids.clone() } })
        .await?;
    if known as usize != wanted.len() {
        return Err(ApiError::field("users", "One or more users do not exist"));
    }

    data.mongodb
        .projects()
        .update_one(
            doc! { "_id": &project_id },
            doc! {
                "$addToSet": { "members": { "$each": ids } },
                "$set": { "updated_at": to_bson(&Utc::now())? },
            },
        )
        .await?;
    info!("Added {:?} to project {}", wanted, project_id);

    let project = load_member_project(&data.mongodb, &project_id, &user.id, false).await?;
    Ok(HttpResponse::Ok().json(project))
}

/// PUT /projects/{project_id}/file-tree
///
/// Replaces the whole tree. Concurrent editors overwrite each other.
pub async fn update_file_tree(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    project_id: web::Path<String>,
    payload: web::Json<UpdateFileTreeRequest>,
) -> Result<HttpResponse, ApiError> {
    let project_id = project_id.into_inner();
    let file_tree = payload.into_inner().file_tree;
    file_tree.validate().map_err(ApiError::Validation)?;

    load_member_project(&data.mongodb, &project_id, &user.id, false).await?;

    let res = data
        .mongodb
        .projects()
        .update_one(
            doc! { "_id": &project_id },
            doc! { "$set": {
                "file_tree": to_bson(&file_tree)?,
                "updated_at": to_bson(&Utc::now())?,
            } },
        )
        .await?;
    if res.matched_count == 0 {
        return Err(ApiError::NotFound("Project not found".to_string()));
    }
    debug!("File tree of {} replaced ({} files)", project_id, file_tree.len());

    let project = load_member_project(&data.mongodb, &project_id, &user.id, false).await?;
    Ok(HttpResponse::Ok().json(project))
}

/// GET /projects/{project_id}/messages
pub async fn get_messages(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    project_id: web::Path<String>,
    query: web::Query<MessagesQuery>,
) -> Result<HttpResponse, ApiError> {
    let project = load_member_project(&data.mongodb, &project_id, &user.id, true).await?;
    Ok(HttpResponse::Ok().json(project.messages_since(query.since, query.session_id.as_deref())))
}

/// POST /projects/{project_id}/messages
///
/// REST counterpart of the socket `project-message` event.
pub async fn post_message(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    project_id: web::Path<String>,
    payload: web::Json<NewMessage>,
) -> Result<HttpResponse, ApiError> {
    let project_id = project_id.into_inner();
    let payload = payload.into_inner();
    payload.validate().map_err(ApiError::Validation)?;

    load_member_project(&data.mongodb, &project_id, &user.id, false).await?;
    let sender_name = data
        .mongodb
        .users()
        .find_one(doc! { "_id": &user.id })
        .await?
        .map(|u| u.label());

    let message = payload.into_message(&user.id, sender_name);
    match append_message(&data.mongodb, &project_id, &message).await? {
        Appended::New => {
            data.hub.do_send(Broadcast {
                project_id: project_id.clone(),
                event: ServerEvent::ProjectMessage(message.clone()),
                skip: None,
            });
            spawn_ai_reply(data.clone(), project_id, &message);
            Ok(HttpResponse::Created().json(message))
        }
        Appended::Duplicate => {
            let project = load_member_project(&data.mongodb, &project_id, &user.id, true).await?;
            let existing = project
                .messages
                .into_iter()
                .find(|m| m.id == message.id)
                .ok_or_else(|| ApiError::Conflict("Message id is already in use".to_string()))?;
            Ok(HttpResponse::Ok().json(existing))
        }
    }
}

/// GET /projects/{project_id}/presence
pub async fn get_presence(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    project_id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let project_id = project_id.into_inner();
    load_member_project(&data.mongodb, &project_id, &user.id, false).await?;
    let users = data
        .hub
        .send(Presence {
            project_id: project_id.clone(),
        })
        .await
        .map_err(|e| ApiError::Internal(format!("Project hub unavailable: {}", e)))?;
    Ok(HttpResponse::Ok().json(PresenceResponse { project_id, users }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_support::state;

    #[actix_web::test]
    async fn member_lookup_reports_unreachable_or_missing_project() {
        let data = state().await;
        for with_messages in [false, true] {
            let err = load_member_project(&data.mongodb, "no-such-project", "u1", with_messages)
                .await
                .unwrap_err();
            assert!(
                matches!(err, ApiError::Database(_) | ApiError::NotFound(_)),
                "unexpected error {:?}",
                err
            );
        }
    }

    #[test]
    fn messages_query_accepts_camel_case_session() {
        let q: MessagesQuery =
            serde_json::from_str(r#"{"sessionId":"s1","since":"2024-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(q.session_id.as_deref(), Some("s1"));
        assert!(q.since.is_some());
    }
}
