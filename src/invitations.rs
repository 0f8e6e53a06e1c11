// invitations.rs

use std::collections::HashMap;

use actix_web::{web, HttpResponse};
use chrono::Utc;
use futures_util::TryStreamExt;
use log::{info, warn};
use mongodb::bson::{doc, to_bson};
use mongodb::options::ReturnDocument;
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::auth::AuthenticatedUser;
use crate::errors::{ApiError, FieldError};
use crate::models::{
    Invitation, InvitationResponse, InvitationStatus, Project, PublicUser, User,
};
use crate::project::load_member_project;

// ─── REQUEST PAYLOADS ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    #[serde(default, alias = "projectId")]
    pub project_id: String,
    #[serde(default, alias = "recipientId")]
    pub recipient_id: String,
}

impl InviteRequest {
    /// Shape checks that need no database.
    pub fn validate(&self, sender_id: &str) -> Result<(), ApiError> {
        let mut errors = Vec::new();
        if self.project_id.trim().is_empty() {
            errors.push(FieldError::new("project_id", "Project id is required"));
        }
        if self.recipient_id.trim().is_empty() {
            errors.push(FieldError::new("recipient_id", "Recipient id is required"));
        } else if self.recipient_id == sender_id {
            errors.push(FieldError::new("recipient_id", "You cannot invite yourself"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(errors))
        }
    }
}

/// Invitation plus what a client needs to render it.
#[derive(Debug, Serialize)]
pub struct InvitationView {
    #[serde(flatten)]
    pub invitation: Invitation,
    pub project_name: Option<String>,
    pub sender: Option<PublicUser>,
}

// ─── ENDPOINTS ─────────────────────────────────────────────────────────────────

/// POST /invitations
/// A project member invites a user who is not yet a member.
pub async fn send_invitation(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    invite_info: web::Json<InviteRequest>,
) -> Result<HttpResponse, ApiError> {
    invite_info.validate(&user.id)?;
    let project_id = invite_info.project_id.trim();
    let recipient_id = invite_info.recipient_id.trim();

    let project = load_member_project(&data.mongodb, project_id, &user.id, false).await?;

    if data
        .mongodb
        .users()
        .find_one(doc! { "_id": recipient_id })
        .await?
        .is_none()
    {
        return Err(ApiError::NotFound("Recipient not found".to_string()));
    }
    if project.is_member(recipient_id) {
        return Err(ApiError::Conflict(
            "User is already a member of the project".to_string(),
        ));
    }

    let invitations = data.mongodb.invitations();
    let pending = doc! {
        "project_id": project_id,
        "recipient_id": recipient_id,
        "status": InvitationStatus::Pending.as_str(),
    };
    if invitations.find_one(pending).await?.is_some() {
        return Err(ApiError::Conflict(
            "An invitation is already pending for this user".to_string(),
        ));
    }

    let invitation = Invitation::new(project_id, &user.id, recipient_id);
    invitations.insert_one(&invitation).await?;
    info!(
        "User {} invited {} to project {}",
        user.id, recipient_id, project_id
    );

    Ok(HttpResponse::Created().json(invitation))
}

/// GET /invitations
/// Pending invitations addressed to the caller.
pub async fn list_received(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let invitations: Vec<Invitation> = data
        .mongodb
        .invitations()
        .find(doc! {
            "recipient_id": &user.id,
            "status": InvitationStatus::Pending.as_str(),
        })
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(with_details(&data, invitations).await?))
}

/// GET /invitations/sent
pub async fn list_sent(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    let invitations: Vec<Invitation> = data
        .mongodb
        .invitations()
        .find(doc! { "sender_id": &user.id })
        .await?
        .try_collect()
        .await?;
    Ok(HttpResponse::Ok().json(with_details(&data, invitations).await?))
}

/// POST /invitations/{invitation_id}/accept
pub async fn accept_invitation(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    invitation_id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    respond(user, data, invitation_id.into_inner(), InvitationResponse::Accept).await
}

/// POST /invitations/{invitation_id}/reject
pub async fn reject_invitation(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    invitation_id: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    respond(user, data, invitation_id.into_inner(), InvitationResponse::Reject).await
}

/// The status change is conditional on the invitation still being pending,
/// so only one of two racing responses wins. Adding the member afterwards is
/// a separate write.
async fn respond(
    user: AuthenticatedUser,
    data: web::Data<AppState>,
    invitation_id: String,
    response: InvitationResponse,
) -> Result<HttpResponse, ApiError> {
    let invitations = data.mongodb.invitations();
    let target = response.target_status();

    let updated = invitations
        .find_one_and_update(
            doc! {
                "_id": &invitation_id,
                "recipient_id": &user.id,
                "status": InvitationStatus::Pending.as_str(),
            },
            doc! { "$set": {
                "status": target.as_str(),
                "responded_at": to_bson(&Utc::now())?,
            } },
        )
        .return_document(ReturnDocument::After)
        .await?;

    let invitation = match updated {
        Some(invitation) => invitation,
        None => {
            let existing = invitations
                .find_one(doc! { "_id": &invitation_id })
                .await?
                .ok_or_else(|| ApiError::NotFound("Invitation not found".to_string()))?;
            existing.check_response(&user.id, response)?;
            return Err(ApiError::Conflict(
                "Invitation is no longer pending".to_string(),
            ));
        }
    };

    if response == InvitationResponse::Accept {
        let res = data
            .mongodb
            .projects()
            .update_one(
                doc! { "_id": &invitation.project_id },
                doc! {
                    "$addToSet": { "members": &user.id },
                    "$set": { "updated_at": to_bson(&Utc::now())? },
                },
            )
            .await?;
        if res.matched_count == 0 {
            warn!(
                "Invitation {} accepted but project {} is gone",
                invitation.id, invitation.project_id
            );
            return Err(ApiError::NotFound("Project no longer exists".to_string()));
        }
        info!("User {} joined project {}", user.id, invitation.project_id);
    } else {
        info!("User {} rejected invitation {}", user.id, invitation.id);
    }

    Ok(HttpResponse::Ok().json(invitation))
}

async fn with_details(
    data: &AppState,
    invitations: Vec<Invitation>,
) -> Result<Vec<InvitationView>, ApiError> {
    if invitations.is_empty() {
        return Ok(Vec::new());
    }
    let project_ids: Vec<String> = invitations.iter().map(|i| i.project_id.clone()).collect();
    let sender_ids: Vec<String> = invitations.iter().map(|i| i.sender_id.clone()).collect();

    let projects: HashMap<String, String> = data
        .mongodb
        .projects()
        .find(doc! { "_id": { "$in": project_ids } })
        .projection(doc! { "messages": 0 })
        .await?
        .try_collect::<Vec<Project>>()
        .await?
        .into_iter()
        .map(|p| (p.id, p.name))
        .collect();
    let senders: HashMap<String, PublicUser> = data
        .mongodb
        .users()
        .find(doc! { "_id": { "$in": sender_ids } })
        .await?
        .try_collect::<Vec<User>>()
        .await?
        .iter()
        .map(|u| (u.id.clone(), PublicUser::from(u)))
        .collect();

    Ok(invitations
        .into_iter()
        .map(|invitation| InvitationView {
            project_name: projects.get(&invitation.project_id).cloned(),
            sender: senders.get(&invitation.sender_id).cloned(),
            invitation,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(project: &str, recipient: &str) -> InviteRequest {
        InviteRequest {
            project_id: project.into(),
            recipient_id: recipient.into(),
        }
    }

    #[test]
    fn inviting_oneself_is_rejected() {
        let err = request("p1", "u1").validate("u1").unwrap_err();
        match err {
            ApiError::Validation(errors) => assert_eq!(errors[0].field, "recipient_id"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn missing_fields_are_reported() {
        match request("", "").validate("u1").unwrap_err() {
            ApiError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(request("p1", "u2").validate("u1").is_ok());
    }

    #[test]
    fn view_flattens_invitation() {
        let view = InvitationView {
            invitation: Invitation::new("p1", "u1", "u2"),
            project_name: Some("demo".into()),
            sender: None,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["project_id"], "p1");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["project_name"], "demo");
    }
}
