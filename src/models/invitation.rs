use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ApiError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Rejected,
}

impl InvitationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationResponse {
    Accept,
    Reject,
}

impl InvitationResponse {
    pub fn target_status(self) -> InvitationStatus {
        match self {
            InvitationResponse::Accept => InvitationStatus::Accepted,
            InvitationResponse::Reject => InvitationStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invitation {
    #[serde(rename = "_id")]
    pub id: String,
    pub project_id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
}

impl Invitation {
    pub fn new(project_id: &str, sender_id: &str, recipient_id: &str) -> Self {
        Invitation {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            status: InvitationStatus::Pending,
            created_at: Utc::now(),
            responded_at: None,
        }
    }

    /// Decides whether `user_id` may respond to this invitation and which
    /// status it moves to. Only pending invitations can change.
    pub fn check_response(
        &self,
        user_id: &str,
        response: InvitationResponse,
    ) -> Result<InvitationStatus, ApiError> {
        if self.recipient_id != user_id {
            return Err(ApiError::Forbidden(
                "Only the invited user can respond to this invitation".to_string(),
            ));
        }
        if self.status != InvitationStatus::Pending {
            return Err(ApiError::Conflict(format!(
                "Invitation already {}",
                self.status.as_str()
            )));
        }
        Ok(response.target_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_can_accept_pending() {
        let invitation = Invitation::new("p1", "u1", "u2");
        assert_eq!(
            invitation.check_response("u2", InvitationResponse::Accept).unwrap(),
            InvitationStatus::Accepted
        );
    }

    #[test]
    fn accepting_twice_conflicts() {
        let mut invitation = Invitation::new("p1", "u1", "u2");
        invitation.status = InvitationStatus::Accepted;
        let err = invitation
            .check_response("u2", InvitationResponse::Accept)
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }

    #[test]
    fn sender_cannot_respond() {
        let invitation = Invitation::new("p1", "u1", "u2");
        let err = invitation
            .check_response("u1", InvitationResponse::Reject)
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden(_)));
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&InvitationStatus::Rejected).unwrap();
        assert_eq!(json, "\"rejected\"");
    }
}
