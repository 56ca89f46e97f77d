use chrono::{DateTime, Utc};
use rocket::http::Status;
use serde::Serialize;

use super::{ApprovalStatus, Permission, Role};
use crate::error::AppError;

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub display_name: String,
    pub approval_status: ApprovalStatus,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow, Clone)]
pub struct DbUser {
    pub id: Option<i64>,
    pub username: Option<String>,
    pub role: Option<String>,
    pub display_name: Option<String>,
    pub approval_status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbUser> for User {
    type Error = AppError;

    fn try_from(user: DbUser) -> Result<Self, Self::Error> {
        let username = user.username.unwrap_or_default();
        let role = user.role.unwrap_or_default().parse::<Role>()?;
        let approval_status = user
            .approval_status
            .unwrap_or_else(|| "pending".to_string())
            .parse::<ApprovalStatus>()?;

        Ok(Self {
            id: user.id.unwrap_or_default(),
            display_name: user.display_name.unwrap_or_else(|| username.clone()),
            username,
            role,
            approval_status,
            created_at: user.created_at,
        })
    }
}

impl User {
    pub fn is_approved(&self) -> bool {
        self.approval_status == ApprovalStatus::Approved
    }

    pub fn require_permission(&self, permission: Permission) -> Result<(), Status> {
        if self.role.has_permission(permission) {
            Ok(())
        } else {
            tracing::warn!(
                username = %self.username,
                role = %self.role.as_str(),
                permission = ?permission,
                "Permission denied"
            );
            Err(Status::Forbidden)
        }
    }
}
