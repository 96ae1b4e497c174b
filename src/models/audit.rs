use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::notification::Notification;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    pub id: Uuid,
    pub user_id: String,
    pub application: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub user_agent: String,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAuditLog {
    pub user_id: String,
    pub application: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub user_agent: String,
    pub success: bool,
    pub error_message: Option<String>,
}

impl CreateAuditLog {
    pub fn new(notification: &Notification, success: bool) -> Self {
        Self {
            user_id: notification.user_id.clone(),
            application: notification.application.clone(),
            message: notification.message.clone(),
            timestamp: Utc::now(),
            ip: String::new(),
            user_agent: String::new(),
            success,
            error_message: None,
        }
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error_message = error;
        self
    }

    pub fn with_client(mut self, ip: String, user_agent: String) -> Self {
        self.ip = ip;
        self.user_agent = user_agent;
        self
    }

    pub fn into_audit_log(self, id: Uuid) -> AuditLog {
        AuditLog {
            id,
            user_id: self.user_id,
            application: self.application,
            message: self.message,
            timestamp: self.timestamp,
            ip: self.ip,
            user_agent: self.user_agent,
            success: self.success,
            error_message: self.error_message,
        }
    }
}
